//! HTTP-carried byte stream
//!
//! Carries an opaque bytestream inside HTTP exchanges: client-to-server
//! bytes ride in POST bodies, server-to-client bytes come back in
//! responses, and an idle client keeps polling so the server has a place
//! to put downstream data. The carriage can be fronted: the connection
//! and Host header name the fronting domain while the cookie identifies
//! the session to the real endpoint behind it.

use super::{tcp, DialConfig};
use crate::error::TunnelError;
use crate::server_entry::ServerEntry;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{header, Method, Request};
use hyper_util::rt::TokioIo;
use rand::Rng;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Maximum bytes carried in one POST body or response
pub const MEEK_MAX_PAYLOAD_LENGTH: usize = 64 * 1024;

/// Poll interval floor while traffic is flowing
pub const MEEK_MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll interval ceiling while idle
pub const MEEK_MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Idle backoff multiplier between polls
pub const MEEK_POLL_INTERVAL_MULTIPLIER: f64 = 1.5;

/// Deadline for a single HTTP exchange
pub const MEEK_ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Serialize)]
struct MeekCookie<'a> {
    #[serde(rename = "SessionId")]
    session_id: &'a str,
}

struct MeekParams {
    host: String,
    port: u16,
    host_header: String,
    tls: Option<Arc<rustls::ClientConfig>>,
    cookie: String,
    interrupt: CancellationToken,
    dial_config: DialConfig,
}

/// Where the carriage connects and what it claims to be talking to
fn meek_endpoint(
    entry: &ServerEntry,
    fronted: bool,
) -> Result<(String, u16, String, bool), TunnelError> {
    if fronted {
        let domain = entry.meek_fronting_domain.clone().ok_or_else(|| {
            TunnelError::Dial(io::Error::new(
                io::ErrorKind::InvalidInput,
                "server entry has no fronting domain",
            ))
        })?;
        Ok((domain.clone(), 443, domain, true))
    } else {
        let host_header = format!("{}:{}", entry.ip_address, entry.ssh_obfuscated_port);
        Ok((
            entry.ip_address.clone(),
            entry.ssh_obfuscated_port,
            host_header,
            false,
        ))
    }
}

fn make_session_cookie(session_id: &str) -> Result<String, TunnelError> {
    let payload = serde_json::to_vec(&MeekCookie { session_id }).map_err(|err| {
        TunnelError::Dial(io::Error::new(io::ErrorKind::InvalidInput, err))
    })?;
    let name = (b'A' + rand::thread_rng().gen_range(0..26)) as char;
    Ok(format!("{}={}", name, BASE64.encode(payload)))
}

fn fronting_tls_config() -> Result<Arc<rustls::ClientConfig>, TunnelError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = rustls::crypto::ring::default_provider();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|err| {
            TunnelError::Dial(io::Error::new(io::ErrorKind::InvalidInput, err))
        })?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Dial the HTTP carriage and expose it as a byte stream
///
/// The first HTTP connection is established before returning so dial
/// failures surface here; afterwards a relay task pumps bytes between the
/// returned stream and sequential HTTP exchanges, reconnecting once per
/// failed exchange.
pub(crate) async fn dial_meek(
    entry: &ServerEntry,
    fronted: bool,
    session_id: &str,
    interrupt: CancellationToken,
    dial_config: &DialConfig,
) -> Result<DuplexStream, TunnelError> {
    let (host, port, host_header, use_tls) = meek_endpoint(entry, fronted)?;
    let params = MeekParams {
        host,
        port,
        host_header,
        tls: if use_tls {
            Some(fronting_tls_config()?)
        } else {
            None
        },
        cookie: make_session_cookie(session_id)?,
        interrupt,
        dial_config: dial_config.clone(),
    };

    let sender = meek_connect(&params).await?;

    let (local, remote) = tokio::io::duplex(MEEK_MAX_PAYLOAD_LENGTH);
    tokio::spawn(relay(remote, sender, params));
    Ok(local)
}

async fn meek_connect(
    params: &MeekParams,
) -> Result<http1::SendRequest<Full<Bytes>>, TunnelError> {
    let stream = tcp::connect_tcp(
        &params.host,
        params.port,
        &params.interrupt,
        &params.dial_config,
    )
    .await?;

    match &params.tls {
        Some(config) => {
            let server_name = rustls::pki_types::ServerName::try_from(params.host.clone())
                .map_err(|err| {
                    TunnelError::Dial(io::Error::new(io::ErrorKind::InvalidInput, err))
                })?;
            let connector = TlsConnector::from(config.clone());
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(TunnelError::Dial)?;
            http_handshake(TokioIo::new(tls_stream)).await
        }
        None => http_handshake(TokioIo::new(stream)).await,
    }
}

async fn http_handshake<T>(io: T) -> Result<http1::SendRequest<Full<Bytes>>, TunnelError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(io).await.map_err(|err| {
        TunnelError::Dial(io::Error::new(io::ErrorKind::ConnectionAborted, err))
    })?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!("meek connection closed: {}", err);
        }
    });
    Ok(sender)
}

async fn relay(
    mut local: DuplexStream,
    mut sender: http1::SendRequest<Full<Bytes>>,
    params: MeekParams,
) {
    let mut read_buf = vec![0u8; MEEK_MAX_PAYLOAD_LENGTH];
    let mut poll_interval = MEEK_MIN_POLL_INTERVAL;

    loop {
        let read = tokio::select! {
            _ = params.interrupt.cancelled() => return,
            result = local.read(&mut read_buf) => match result {
                Ok(0) | Err(_) => return,
                Ok(read) => read,
            },
            _ = tokio::time::sleep(poll_interval) => 0,
        };

        let body = Bytes::copy_from_slice(&read_buf[..read]);
        let response = match round_trip(&mut sender, &params, body.clone()).await {
            Ok(response) => response,
            Err(err) => {
                // One reconnect per exchange; the payload is retried so no
                // carried bytes are lost.
                debug!("meek round trip failed, reconnecting: {}", err);
                sender = match meek_connect(&params).await {
                    Ok(sender) => sender,
                    Err(_) => return,
                };
                match round_trip(&mut sender, &params, body).await {
                    Ok(response) => response,
                    Err(_) => return,
                }
            }
        };

        if !response.is_empty() && local.write_all(&response).await.is_err() {
            return;
        }

        poll_interval = if read > 0 || !response.is_empty() {
            MEEK_MIN_POLL_INTERVAL
        } else {
            poll_interval
                .mul_f64(MEEK_POLL_INTERVAL_MULTIPLIER)
                .min(MEEK_MAX_POLL_INTERVAL)
        };
    }
}

async fn round_trip(
    sender: &mut http1::SendRequest<Full<Bytes>>,
    params: &MeekParams,
    body: Bytes,
) -> io::Result<Bytes> {
    let to_io = |err: hyper::Error| io::Error::new(io::ErrorKind::BrokenPipe, err);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(header::HOST, params.host_header.as_str())
        .header(header::COOKIE, params.cookie.as_str())
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Full::new(body))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    let response = tokio::time::timeout(MEEK_ROUND_TRIP_TIMEOUT, sender.send_request(request))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "meek exchange timed out"))?
        .map_err(to_io)?;

    if !response.status().is_success() {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("meek endpoint returned {}", response.status()),
        ));
    }

    let collected = tokio::time::timeout(MEEK_ROUND_TRIP_TIMEOUT, response.into_body().collect())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "meek response timed out"))?
        .map_err(to_io)?;
    Ok(collected.to_bytes())
}
