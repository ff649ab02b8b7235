//! Direct TCP transport
//!
//! Dials the server (or an upstream HTTP proxy in front of it) with the
//! configured connect timeout, socket options and optional device
//! binding. The connect races the dial's interrupt token so an external
//! shutdown aborts it promptly.

use super::dns;
use super::{DialConfig, SocketOpts};
use crate::error::TunnelError;
use crate::helper::split_host_port;
use crate::protocol::TunnelProtocol;
use crate::server_entry::ServerEntry;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Dial the direct transport for a non-meek protocol
pub(crate) async fn dial_direct(
    entry: &ServerEntry,
    protocol: TunnelProtocol,
    interrupt: &CancellationToken,
    dial_config: &DialConfig,
) -> Result<TcpStream, TunnelError> {
    let port = if protocol == TunnelProtocol::Ssh {
        entry.ssh_port
    } else {
        entry.ssh_obfuscated_port
    };
    connect_tcp(&entry.ip_address, port, interrupt, dial_config).await
}

/// Connect to `host:port`, via the upstream HTTP proxy when configured
pub(crate) async fn connect_tcp(
    host: &str,
    port: u16,
    interrupt: &CancellationToken,
    dial_config: &DialConfig,
) -> Result<TcpStream, TunnelError> {
    match &dial_config.upstream_http_proxy_address {
        Some(proxy) => {
            let (proxy_host, proxy_port) = split_host_port(proxy).ok_or_else(|| {
                TunnelError::Dial(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid upstream proxy address: {}", proxy),
                ))
            })?;
            let mut stream =
                connect_host(proxy_host, proxy_port, interrupt, dial_config).await?;
            proxy_connect(&mut stream, host, port, dial_config)
                .await
                .map_err(TunnelError::Dial)?;
            Ok(stream)
        }
        None => connect_host(host, port, interrupt, dial_config).await,
    }
}

async fn connect_host(
    host: &str,
    port: u16,
    interrupt: &CancellationToken,
    dial_config: &DialConfig,
) -> Result<TcpStream, TunnelError> {
    let ip = dns::resolve_host(host, dial_config).await?;
    let addr = SocketAddr::new(ip, port);

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(TunnelError::Dial)?;

    if let Some(binder) = &dial_config.device_binder {
        let sock_ref = socket2::SockRef::from(&socket);
        binder.bind_to_device(&sock_ref).map_err(TunnelError::Dial)?;
    }

    let stream = tokio::select! {
        _ = interrupt.cancelled() => {
            return Err(TunnelError::Dial(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "dial interrupted",
            )));
        }
        connected = tokio::time::timeout(dial_config.connect_timeout, socket.connect(addr)) => {
            connected
                .map_err(|_| {
                    TunnelError::Dial(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out", addr),
                    ))
                })?
                .map_err(TunnelError::Dial)?
        }
    };

    SocketOpts::default()
        .apply(&stream)
        .map_err(TunnelError::Dial)?;

    debug!("connected to {}", addr);
    Ok(stream)
}

/// Issue an HTTP CONNECT for `host:port` on an established proxy stream
async fn proxy_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    dial_config: &DialConfig,
) -> io::Result<()> {
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
        host = host,
        port = port
    );
    stream.write_all(request.as_bytes()).await?;

    let response =
        tokio::time::timeout(dial_config.connect_timeout, read_http_head(stream)).await??;

    let status_line = response.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let _version = parts.next();
    match parts.next() {
        Some("200") => Ok(()),
        Some(code) => Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("upstream proxy refused CONNECT: {}", code),
        )),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "malformed upstream proxy response",
        )),
    }
}

/// Read up to and including the blank line terminating an HTTP head
async fn read_http_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 16 * 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upstream proxy response head too large",
            ));
        }
        let read = stream.read(&mut byte).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream proxy closed during CONNECT",
            ));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_dial_config() -> DialConfig {
        DialConfig {
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let interrupt = CancellationToken::new();
        let dial_config = test_dial_config();
        let connect = connect_tcp(
            "127.0.0.1",
            addr.port(),
            &interrupt,
            &dial_config,
        );
        let (stream, accepted) = tokio::join!(connect, listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let interrupt = CancellationToken::new();
        let result = connect_tcp(
            "127.0.0.1",
            addr.port(),
            &interrupt,
            &test_dial_config(),
        )
        .await;
        assert!(matches!(result, Err(TunnelError::Dial(_))));
    }

    #[tokio::test]
    async fn test_connect_interrupted() {
        let interrupt = CancellationToken::new();
        interrupt.cancel();

        // RFC 5737 TEST-NET address; the select observes the cancelled
        // token before the connect can complete
        let result = connect_tcp("192.0.2.1", 80, &interrupt, &test_dial_config()).await;
        match result {
            Err(TunnelError::Dial(err)) => {
                assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted)
            }
            other => panic!("expected interrupted dial, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_proxy_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let proxy = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let read = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..read]).into_owned();
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let dial_config = DialConfig {
            upstream_http_proxy_address: Some(format!("127.0.0.1:{}", proxy_addr.port())),
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let interrupt = CancellationToken::new();
        let stream = connect_tcp("203.0.113.9", 443, &interrupt, &dial_config)
            .await
            .unwrap();
        drop(stream);

        let request = proxy.await.unwrap();
        assert!(request.starts_with("CONNECT 203.0.113.9:443 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_proxy_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });

        let dial_config = DialConfig {
            upstream_http_proxy_address: Some(format!("127.0.0.1:{}", proxy_addr.port())),
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let interrupt = CancellationToken::new();
        let result = connect_tcp("203.0.113.9", 443, &interrupt, &dial_config).await;
        assert!(matches!(result, Err(TunnelError::Dial(_))));
    }
}
