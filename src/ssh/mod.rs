//! Encrypted session layer
//!
//! Runs the SSH handshake over an already-built transport and exposes the
//! authenticated, multiplexed session behind the [`SshSession`] trait.
//! The server is authenticated by comparing its wire-format public key
//! byte-for-byte against the base64-decoded key in the server entry; the
//! client authenticates with a password credential that packs the session
//! id and entry password into a small JSON document.

use crate::error::{HandshakeError, TunnelError};
use crate::helper::split_host_port;
use crate::server_entry::ServerEntry;
use crate::transport::TunnelStream;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client;
use russh::Disconnect;
use serde::Serialize;
use std::io;
use std::sync::Arc;

/// An authenticated multiplexed session over the tunnel transport
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Open a multiplexed stream to `remote_addr` (`"host:port"`)
    async fn open_stream(&self, remote_addr: &str) -> Result<Box<dyn TunnelStream>, TunnelError>;

    /// Send an application-level keep-alive
    ///
    /// `padding` is drawn fresh for every send so idle tunnels do not
    /// produce a fixed-size heartbeat.
    async fn send_keepalive(&self, padding: Vec<u8>) -> io::Result<()>;

    /// Close the session
    async fn close(&self);
}

/// The password credential document
#[derive(Serialize)]
struct AuthPayload<'a> {
    #[serde(rename = "SessionId")]
    session_id: &'a str,
    #[serde(rename = "SshPassword")]
    ssh_password: &'a str,
}

/// Handler that accepts exactly the host key named in the server entry
struct HostKeyCheck {
    expected_public_key: Vec<u8>,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let matches = server_public_key
            .to_bytes()
            .map(|wire| wire == self.expected_public_key)
            .unwrap_or(false);
        Ok(matches)
    }
}

/// Negotiate the encrypted session over `stream`
pub async fn handshake(
    stream: Box<dyn TunnelStream>,
    entry: &ServerEntry,
    session_id: &str,
) -> Result<RusshSession, TunnelError> {
    let expected_public_key = BASE64
        .decode(&entry.ssh_host_key)
        .map_err(HandshakeError::from)?;

    let config = Arc::new(client::Config::default());
    let handler = HostKeyCheck {
        expected_public_key,
    };

    let mut handle = client::connect_stream(config, stream, handler)
        .await
        .map_err(HandshakeError::from)?;

    let password = serde_json::to_string(&AuthPayload {
        session_id,
        ssh_password: &entry.ssh_password,
    })
    .map_err(|err| HandshakeError::Io(io::Error::new(io::ErrorKind::InvalidData, err)))?;

    match handle
        .authenticate_password(entry.ssh_username.clone(), password)
        .await
        .map_err(HandshakeError::from)?
    {
        client::AuthResult::Success => {}
        client::AuthResult::Failure { .. } => return Err(HandshakeError::AuthFailed.into()),
    }

    Ok(RusshSession { handle })
}

/// Production [`SshSession`] backed by a russh client session
pub struct RusshSession {
    handle: client::Handle<HostKeyCheck>,
}

#[async_trait]
impl SshSession for RusshSession {
    async fn open_stream(&self, remote_addr: &str) -> Result<Box<dyn TunnelStream>, TunnelError> {
        let (host, port) = split_host_port(remote_addr).ok_or_else(|| {
            TunnelError::OpenFailed(format!("invalid remote address: {}", remote_addr))
        })?;

        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|err| TunnelError::OpenFailed(err.to_string()))?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn send_keepalive(&self, _padding: Vec<u8>) -> io::Result<()> {
        // The keepalive global request carries no caller payload; padding
        // randomization rides at the obfuscation layer instead.
        self.handle
            .send_keepalive(true)
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::BrokenPipe, err))
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
