//! Error types for the tunnel core
//!
//! This module defines all custom error types used throughout the crate.

use std::io;
use thiserror::Error;

/// Main error type for tunnel operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// No protocol is both supported and present in the server's capabilities
    #[error("server does not have any supported capability")]
    NoSupportedCapability,

    /// The transport could not be built
    #[error("transport dial failed: {0}")]
    Dial(#[source] io::Error),

    /// The transport closed before the close signal could be installed,
    /// typically because the dial was interrupted from outside
    #[error("connection already closed")]
    ConnAlreadyClosed,

    /// The encrypted session handshake failed
    #[error("session handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The application-layer API session could not be started
    #[error("api session start failed: {0}")]
    SessionStart(String),

    /// An operation was attempted on a closed tunnel
    #[error("tunnel is closed")]
    TunnelClosed,

    /// A single port forward could not be opened; the tunnel remains usable
    #[error("port forward open failed: {0}")]
    OpenFailed(String),

    /// Terminal failure: observed port forward failures exceeded the threshold
    #[error("tunnel exceeded port forward failure threshold")]
    ExceededForwardFailures,

    /// Terminal failure: the underlying transport closed unexpectedly
    #[error("tunnel closed unexpectedly")]
    UnexpectedClose,

    /// Terminal failure: a keep-alive could not be sent over the session
    #[error("ssh keep alive failed: {0}")]
    KeepAliveFailed(#[source] io::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while negotiating the encrypted session
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The server presented a host key that does not match the server entry
    #[error("unexpected server host key")]
    UnexpectedHostKey,

    /// The server rejected the authentication payload
    #[error("authentication rejected by server")]
    AuthFailed,

    /// The server entry's host key is not valid base64
    #[error("invalid host key encoding: {0}")]
    HostKey(#[from] base64::DecodeError),

    /// SSH protocol failure
    #[error("ssh protocol error: {0}")]
    Ssh(russh::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<russh::Error> for HandshakeError {
    fn from(err: russh::Error) -> Self {
        match err {
            // russh surfaces a rejected host key check as UnknownKey
            russh::Error::UnknownKey => HandshakeError::UnexpectedHostKey,
            other => HandshakeError::Ssh(other),
        }
    }
}

impl TunnelError {
    /// Whether this error indicates the tunnel as a whole has failed,
    /// as opposed to a single operation on it
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TunnelError::ExceededForwardFailures
                | TunnelError::UnexpectedClose
                | TunnelError::KeepAliveFailed(_)
        )
    }
}
