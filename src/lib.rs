//! # Burrow - Circumvention Tunnel Client
//!
//! Burrow establishes and operates a single circumvention tunnel between
//! a client and a remote server. The tunnel layers an authenticated,
//! multiplexed SSH session over one of several obfuscated transports and
//! then carries arbitrary TCP-style flows as port forwards for upstream
//! components such as a local SOCKS or HTTP proxy.
//!
//! ## Features
//!
//! - **Protocol selection**: plain SSH, obfuscated SSH, and obfuscated
//!   SSH carried in HTTP exchanges with optional domain fronting, picked
//!   by server capability and client preference
//! - **Interruptible dials**: in-flight connection attempts register in a
//!   pending registry so an external shutdown can abort them
//! - **Supervised operation**: each tunnel runs one background task for
//!   randomized keep-alives, periodic stats submission and failure
//!   escalation
//! - **Failure accounting**: port forward errors feed a lossy bounded
//!   channel; past a threshold the owner is told to replace the tunnel
//!
//! ## Usage
//!
//! ```rust,ignore
//! use burrow::{establish_tunnel, load_config, PendingConns, TunnelRuntime};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("burrow.toml")?;
//!     let pending = PendingConns::new();
//!     let runtime = TunnelRuntime { /* collaborators */ };
//!
//!     let tunnel = establish_tunnel(
//!         &config.tunnel,
//!         &runtime,
//!         &burrow::helper::make_session_id(),
//!         &pending,
//!         config.server.clone(),
//!         owner,
//!     )
//!     .await?;
//!
//!     let flow = tunnel.open_forward("example.com:443", None).await?;
//!     // ... pump bytes ...
//!     tunnel.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Local proxy -> Tunnel.open_forward -> SSH channel -> [obfuscation]
//!     -> TCP or HTTP carriage -> server
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod config;
pub mod error;
pub mod helper;
pub mod notice;
pub mod protocol;
pub mod server_entry;
pub mod ssh;
pub mod stats;
pub mod transport;
pub mod tunnel;

// Re-export commonly used items
pub use config::{load_config, parse_config, Config, TunnelConfig};
pub use error::{HandshakeError, TunnelError};
pub use notice::{Notifier, TracingNotifier};
pub use protocol::{select_protocol, TunnelProtocol, SUPPORTED_TUNNEL_PROTOCOLS};
pub use server_entry::{ServerEntry, ServerRegistry};
pub use stats::{StatsService, TransferStats};
pub use transport::{DialConfig, PendingConns};
pub use tunnel::{
    count_all_failures, establish_tunnel, Tunnel, TunnelOwner, TunnelRuntime, Tunneler,
};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "burrow");
    }
}
