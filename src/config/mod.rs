//! Configuration
//!
//! This module provides configuration types and parsing for the tunnel
//! client. A config file holds a `[tunnel]` table with client behavior and
//! a `[server]` table with the target server entry.

use crate::protocol::TunnelProtocol;
use crate::server_entry::ServerEntry;
use crate::transport::{
    DialConfig, TUNNEL_CONNECT_TIMEOUT, TUNNEL_READ_TIMEOUT, TUNNEL_WRITE_TIMEOUT,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Default number of observed port forward failures a tunnel tolerates
pub const DEFAULT_PORT_FORWARD_FAILURE_THRESHOLD: u32 = 10;

/// Top-level configuration file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel client behavior
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// The server to establish to
    pub server: ServerEntry,
}

/// Tunnel client behavior knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Explicit protocol choice; bypasses the preference order but still
    /// requires the matching server capability
    pub tunnel_protocol: Option<TunnelProtocol>,

    /// Skip the application-layer API session entirely
    pub disable_api: bool,

    /// Abort establishment when the API session handshake fails; when
    /// false the tunnel continues without a session
    pub require_api_handshake: bool,

    /// Observed port forward failures beyond this count fail the tunnel
    pub port_forward_failure_threshold: u32,

    /// Optional upstream HTTP proxy (`host:port`) for outbound dials
    pub upstream_http_proxy_address: Option<String>,

    /// Transport connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Transport read timeout in seconds; 0 disables
    pub read_timeout_secs: u64,

    /// Transport write timeout in seconds; 0 disables
    pub write_timeout_secs: u64,

    /// DNS server to query directly when sockets are bound to a device
    pub bind_to_device_dns_server: Option<IpAddr>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            tunnel_protocol: None,
            disable_api: false,
            require_api_handshake: true,
            port_forward_failure_threshold: DEFAULT_PORT_FORWARD_FAILURE_THRESHOLD,
            upstream_http_proxy_address: None,
            connect_timeout_secs: TUNNEL_CONNECT_TIMEOUT.as_secs(),
            read_timeout_secs: TUNNEL_READ_TIMEOUT.as_secs(),
            write_timeout_secs: TUNNEL_WRITE_TIMEOUT.as_secs(),
            bind_to_device_dns_server: None,
        }
    }
}

impl TunnelConfig {
    /// Build the dial configuration implied by these settings
    ///
    /// The device binding provider is runtime state and is attached by the
    /// embedder afterwards.
    pub fn dial_config(&self) -> DialConfig {
        let optional = |secs: u64| {
            if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            }
        };
        DialConfig {
            upstream_http_proxy_address: self.upstream_http_proxy_address.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: optional(self.read_timeout_secs),
            write_timeout: optional(self.write_timeout_secs),
            device_binder: None,
            dns_server: self.bind_to_device_dns_server,
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}
