//! Tunnel protocol selection
//!
//! A tunnel speaks one of four protocols, from plain SSH over TCP up to
//! obfuscated SSH carried inside fronted HTTP exchanges. Selection maps
//! the server's capability tags and an optional client requirement to a
//! concrete protocol.

use crate::error::TunnelError;
use crate::server_entry::ServerEntry;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a concrete tunnel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelProtocol {
    /// Plain SSH over TCP
    #[serde(rename = "SSH")]
    Ssh,

    /// Obfuscated SSH over TCP
    #[serde(rename = "OSSH")]
    ObfuscatedSsh,

    /// Obfuscated SSH carried in HTTP exchanges, addressed directly
    #[serde(rename = "MEEK-OSSH")]
    Meek,

    /// Obfuscated SSH carried in HTTP exchanges through a fronting domain
    #[serde(rename = "FRONTED-MEEK-OSSH")]
    FrontedMeek,
}

/// Supported protocols in default preference order
pub const SUPPORTED_TUNNEL_PROTOCOLS: [TunnelProtocol; 4] = [
    TunnelProtocol::FrontedMeek,
    TunnelProtocol::Meek,
    TunnelProtocol::ObfuscatedSsh,
    TunnelProtocol::Ssh,
];

impl TunnelProtocol {
    /// Wire name of the protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProtocol::Ssh => "SSH",
            TunnelProtocol::ObfuscatedSsh => "OSSH",
            TunnelProtocol::Meek => "MEEK-OSSH",
            TunnelProtocol::FrontedMeek => "FRONTED-MEEK-OSSH",
        }
    }

    /// The capability tag a server must advertise for this protocol
    ///
    /// The obfuscation suffix is stripped: carriage capabilities imply the
    /// obfuscation capability.
    pub fn required_capability(&self) -> &'static str {
        let name = self.as_str();
        name.strip_suffix("-OSSH").unwrap_or(name)
    }

    /// Whether the protocol carries bytes in HTTP exchanges
    pub fn uses_meek(&self) -> bool {
        matches!(self, TunnelProtocol::Meek | TunnelProtocol::FrontedMeek)
    }

    /// Whether the HTTP carriage goes through a fronting domain
    pub fn uses_fronting(&self) -> bool {
        matches!(self, TunnelProtocol::FrontedMeek)
    }

    /// Whether the stream obfuscation layer is stacked under the session
    pub fn uses_obfuscation(&self) -> bool {
        !matches!(self, TunnelProtocol::Ssh)
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the tunnel protocol for a server
///
/// An explicit requirement bypasses the preference order but still needs
/// the matching capability. Otherwise the first protocol in
/// [`SUPPORTED_TUNNEL_PROTOCOLS`] whose capability the server advertises
/// wins.
pub fn select_protocol(
    required: Option<TunnelProtocol>,
    entry: &ServerEntry,
) -> Result<TunnelProtocol, TunnelError> {
    match required {
        Some(protocol) => {
            if entry.has_capability(protocol.required_capability()) {
                Ok(protocol)
            } else {
                Err(TunnelError::NoSupportedCapability)
            }
        }
        None => SUPPORTED_TUNNEL_PROTOCOLS
            .iter()
            .copied()
            .find(|protocol| entry.has_capability(protocol.required_capability()))
            .ok_or(TunnelError::NoSupportedCapability),
    }
}
