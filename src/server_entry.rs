//! Server entries
//!
//! A [`ServerEntry`] describes one remote server: where to reach it, which
//! protocols it speaks and the credentials for its encrypted session. The
//! entry database itself is owned by the embedder; the core only reads
//! entries and reports successes through [`ServerRegistry`].

use serde::{Deserialize, Serialize};

/// A single remote server and the credentials needed to reach it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Server IP address, also the key for stats and registry operations
    pub ip_address: String,

    /// Geographic region code, informational only
    #[serde(default)]
    pub region: String,

    /// Capability tags, e.g. `SSH`, `OSSH`, `MEEK`, `FRONTED-MEEK`
    pub capabilities: Vec<String>,

    /// TCP port for the plain encrypted session
    pub ssh_port: u16,

    /// TCP port for obfuscated carriage
    #[serde(default)]
    pub ssh_obfuscated_port: u16,

    /// Shared key for the stream obfuscation layer
    #[serde(default)]
    pub ssh_obfuscated_key: String,

    /// Base64 of the server's wire-format host public key
    pub ssh_host_key: String,

    /// Session user name
    pub ssh_username: String,

    /// Session password, combined with the session id into the auth payload
    pub ssh_password: String,

    /// Fronting domain for the fronted HTTP carriage, when that capability
    /// is present
    #[serde(default)]
    pub meek_fronting_domain: Option<String>,
}

impl ServerEntry {
    /// Whether the entry advertises the given capability tag
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Ranking interface of the externally owned server entry database
///
/// A successful establishment promotes the entry so it is among the first
/// candidates on the next run.
pub trait ServerRegistry: Send + Sync {
    /// Elevate the entry with this IP address to first rank
    fn promote(&self, ip_address: &str);
}
