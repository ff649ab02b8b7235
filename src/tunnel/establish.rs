//! Tunnel establishment
//!
//! Sequences protocol selection, transport dialing, the encrypted session
//! handshake and the application-layer session bring-up into one
//! operation, with the transport guaranteed to be closed and unregistered
//! exactly once if any stage fails.

use super::supervisor;
use super::{FailureClassifier, Tunnel, TunnelOwner, Tunneler};
use crate::api::ApiService;
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::notice::Notifier;
use crate::protocol::select_protocol;
use crate::server_entry::{ServerEntry, ServerRegistry};
use crate::ssh;
use crate::stats::StatsService;
use crate::transport::{self, ConnHandle, DialConfig, PendingConns};
use std::sync::Arc;

/// Externally owned collaborators a tunnel operates against
#[derive(Clone)]
pub struct TunnelRuntime {
    /// Server entry ranking
    pub server_registry: Arc<dyn ServerRegistry>,

    /// Transfer-byte accounting
    pub stats: Arc<dyn StatsService>,

    /// Application-layer API; unused when the API is disabled in config
    pub api: Option<Arc<dyn ApiService>>,

    /// Operational notice sink
    pub notifier: Arc<dyn Notifier>,

    /// Which port forward I/O errors count toward the failure threshold
    pub failure_classifier: FailureClassifier,

    /// Transport dial options
    pub dial_config: DialConfig,
}

/// Closes and unregisters a dialed transport unless disarmed
struct DialCleanup<'a> {
    conn: &'a ConnHandle,
    pending: &'a PendingConns,
    armed: bool,
}

impl<'a> DialCleanup<'a> {
    fn new(conn: &'a ConnHandle, pending: &'a PendingConns) -> Self {
        DialCleanup {
            conn,
            pending,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DialCleanup<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.interrupt();
            self.pending.remove(self.conn);
        }
    }
}

/// Establish a tunnel to a server
///
/// On success the supervisor task is already running and the returned
/// tunnel accepts port forwards. On failure the transport has been closed
/// and removed from `pending` exactly once.
pub async fn establish_tunnel(
    config: &TunnelConfig,
    runtime: &TunnelRuntime,
    session_id: &str,
    pending: &PendingConns,
    entry: ServerEntry,
    owner: Arc<dyn TunnelOwner>,
) -> Result<Arc<Tunnel>, TunnelError> {
    let protocol = select_protocol(config.tunnel_protocol, &entry)?;

    let fronting = match (protocol.uses_fronting(), &entry.meek_fronting_domain) {
        (true, Some(domain)) => format!(" fronted by {}", domain),
        _ => String::new(),
    };
    runtime.notifier.info(&format!(
        "connecting to {} ({}) with protocol {}{}",
        entry.ip_address, entry.region, protocol, fronting
    ));

    let (stream, conn, closed_signal) = transport::dial(
        &entry,
        protocol,
        session_id,
        pending,
        &runtime.dial_config,
    )
    .await?;

    // From here on, any failure must tear the transport down
    let mut cleanup = DialCleanup::new(&conn, pending);

    let session = ssh::handshake(stream, &entry, session_id).await?;

    let tunnel = Tunnel::new(
        entry,
        protocol,
        conn.clone(),
        closed_signal,
        Arc::new(session),
        runtime.stats.clone(),
        runtime.notifier.clone(),
        runtime.failure_classifier.clone(),
        config.port_forward_failure_threshold,
    );

    if !config.disable_api {
        if let Some(api) = &runtime.api {
            runtime.notifier.info(&format!(
                "starting session for {}",
                tunnel.server_entry().ip_address
            ));
            let tunneler: Arc<dyn Tunneler> = tunnel.clone();
            match api.new_session(tunneler, session_id).await {
                Ok(api_session) => tunnel.set_api_session(api_session),
                Err(err) if config.require_api_handshake => {
                    return Err(TunnelError::SessionStart(err.to_string()));
                }
                Err(err) => runtime.notifier.warning(&format!(
                    "continuing without api session for {}: {}",
                    tunnel.server_entry().ip_address,
                    err
                )),
            }
        }
    }

    // Network operations are complete; the dial is no longer interruptible
    pending.remove(&conn);
    cleanup.disarm();

    runtime
        .server_registry
        .promote(&tunnel.server_entry().ip_address);

    let handle = supervisor::spawn(tunnel.clone(), owner);
    tunnel.set_supervisor(handle);

    Ok(tunnel)
}
