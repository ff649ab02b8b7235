//! Tunnel supervisor
//!
//! Every tunnel runs exactly one supervisor task for its lifetime. It
//! drives two randomized timers (periodic stats submission and
//! application-level keep-alives), drains the port forward failure
//! channel, and watches the transport close signal and the shutdown
//! broadcast. Timer periods are drawn fresh for every firing; an idle
//! tunnel with fixed-period heartbeats would be trivially
//! fingerprintable.

use super::{SupervisorParts, Tunnel, TunnelOwner};
use crate::api::ApiSession;
use crate::error::TunnelError;
use crate::helper::{make_random_padding, make_random_period};
use crate::notice::Notifier;
use crate::ssh::SshSession;
use crate::stats::StatsService;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Minimum delay before the next periodic stats submission
pub const STATUS_REQUEST_PERIOD_MIN: Duration = Duration::from_secs(5 * 60);

/// Maximum delay before the next periodic stats submission
pub const STATUS_REQUEST_PERIOD_MAX: Duration = Duration::from_secs(10 * 60);

/// Minimum delay before the next keep-alive
pub const SSH_KEEP_ALIVE_PERIOD_MIN: Duration = Duration::from_secs(60);

/// Maximum delay before the next keep-alive
pub const SSH_KEEP_ALIVE_PERIOD_MAX: Duration = Duration::from_secs(120);

/// Upper bound for the keep-alive padding draw
pub const SSH_KEEP_ALIVE_PAYLOAD_MAX_BYTES: usize = 256;

/// Start the supervisor task for an established tunnel
pub(crate) fn spawn(tunnel: Arc<Tunnel>, owner: Arc<dyn TunnelOwner>) -> JoinHandle<()> {
    tokio::spawn(operate_tunnel(tunnel, owner))
}

async fn operate_tunnel(tunnel: Arc<Tunnel>, owner: Arc<dyn TunnelOwner>) {
    let Some(parts) = tunnel.take_supervisor_parts() else {
        return;
    };
    let SupervisorParts {
        mut failures_rx,
        mut shutdown_rx,
        mut closed_signal,
    } = parts;

    let next_stats_period =
        || make_random_period(STATUS_REQUEST_PERIOD_MIN, STATUS_REQUEST_PERIOD_MAX);
    let next_keepalive_period =
        || make_random_period(SSH_KEEP_ALIVE_PERIOD_MIN, SSH_KEEP_ALIVE_PERIOD_MAX);

    let stats_timer = tokio::time::sleep(next_stats_period());
    tokio::pin!(stats_timer);
    let keepalive_timer = tokio::time::sleep(next_keepalive_period());
    tokio::pin!(keepalive_timer);

    let ip_address = tunnel.server_entry().ip_address.clone();
    let threshold = tunnel.threshold();
    // Only this task touches the failure total
    let mut failure_total: u32 = 0;
    let mut terminal: Option<TunnelError> = None;

    while terminal.is_none() {
        tokio::select! {
            _ = stats_timer.as_mut() => {
                send_stats(&tunnel).await;
                stats_timer.as_mut().reset(Instant::now() + next_stats_period());
            }

            _ = keepalive_timer.as_mut() => {
                let padding = make_random_padding(0, SSH_KEEP_ALIVE_PAYLOAD_MAX_BYTES);
                if let Err(err) = tunnel.session().send_keepalive(padding).await {
                    terminal = Some(TunnelError::KeepAliveFailed(err));
                }
                keepalive_timer.as_mut().reset(Instant::now() + next_keepalive_period());
            }

            Some(reported) = failures_rx.recv() => {
                failure_total += reported;
                tunnel.notifier().info(&format!(
                    "port forward failures for {}: {}",
                    ip_address, failure_total
                ));
                if failure_total > threshold {
                    terminal = Some(TunnelError::ExceededForwardFailures);
                }
            }

            _ = &mut closed_signal => {
                terminal = Some(TunnelError::UnexpectedClose);
            }

            _ = shutdown_rx.recv() => {
                // Owner-initiated shutdown: flush remaining stats and
                // leave without notifying the owner
                send_stats(&tunnel).await;
                tunnel.notifier().info("shutdown operate tunnel");
                return;
            }
        }
    }

    if let Some(err) = terminal {
        tunnel.notifier().alert(&format!(
            "operate tunnel error for {}: {}",
            ip_address, err
        ));
        owner.signal_tunnel_failure(&tunnel);
    }
}

/// Submit any pending stats for this tunnel's server
///
/// Failures are absorbed: the payload goes back to the stats service for
/// a later attempt and the tunnel stays healthy.
async fn send_stats(tunnel: &Tunnel) {
    let Some(api) = tunnel.api_session() else {
        return;
    };
    let ip_address = &tunnel.server_entry().ip_address;
    let Some(payload) = tunnel.stats().get_for_server(ip_address) else {
        return;
    };
    if let Err(err) = api.do_status_request(&payload).await {
        tunnel.notifier().alert(&format!(
            "status request failed for {}: {}",
            ip_address, err
        ));
        tunnel.stats().put_back(ip_address, payload);
    }
}
