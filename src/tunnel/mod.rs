//! Tunnel core
//!
//! A [`Tunnel`] is one established connection to a server: an encrypted,
//! multiplexed session over an obfuscated transport, carrying any number
//! of port forwards. The tunnel owns a single background supervisor that
//! drives keep-alives and stats and escalates failures to the
//! [`TunnelOwner`]; port forwards observe the tunnel only through a lossy
//! failure channel so they never extend its life.

mod establish;
mod supervisor;

pub use establish::{establish_tunnel, TunnelRuntime};
pub use supervisor::{
    SSH_KEEP_ALIVE_PAYLOAD_MAX_BYTES, SSH_KEEP_ALIVE_PERIOD_MAX, SSH_KEEP_ALIVE_PERIOD_MIN,
    STATUS_REQUEST_PERIOD_MAX, STATUS_REQUEST_PERIOD_MIN,
};

use crate::api::ApiSession;
use crate::error::TunnelError;
use crate::notice::Notifier;
use crate::protocol::TunnelProtocol;
use crate::server_entry::ServerEntry;
use crate::ssh::SshSession;
use crate::stats::StatsService;
use crate::transport::{ConnHandle, TunnelStream};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// The contract upstream components (e.g. a local proxy) see
#[async_trait]
pub trait Tunneler: Send + Sync {
    /// Open a flow to `remote_addr` through the tunnel
    ///
    /// `downstream` is an optional paired connection that is closed when
    /// the returned stream closes, e.g. the proxy's client socket.
    async fn dial(
        &self,
        remote_addr: &str,
        downstream: Option<Box<dyn TunnelStream>>,
    ) -> Result<Box<dyn TunnelStream>, TunnelError>;

    /// Report that a component using this tunnel has failed
    async fn signal_component_failure(&self);
}

/// Owner of zero or more tunnels, notified when one becomes unusable
///
/// The notification is fire-and-forget; the owner is responsible for
/// calling [`Tunnel::close`] afterwards.
pub trait TunnelOwner: Send + Sync {
    /// The tunnel's supervisor has declared it failed
    fn signal_tunnel_failure(&self, tunnel: &Arc<Tunnel>);
}

/// Decides which port forward I/O errors count toward the failure
/// threshold
///
/// The default counts every error, conservatively treating origin-side
/// problems the same as tunnel-side ones.
pub type FailureClassifier = Arc<dyn Fn(&io::Error) -> bool + Send + Sync>;

/// A classifier that counts every I/O error
pub fn count_all_failures() -> FailureClassifier {
    Arc::new(|_| true)
}

struct TunnelState {
    closed: bool,
    supervisor: Option<JoinHandle<()>>,
}

pub(crate) struct SupervisorParts {
    pub(crate) failures_rx: mpsc::Receiver<u32>,
    pub(crate) shutdown_rx: broadcast::Receiver<()>,
    pub(crate) closed_signal: oneshot::Receiver<()>,
}

/// One established tunnel to a server
pub struct Tunnel {
    server_entry: ServerEntry,
    protocol: TunnelProtocol,
    conn: ConnHandle,
    session: Arc<dyn SshSession>,
    api_session: OnceLock<Arc<dyn ApiSession>>,
    stats: Arc<dyn StatsService>,
    notifier: Arc<dyn Notifier>,
    classifier: FailureClassifier,
    threshold: u32,
    failures_tx: mpsc::Sender<u32>,
    shutdown_tx: broadcast::Sender<()>,
    state: Mutex<TunnelState>,
    supervisor_parts: Mutex<Option<SupervisorParts>>,
}

impl Tunnel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        server_entry: ServerEntry,
        protocol: TunnelProtocol,
        conn: ConnHandle,
        closed_signal: oneshot::Receiver<()>,
        session: Arc<dyn SshSession>,
        stats: Arc<dyn StatsService>,
        notifier: Arc<dyn Notifier>,
        classifier: FailureClassifier,
        threshold: u32,
    ) -> Arc<Tunnel> {
        // The failure channel holds the threshold number of reports so
        // senders can drop without blocking.
        let (failures_tx, failures_rx) = mpsc::channel(threshold.max(1) as usize);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Arc::new(Tunnel {
            server_entry,
            protocol,
            conn,
            session,
            api_session: OnceLock::new(),
            stats,
            notifier,
            classifier,
            threshold,
            failures_tx,
            shutdown_tx,
            state: Mutex::new(TunnelState {
                closed: false,
                supervisor: None,
            }),
            supervisor_parts: Mutex::new(Some(SupervisorParts {
                failures_rx,
                shutdown_rx,
                closed_signal,
            })),
        })
    }

    /// The server this tunnel is established to
    pub fn server_entry(&self) -> &ServerEntry {
        &self.server_entry
    }

    /// The protocol this tunnel was established with
    pub fn protocol(&self) -> TunnelProtocol {
        self.protocol
    }

    /// Whether the tunnel has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("tunnel state lock poisoned").closed
    }

    pub(crate) fn session(&self) -> &Arc<dyn SshSession> {
        &self.session
    }

    pub(crate) fn stats(&self) -> &Arc<dyn StatsService> {
        &self.stats
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub(crate) fn threshold(&self) -> u32 {
        self.threshold
    }

    pub(crate) fn api_session(&self) -> Option<&Arc<dyn ApiSession>> {
        self.api_session.get()
    }

    pub(crate) fn set_api_session(&self, session: Arc<dyn ApiSession>) {
        let _ = self.api_session.set(session);
    }

    pub(crate) fn take_supervisor_parts(&self) -> Option<SupervisorParts> {
        self.supervisor_parts
            .lock()
            .expect("supervisor parts lock poisoned")
            .take()
    }

    pub(crate) fn set_supervisor(&self, handle: JoinHandle<()>) {
        self.state
            .lock()
            .expect("tunnel state lock poisoned")
            .supervisor = Some(handle);
    }

    /// Open a port forward to `remote_addr` (`"host:port"`)
    ///
    /// A failed open contributes one token to the failure channel; tokens
    /// are dropped when the channel is full.
    pub async fn open_forward(
        &self,
        remote_addr: &str,
        downstream: Option<Box<dyn TunnelStream>>,
    ) -> Result<TunneledStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::TunnelClosed);
        }

        let stream = match self.session.open_stream(remote_addr).await {
            Ok(stream) => stream,
            Err(err) => {
                let _ = self.failures_tx.try_send(1);
                return Err(err);
            }
        };

        // No accounting without an API session (api disabled or tolerated
        // handshake failure)
        let stream = match self.api_session.get() {
            Some(api) => self.stats.new_accounting_stream(
                stream,
                &api.stats_server_id(),
                &api.stats_regexes(),
                remote_addr,
            ),
            None => stream,
        };

        Ok(TunneledStream {
            inner: stream,
            failures: self.failures_tx.clone(),
            classifier: self.classifier.clone(),
            downstream,
            notifier: self.notifier.clone(),
        })
    }

    /// Stop operating the tunnel and close the underlying transport
    ///
    /// Idempotent and safe to call concurrently. The first call waits for
    /// the supervisor to drain, so no notices, keep-alives or stats
    /// submissions happen after it returns.
    pub async fn close(&self) {
        let supervisor = {
            let mut state = self.state.lock().expect("tunnel state lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            let _ = self.shutdown_tx.send(());
            state.supervisor.take()
        };

        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        self.session.close().await;
        self.conn.interrupt();
    }
}

#[async_trait]
impl Tunneler for Tunnel {
    async fn dial(
        &self,
        remote_addr: &str,
        downstream: Option<Box<dyn TunnelStream>>,
    ) -> Result<Box<dyn TunnelStream>, TunnelError> {
        let forward = self.open_forward(remote_addr, downstream).await?;
        Ok(Box::new(forward))
    }

    async fn signal_component_failure(&self) {
        self.notifier
            .alert("tunnel received component failure signal");
        self.close().await;
    }
}

/// One port forward flow inside a tunnel
///
/// Wraps the session stream to observe I/O errors and report them to the
/// tunnel's failure channel, and to cascade its close to an optional
/// paired downstream connection.
pub struct TunneledStream {
    inner: Box<dyn TunnelStream>,
    failures: mpsc::Sender<u32>,
    classifier: FailureClassifier,
    downstream: Option<Box<dyn TunnelStream>>,
    notifier: Arc<dyn Notifier>,
}

impl TunneledStream {
    fn report_failure(&self, err: &io::Error) {
        if (self.classifier)(err) {
            // Drop the report when the channel is full; the supervisor
            // only needs threshold-many observations.
            let _ = self.failures.try_send(1);
        }
    }
}

impl AsyncRead for TunneledStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Err(err)) => {
                this.report_failure(&err);
                Poll::Ready(Err(err))
            }
            other => other,
        }
    }
}

impl AsyncWrite for TunneledStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Ready(Err(err)) => {
                this.report_failure(&err);
                Poll::Ready(Err(err))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Close the downstream peer first; its errors are logged, not
        // propagated.
        if let Some(downstream) = &mut this.downstream {
            match Pin::new(downstream).poll_shutdown(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    if let Err(err) = result {
                        this.notifier
                            .warning(&format!("downstream close error: {}", err));
                    }
                    this.downstream = None;
                }
            }
        }

        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
