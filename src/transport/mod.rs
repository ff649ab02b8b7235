//! Transport layer
//!
//! This module builds the layered byte stream a tunnel session runs over:
//! a base transport (direct TCP or HTTP carriage), wrapped with interrupt
//! and deadline handling, and optionally topped with the stream
//! obfuscation layer. Every dial is registered in [`PendingConns`] so an
//! external shutdown can force-close in-flight attempts.

mod dns;
mod meek;
mod obfuscated;
mod pending;
mod tcp;

pub use obfuscated::ObfuscatedStream;
pub use pending::PendingConns;

use crate::error::TunnelError;
use crate::protocol::TunnelProtocol;
use crate::server_entry::ServerEntry;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Timeout for establishing the transport connection
pub const TUNNEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Per-read deadline on the tunnel transport; keep-alive traffic arrives
/// well within this
pub const TUNNEL_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-write deadline on the tunnel transport
pub const TUNNEL_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// A reliable, ordered, full-duplex byte stream
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> TunnelStream for T {}

/// Socket options applied to outbound TCP connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout in seconds
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval in seconds
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Binds outbound sockets to a specific network device
///
/// Used on platforms where the tunnel process must pin its own traffic to
/// a physical interface so it does not route through itself.
pub trait DeviceBinder: Send + Sync {
    /// Bind the not-yet-connected socket to the device
    fn bind_to_device(&self, socket: &socket2::Socket) -> io::Result<()>;
}

/// Options for building a transport
#[derive(Clone, Default)]
pub struct DialConfig {
    /// Optional upstream HTTP proxy (`host:port`) reached with CONNECT
    pub upstream_http_proxy_address: Option<String>,

    /// Timeout for the TCP connect
    pub connect_timeout: Duration,

    /// Per-read deadline once connected
    pub read_timeout: Option<Duration>,

    /// Per-write deadline once connected
    pub write_timeout: Option<Duration>,

    /// Device binding provider for pinned-interface environments
    pub device_binder: Option<Arc<dyn DeviceBinder>>,

    /// DNS server queried directly when device binding bypasses the system
    /// resolver
    pub dns_server: Option<IpAddr>,
}

impl std::fmt::Debug for DialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialConfig")
            .field(
                "upstream_http_proxy_address",
                &self.upstream_http_proxy_address,
            )
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("device_binder", &self.device_binder.is_some())
            .field("dns_server", &self.dns_server)
            .finish()
    }
}

#[derive(Debug)]
struct ConnState {
    closed: bool,
    signal: Option<oneshot::Sender<()>>,
}

/// State shared between a dialed stream and its control handle
#[derive(Debug)]
pub(crate) struct ConnShared {
    interrupt: CancellationToken,
    state: Mutex<ConnState>,
}

impl ConnShared {
    fn new() -> Arc<Self> {
        Arc::new(ConnShared {
            interrupt: CancellationToken::new(),
            state: Mutex::new(ConnState {
                closed: false,
                signal: None,
            }),
        })
    }

    fn mark_closed(&self) {
        let mut state = self.state.lock().expect("conn state lock poisoned");
        if !state.closed {
            state.closed = true;
            if let Some(signal) = state.signal.take() {
                let _ = signal.send(());
            }
        }
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Control half of a dialed transport
///
/// The handle outlives the stream: it is registered in [`PendingConns`]
/// for the dial window and kept by the tunnel to force-close the
/// underlying connection.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    id: u64,
    shared: Arc<ConnShared>,
}

impl ConnHandle {
    pub(crate) fn new() -> Self {
        ConnHandle {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            shared: ConnShared::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn shared(&self) -> Arc<ConnShared> {
        self.shared.clone()
    }

    pub(crate) fn interrupt_token(&self) -> CancellationToken {
        self.shared.interrupt.clone()
    }

    /// Force-close the connection, waking any blocked I/O
    pub fn interrupt(&self) {
        self.shared.interrupt.cancel();
        self.shared.mark_closed();
    }

    /// Whether the connection has been observed closed
    pub fn is_closed(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("conn state lock poisoned")
            .closed
    }

    /// Install the one-shot close signal
    ///
    /// Fails with [`TunnelError::ConnAlreadyClosed`] when the connection
    /// died first, e.g. because the dial was interrupted from outside.
    pub fn install_closed_signal(&self) -> Result<oneshot::Receiver<()>, TunnelError> {
        let mut state = self.shared.state.lock().expect("conn state lock poisoned");
        if state.closed {
            return Err(TunnelError::ConnAlreadyClosed);
        }
        let (tx, rx) = oneshot::channel();
        state.signal = Some(tx);
        Ok(rx)
    }
}

/// A dialed transport stream with interrupt and deadline handling
///
/// Reads and writes race the handle's cancellation token; read EOF, any
/// I/O error, a deadline or an interrupt marks the connection closed,
/// which fires the installed close signal exactly once.
pub struct DialedConn {
    inner: Box<dyn TunnelStream>,
    shared: Arc<ConnShared>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl DialedConn {
    fn new(
        inner: Box<dyn TunnelStream>,
        shared: Arc<ConnShared>,
        dial_config: &DialConfig,
    ) -> Self {
        let cancelled = Box::pin(shared.interrupt.clone().cancelled_owned());
        DialedConn {
            inner,
            shared,
            cancelled,
            read_timeout: dial_config.read_timeout,
            write_timeout: dial_config.write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }

    fn interrupted_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, "connection interrupted")
    }
}

impl Drop for DialedConn {
    fn drop(&mut self) {
        // Dropping the stream is the last observation of the connection
        self.shared.mark_closed();
    }
}

impl AsyncRead for DialedConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.shared.mark_closed();
            return Poll::Ready(Err(Self::interrupted_error()));
        }

        let before = buf.filled().len();
        let had_capacity = buf.remaining() > 0;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.read_deadline = None;
                if had_capacity && buf.filled().len() == before {
                    // EOF
                    this.shared.mark_closed();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => {
                this.read_deadline = None;
                this.shared.mark_closed();
                Poll::Ready(Err(err))
            }
            Poll::Pending => {
                if let Some(timeout) = this.read_timeout {
                    let deadline = this
                        .read_deadline
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.read_deadline = None;
                        this.shared.mark_closed();
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "transport read timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for DialedConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.shared.mark_closed();
            return Poll::Ready(Err(Self::interrupted_error()));
        }

        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Ready(Ok(written)) => {
                this.write_deadline = None;
                Poll::Ready(Ok(written))
            }
            Poll::Ready(Err(err)) => {
                this.write_deadline = None;
                this.shared.mark_closed();
                Poll::Ready(Err(err))
            }
            Poll::Pending => {
                if let Some(timeout) = this.write_timeout {
                    let deadline = this
                        .write_deadline
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.write_deadline = None;
                        this.shared.mark_closed();
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "transport write timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.shared.mark_closed();
            return Poll::Ready(Err(Self::interrupted_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.shared.mark_closed();
        Poll::Ready(result)
    }
}

/// Build the layered transport for a protocol
///
/// The connection is registered in `pending` for the whole dial so an
/// external shutdown can interrupt it; the caller unregisters it once the
/// session handshake has succeeded. Returns the byte stream the session
/// handshake runs over, the control handle and the installed close
/// signal.
pub async fn dial(
    entry: &ServerEntry,
    protocol: TunnelProtocol,
    session_id: &str,
    pending: &PendingConns,
    dial_config: &DialConfig,
) -> Result<(Box<dyn TunnelStream>, ConnHandle, oneshot::Receiver<()>), TunnelError> {
    let handle = ConnHandle::new();
    pending.add(handle.clone());

    match dial_layers(entry, protocol, session_id, &handle, dial_config).await {
        Ok((stream, closed_signal)) => Ok((stream, handle, closed_signal)),
        Err(err) => {
            handle.interrupt();
            pending.remove(&handle);
            Err(err)
        }
    }
}

async fn dial_layers(
    entry: &ServerEntry,
    protocol: TunnelProtocol,
    session_id: &str,
    handle: &ConnHandle,
    dial_config: &DialConfig,
) -> Result<(Box<dyn TunnelStream>, oneshot::Receiver<()>), TunnelError> {
    let interrupt = handle.interrupt_token();

    let base: Box<dyn TunnelStream> = if protocol.uses_meek() {
        let stream = meek::dial_meek(
            entry,
            protocol.uses_fronting(),
            session_id,
            interrupt,
            dial_config,
        )
        .await?;
        Box::new(stream)
    } else {
        let stream = tcp::dial_direct(entry, protocol, &interrupt, dial_config).await?;
        Box::new(stream)
    };

    let conn = DialedConn::new(base, handle.shared(), dial_config);

    // Install the close signal before stacking further layers so an
    // unexpected disconnect is observable for the tunnel's whole lifetime.
    // Installation fails when an external shutdown won the race.
    let closed_signal = handle.install_closed_signal()?;

    let stream: Box<dyn TunnelStream> = if protocol.uses_obfuscation() {
        let obfuscated = ObfuscatedStream::establish(conn, entry.ssh_obfuscated_key.as_bytes())
            .await
            .map_err(TunnelError::Dial)?;
        Box::new(obfuscated)
    } else {
        Box::new(conn)
    };

    Ok((stream, closed_signal))
}
