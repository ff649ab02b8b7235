//! Test utilities for integration tests
//!
//! Provides an in-process SSH server speaking the tunnel's dialect
//! (password credential carrying a JSON document, direct-tcpip echo), an
//! HTTP bridge emulating a meek endpoint, and recording fakes for the
//! tunnel's collaborators.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use burrow::notice::Notifier;
use burrow::server_entry::{ServerEntry, ServerRegistry};
use burrow::transport::ObfuscatedStream;
use burrow::tunnel::{Tunnel, TunnelOwner, TunnelRuntime};
use burrow::{count_all_failures, DialConfig, TransferStats, TunnelConfig};
use russh::keys::ssh_key::private::Ed25519Keypair;
use russh::keys::PrivateKey;
use russh::server::{Auth, Config as ServerConfig, Handler, Msg, Session};
use russh::{Channel, MethodKind, MethodSet};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// User name the test server accepts
pub const TEST_USERNAME: &str = "tunnel-user";

/// Password the test server expects inside the credential document
pub const TEST_PASSWORD: &str = "tunnel-password";

/// Shared obfuscation key for obfuscated-transport tests
pub const TEST_OBFUSCATION_KEY: &str = "test-obfuscation-key";

/// Behavior switches for the test SSH server
#[derive(Clone)]
pub struct ServerBehavior {
    /// Expected password inside the credential document
    pub password: String,
    /// Refuse every direct-tcpip open
    pub reject_forwards: bool,
    /// Unwrap the stream obfuscation layer before speaking SSH
    pub obfuscation_key: Option<String>,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        ServerBehavior {
            password: TEST_PASSWORD.to_string(),
            reject_forwards: false,
            obfuscation_key: None,
        }
    }
}

/// In-process SSH server with password auth and direct-tcpip echo
pub struct TestSshServer {
    pub addr: SocketAddr,
    pub host_key_base64: String,
    pub accepted: Arc<AtomicUsize>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TestSshServer {
    pub async fn start(behavior: ServerBehavior) -> Self {
        let key = PrivateKey::from(Ed25519Keypair::random(&mut rand::rngs::OsRng));
        let host_key_base64 = BASE64.encode(key.public_key().to_bytes().unwrap());

        let mut methods = MethodSet::empty();
        methods.push(MethodKind::Password);
        let config = Arc::new(ServerConfig {
            methods,
            keys: vec![key],
            auth_rejection_time: Duration::from_millis(0),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_counter = accepted.clone();
        let task_registry = tasks.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                accept_counter.fetch_add(1, Ordering::SeqCst);

                let config = config.clone();
                let behavior = behavior.clone();
                let connection = tokio::spawn(async move {
                    let handler = TestHandler {
                        behavior: behavior.clone(),
                    };
                    let result = match &behavior.obfuscation_key {
                        Some(keyword) => {
                            match ObfuscatedStream::accept(stream, keyword.as_bytes()).await {
                                Ok(deobfuscated) => {
                                    run_session(config, deobfuscated, handler).await
                                }
                                Err(_) => return,
                            }
                        }
                        None => run_session(config, stream, handler).await,
                    };
                    let _ = result;
                });
                task_registry.lock().unwrap().push(connection);
            }
        });
        tasks.lock().unwrap().push(accept_task);

        TestSshServer {
            addr,
            host_key_base64,
            accepted,
            tasks,
        }
    }

    /// Kill the server and every live session, simulating a dead transport
    pub fn abort_all(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn run_session<S>(
    config: Arc<ServerConfig>,
    stream: S,
    handler: TestHandler,
) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let session = russh::server::run_stream(config, stream, handler).await?;
    session.await?;
    Ok(())
}

struct TestHandler {
    behavior: ServerBehavior,
}

impl Handler for TestHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user != TEST_USERNAME {
            return Ok(Auth::reject());
        }

        // The credential is a JSON document carrying the session id and
        // the entry password
        let parsed: serde_json::Value = match serde_json::from_str(password) {
            Ok(value) => value,
            Err(_) => return Ok(Auth::reject()),
        };
        let session_id_present = parsed["SessionId"]
            .as_str()
            .map(|sid| !sid.is_empty())
            .unwrap_or(false);
        let password_matches = parsed["SshPassword"] == self.behavior.password.as_str();

        if session_id_present && password_matches {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.behavior.reject_forwards {
            return Ok(false);
        }

        // Echo service: anything written to the forward comes back
        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let mut buf = vec![0u8; 8192];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        if stream.write_all(&buf[..read]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(true)
    }
}

/// HTTP endpoint that bridges meek exchanges onto a backend TCP service
///
/// Each cookie value gets its own backend connection; POST bodies are
/// written to it and responses drain whatever the backend produced.
pub async fn start_meek_bridge(backend: SocketAddr) -> SocketAddr {
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::{header, Request, Response};
    use hyper_util::rt::TokioIo;

    struct BridgeSession {
        write_half: OwnedWriteHalf,
        received: Arc<Mutex<Vec<u8>>>,
    }

    let sessions: Arc<tokio::sync::Mutex<HashMap<String, BridgeSession>>> =
        Arc::new(tokio::sync::Mutex::new(HashMap::new()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let sessions = sessions.clone();
                    async move {
                        let cookie = request
                            .headers()
                            .get(header::COOKIE)
                            .and_then(|value| value.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let body = request.into_body().collect().await.unwrap().to_bytes();

                        let mut sessions = sessions.lock().await;
                        if !sessions.contains_key(&cookie) {
                            let backend_stream = TcpStream::connect(backend).await.unwrap();
                            let (mut read_half, write_half) = backend_stream.into_split();
                            let received = Arc::new(Mutex::new(Vec::new()));
                            let sink = received.clone();
                            tokio::spawn(async move {
                                let mut buf = vec![0u8; 8192];
                                loop {
                                    match read_half.read(&mut buf).await {
                                        Ok(0) | Err(_) => break,
                                        Ok(read) => {
                                            sink.lock().unwrap().extend_from_slice(&buf[..read]);
                                        }
                                    }
                                }
                            });
                            sessions.insert(
                                cookie.clone(),
                                BridgeSession {
                                    write_half,
                                    received,
                                },
                            );
                        }

                        let session = sessions.get_mut(&cookie).unwrap();
                        if !body.is_empty() {
                            session.write_half.write_all(&body).await.unwrap();
                        }

                        // Give the backend a moment to produce output
                        let received = session.received.clone();
                        drop(sessions);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        let drained: Vec<u8> = {
                            let mut received = received.lock().unwrap();
                            received.drain(..).collect()
                        };

                        Ok::<_, std::convert::Infallible>(Response::new(Full::new(
                            bytes::Bytes::from(drained),
                        )))
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// Build a server entry pointing at the test server
pub fn make_server_entry(server: &TestSshServer, capabilities: &[&str]) -> ServerEntry {
    ServerEntry {
        ip_address: "127.0.0.1".to_string(),
        region: "XX".to_string(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        ssh_port: server.addr.port(),
        ssh_obfuscated_port: server.addr.port(),
        ssh_obfuscated_key: TEST_OBFUSCATION_KEY.to_string(),
        ssh_host_key: server.host_key_base64.clone(),
        ssh_username: TEST_USERNAME.to_string(),
        ssh_password: TEST_PASSWORD.to_string(),
        meek_fronting_domain: None,
    }
}

/// Notifier that records every notice
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingNotifier {
            notices: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.notices.lock().unwrap().len()
    }

    pub fn contains(&self, fragment: &str) -> bool {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .any(|notice| notice.contains(fragment))
    }
}

impl Notifier for RecordingNotifier {
    fn info(&self, message: &str) {
        self.notices
            .lock()
            .unwrap()
            .push(format!("info: {}", message));
    }
    fn warning(&self, message: &str) {
        self.notices
            .lock()
            .unwrap()
            .push(format!("warning: {}", message));
    }
    fn alert(&self, message: &str) {
        self.notices
            .lock()
            .unwrap()
            .push(format!("alert: {}", message));
    }
}

/// Owner that counts failure signals and exposes them as a channel
pub struct CountingOwner {
    pub count: AtomicUsize,
    notify_tx: mpsc::UnboundedSender<()>,
}

impl CountingOwner {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        (
            Arc::new(CountingOwner {
                count: AtomicUsize::new(0),
                notify_tx,
            }),
            notify_rx,
        )
    }

    pub fn failures(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl TunnelOwner for CountingOwner {
    fn signal_tunnel_failure(&self, _tunnel: &Arc<Tunnel>) {
        self.count.fetch_add(1, Ordering::SeqCst);
        let _ = self.notify_tx.send(());
    }
}

/// Registry that records promotions
#[derive(Default)]
pub struct RecordingRegistry {
    pub promoted: Mutex<Vec<String>>,
}

impl ServerRegistry for RecordingRegistry {
    fn promote(&self, ip_address: &str) {
        self.promoted.lock().unwrap().push(ip_address.to_string());
    }
}

/// A tunnel runtime wired to recording fakes
pub fn test_runtime(
    notifier: Arc<RecordingNotifier>,
    registry: Arc<RecordingRegistry>,
) -> TunnelRuntime {
    TunnelRuntime {
        server_registry: registry,
        stats: Arc::new(TransferStats::new()),
        api: None,
        notifier,
        failure_classifier: count_all_failures(),
        dial_config: DialConfig {
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    }
}

/// Tunnel config suited to fast tests
pub fn test_tunnel_config(threshold: u32) -> TunnelConfig {
    TunnelConfig {
        disable_api: true,
        port_forward_failure_threshold: threshold,
        ..Default::default()
    }
}
