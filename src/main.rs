//! Burrow - Circumvention Tunnel Client
//!
//! This is the main entry point for the Burrow application. It
//! establishes a tunnel to the configured server, keeps it alive, and
//! re-establishes when the tunnel's supervisor reports failure.

use anyhow::Result;
use burrow::helper::make_session_id;
use burrow::tunnel::{Tunnel, TunnelOwner, TunnelRuntime};
use burrow::{
    count_all_failures, establish_tunnel, load_config, PendingConns, ServerRegistry,
    TracingNotifier, TransferStats,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Burrow - circumvention tunnel client
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

/// Owner that forwards failure signals into a channel
struct ChannelOwner {
    failures_tx: mpsc::UnboundedSender<()>,
}

impl TunnelOwner for ChannelOwner {
    fn signal_tunnel_failure(&self, tunnel: &Arc<Tunnel>) {
        warn!(
            "tunnel to {} reported failure",
            tunnel.server_entry().ip_address
        );
        let _ = self.failures_tx.send(());
    }
}

/// Registry stub for single-server configurations
struct SingleServerRegistry;

impl ServerRegistry for SingleServerRegistry {
    fn promote(&self, ip_address: &str) {
        debug!("promoting server entry {}", ip_address);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_log)?;

    let config = load_config(&args.config)?;

    info!("Burrow v{}", burrow::VERSION);
    info!("Configuration loaded from: {:?}", args.config);
    info!("Server: {}", config.server.ip_address);

    let pending = PendingConns::new();
    let runtime = TunnelRuntime {
        server_registry: Arc::new(SingleServerRegistry),
        stats: Arc::new(TransferStats::new()),
        api: None,
        notifier: Arc::new(TracingNotifier),
        failure_classifier: count_all_failures(),
        dial_config: config.tunnel.dial_config(),
    };
    // Without an API implementation wired in, run with the API disabled
    let mut tunnel_config = config.tunnel.clone();
    tunnel_config.disable_api = true;

    let mut attempt: u32 = 0;
    let max_attempts = 10;
    let base_delay = Duration::from_secs(1);
    let max_delay = Duration::from_secs(60);

    loop {
        let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
        let owner = Arc::new(ChannelOwner { failures_tx });
        let session_id = make_session_id();

        let tunnel = match establish_tunnel(
            &tunnel_config,
            &runtime,
            &session_id,
            &pending,
            config.server.clone(),
            owner,
        )
        .await
        {
            Ok(tunnel) => {
                attempt = 0;
                tunnel
            }
            Err(err) => {
                attempt += 1;
                if attempt > max_attempts {
                    error!("Establish failed too many times, giving up");
                    return Err(err.into());
                }
                let delay = std::cmp::min(base_delay * 2u32.pow(attempt - 1), max_delay);
                warn!(
                    "Establish failed: {:#}. Retrying in {:?}... (attempt {}/{})",
                    err, delay, attempt, max_attempts
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        info!(
            "Tunnel established to {} with protocol {}",
            tunnel.server_entry().ip_address,
            tunnel.protocol()
        );

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                pending.close_all();
                tunnel.close().await;
                break;
            }
            _ = failures_rx.recv() => {
                tunnel.close().await;
                info!("Re-establishing tunnel...");
            }
        }
    }

    info!("Burrow stopped");
    Ok(())
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
