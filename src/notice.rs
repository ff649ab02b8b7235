//! Operational notices
//!
//! Human-readable operational events are routed through the [`Notifier`]
//! trait so that embedders can surface them in a UI and tests can assert
//! on them. The default sink forwards to `tracing`.

use tracing::{error, info, warn};

/// Sink for human-readable operational events
pub trait Notifier: Send + Sync {
    /// Routine operational information
    fn info(&self, message: &str);

    /// A problem that did not affect the tunnel's health
    fn warning(&self, message: &str);

    /// A failure that affects the tunnel's health
    fn alert(&self, message: &str);
}

/// Default notifier that forwards notices to the `tracing` subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn info(&self, message: &str) {
        info!("{}", message);
    }

    fn warning(&self, message: &str) {
        warn!("{}", message);
    }

    fn alert(&self, message: &str) {
        error!("{}", message);
    }
}
