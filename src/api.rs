//! Application-layer API session
//!
//! After the encrypted session is up, an establishment normally performs
//! an application-layer handshake with the server's API and keeps the
//! resulting session for status requests and stats metadata. The API
//! implementation lives outside this crate; the core only consumes these
//! two seams. The session dials its own requests through the tunnel it is
//! handed, so it is created after the encrypted session and before the
//! supervisor starts.

use crate::stats::{StatsPayload, StatsRegex};
use crate::tunnel::Tunneler;
use anyhow::Result;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// Factory for API sessions
#[async_trait]
pub trait ApiService: Send + Sync {
    /// Perform the application-layer handshake for a freshly established
    /// tunnel and return the session
    async fn new_session(
        &self,
        tunneler: Arc<dyn Tunneler>,
        session_id: &str,
    ) -> Result<Arc<dyn ApiSession>>;
}

/// One application-layer session bound to a tunnel
#[async_trait]
pub trait ApiSession: Send + Sync {
    /// Submit a transfer-stats payload
    async fn do_status_request(&self, payload: &StatsPayload) -> io::Result<()>;

    /// Key under which this tunnel's traffic is accounted
    fn stats_server_id(&self) -> String;

    /// Destination classification rules for this tunnel's traffic
    fn stats_regexes(&self) -> Vec<StatsRegex>;
}
