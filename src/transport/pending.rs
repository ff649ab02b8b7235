//! Pending connection registry
//!
//! Tracks transports whose dial or session handshake is still in flight.
//! An external shutdown calls [`PendingConns::close_all`] to force-close
//! them; the establisher removes a connection once its handshake has
//! succeeded and the dial is no longer interruptible.

use super::ConnHandle;
use std::sync::Mutex;

/// Registry of interruptible in-flight connections
#[derive(Debug, Default)]
pub struct PendingConns {
    conns: Mutex<Vec<ConnHandle>>,
}

impl PendingConns {
    /// Create an empty registry
    pub fn new() -> Self {
        PendingConns::default()
    }

    /// Register a connection
    pub fn add(&self, conn: ConnHandle) {
        self.conns
            .lock()
            .expect("pending conns lock poisoned")
            .push(conn);
    }

    /// Unregister a connection; a no-op when it is not present
    pub fn remove(&self, conn: &ConnHandle) {
        self.conns
            .lock()
            .expect("pending conns lock poisoned")
            .retain(|c| c.id() != conn.id());
    }

    /// Force-close every registered connection and clear the registry
    pub fn close_all(&self) {
        let drained: Vec<ConnHandle> = self
            .conns
            .lock()
            .expect("pending conns lock poisoned")
            .drain(..)
            .collect();
        for conn in drained {
            conn.interrupt();
        }
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.conns.lock().expect("pending conns lock poisoned").len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
