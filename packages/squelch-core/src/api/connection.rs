//! WebSocket connection tracking and management.
//!
//! Tracks live connections with force-close capability:
//!
//! - `ConnectionManager`: registry of active connections
//! - `ConnectionGuard`: RAII guard for automatic cleanup on disconnect
//!
//! Each connection gets a child token of a global cancellation token, so
//! shutdown closes every transport at once while kick and eviction cancel
//! a single child.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Manages all active WebSocket connections.
///
/// Thread-safe for concurrent access from every connection handler.
pub struct ConnectionManager {
    /// Active connections: session id -> per-connection cancellation token.
    connections: DashMap<Uuid, CancellationToken>,
    /// Global cancellation token - when cancelled, all connections close.
    /// Wrapped in a lock so it can be replaced after `close_all()`.
    global_cancel: RwLock<CancellationToken>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a new connection and returns a guard for RAII cleanup.
    pub fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = Uuid::new_v4();
        let cancel_token = self.global_cancel.read().child_token();
        self.connections.insert(id, cancel_token.clone());
        log::info!(
            "[WS] Connection registered: {} (total: {})",
            id,
            self.connections.len()
        );
        ConnectionGuard {
            id,
            manager: Arc::clone(self),
            cancel_token,
        }
    }

    fn unregister(&self, id: Uuid) {
        if self.connections.remove(&id).is_some() {
            log::info!(
                "[WS] Connection unregistered: {} (remaining: {})",
                id,
                self.connections.len()
            );
        }
    }

    /// Number of active connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Force-closes all connections (graceful shutdown).
    ///
    /// Cancels the global token, then installs a fresh one so later
    /// connections can still be accepted. Returns the number signalled.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[WS] Force-closing {} connection(s)", count);
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters a connection when dropped.
pub struct ConnectionGuard {
    id: Uuid,
    manager: Arc<ConnectionManager>,
    /// Token for this specific connection - cancelled on kick, eviction,
    /// or global force-close.
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    /// Session id of this connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancellation token to select on in the connection loop.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(self.id);
    }
}
