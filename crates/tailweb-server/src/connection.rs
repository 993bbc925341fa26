//! Live WebSocket connections and the connection limit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tailweb_core::ConnectionId;
use tailweb_telemetry::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL};

use crate::errors::ServerError;

/// State shared between a session task and the status endpoints.
pub struct ClientConnection {
    /// Unique connection id.
    pub id: ConnectionId,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has answered since the last heartbeat check.
    pub is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    file: Mutex<Option<String>>,
    lines_sent: AtomicU64,
    lines_dropped: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: ConnectionId) -> Self {
        let now = Instant::now();
        Self {
            id,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            file: Mutex::new(None),
            lines_sent: AtomicU64::new(0),
            lines_dropped: AtomicU64::new(0),
        }
    }

    /// Record the selected file.
    pub fn set_file(&self, file: Option<String>) {
        *self.file.lock() = file;
    }

    /// Currently selected file.
    pub fn file(&self) -> Option<String> {
        self.file.lock().clone()
    }

    /// Mark the connection as alive (pong or any client frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last sign of life.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Count a forwarded line.
    pub fn record_sent(&self) {
        let _ = self.lines_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count lines reported as dropped.
    pub fn record_dropped(&self, count: u64) {
        let _ = self.lines_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Point-in-time view for `/api/status`.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            id: self.id.as_str().to_owned(),
            file: self.file(),
            connected_secs: self.connected_at.elapsed().as_secs(),
            last_pong_secs: self.last_pong_elapsed().as_secs(),
            lines_sent: self.lines_sent.load(Ordering::Relaxed),
            lines_dropped: self.lines_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Serializable connection summary.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionStatus {
    /// Connection id.
    pub id: String,
    /// Selected file.
    pub file: Option<String>,
    /// Seconds since connect.
    pub connected_secs: u64,
    /// Seconds since the last pong.
    pub last_pong_secs: u64,
    /// Lines forwarded.
    pub lines_sent: u64,
    /// Lines reported as dropped.
    pub lines_dropped: u64,
}

/// All live connections, bounded by `max_connections`.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    reserved: AtomicUsize,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Registry admitting at most `max_connections`.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Whether a new connection would be refused.
    pub fn is_full(&self) -> bool {
        self.reserved.load(Ordering::Acquire) >= self.max_connections
    }

    /// Configured limit.
    pub fn limit(&self) -> usize {
        self.max_connections
    }

    /// Admit a new connection. The returned guard unregisters on drop.
    pub fn register(self: &Arc<Self>) -> Result<ConnectionGuard, ServerError> {
        let admitted = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            return Err(ServerError::TooManyConnections {
                limit: self.max_connections,
            });
        }

        let connection = Arc::new(ClientConnection::new(ConnectionId::new()));
        let _ = self
            .connections
            .insert(connection.id.clone(), Arc::clone(&connection));
        metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(self.connections.len() as f64);
        Ok(ConnectionGuard {
            connection,
            registry: Arc::clone(self),
        })
    }

    fn unregister(&self, id: &ConnectionId) {
        if self.connections.remove(id).is_some() {
            let _ = self.reserved.fetch_sub(1, Ordering::AcqRel);
        }
        metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(self.connections.len() as f64);
    }

    /// Live connection count.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Status of every connection, oldest first.
    pub fn snapshot(&self) -> Vec<ConnectionStatus> {
        let mut out: Vec<ConnectionStatus> =
            self.connections.iter().map(|c| c.value().status()).collect();
        out.sort_by(|a, b| b.connected_secs.cmp(&a.connected_secs));
        out
    }
}

/// Keeps a connection registered for as long as the session runs, including
/// when the session task is cancelled or panics.
pub struct ConnectionGuard {
    connection: Arc<ClientConnection>,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    /// The registered connection.
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("id", &self.connection.id)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.connection.id);
        tracing::debug!(connection_id = %self.connection.id, "connection unregistered");
    }
}
