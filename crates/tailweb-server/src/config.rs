//! Server configuration.

use std::time::Duration;

use tailweb_settings::TailwebSettings;

/// Runtime configuration for the HTTP and WebSocket gateway.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind. `0` lets the OS pick.
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between WebSocket pings.
    pub heartbeat_interval: Duration,
    /// Close a session after this long without a pong.
    pub heartbeat_timeout: Duration,
    /// How long graceful shutdown waits for sessions to finish.
    pub shutdown_timeout: Duration,
    /// Per-subscription queue capacity.
    pub queue_capacity: usize,
    /// Lines replayed to a fresh subscriber.
    pub backfill_lines: usize,
    /// Publisher wait granted to `lossless` subscriptions.
    pub block_timeout: Duration,
    /// Upper bound for `/api/last-lines?lines=`.
    pub max_last_lines: usize,
    /// Default for `/api/last-lines` when `lines` is omitted.
    pub default_last_lines: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            shutdown_timeout: Duration::from_secs(5),
            queue_capacity: 1024,
            backfill_lines: 0,
            block_timeout: Duration::from_millis(250),
            max_last_lines: 1000,
            default_last_lines: 10,
        }
    }
}

impl ServerConfig {
    /// Derive the gateway configuration from loaded settings.
    pub fn from_settings(settings: &TailwebSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            heartbeat_interval: Duration::from_millis(settings.server.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(settings.server.heartbeat_timeout_ms),
            shutdown_timeout: Duration::from_millis(settings.server.shutdown_timeout_ms),
            queue_capacity: settings.hub.queue_capacity,
            backfill_lines: settings.tail.backfill_lines,
            block_timeout: Duration::from_millis(settings.hub.block_timeout_ms),
            ..Self::default()
        }
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
