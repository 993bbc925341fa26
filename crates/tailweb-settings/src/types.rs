//! Settings types with compiled defaults.
//!
//! Every struct is `#[serde(default)]` so a partial JSON file only needs the
//! keys it changes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tailweb_core::AllowList;

use crate::errors::{Result, SettingsError};

/// Root settings object (`~/.tailweb/settings.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TailwebSettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Watcher and reader behaviour.
    pub tail: TailSettings,
    /// Broadcast hub sizing.
    pub hub: HubSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Logical name → absolute path. The only files clients can tail.
    pub files: BTreeMap<String, String>,
}

/// Server network and session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks an ephemeral port.
    pub port: u16,
    /// WebSocket ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close a session after this long without a pong, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Concurrent WebSocket sessions before new upgrades get 503.
    pub max_connections: usize,
    /// Grace period for in-flight sessions on shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_connections: 256,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ServerSettings {
    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// File watching and reading settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TailSettings {
    /// Baseline poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Use OS change notification to wake the poller early.
    pub use_notify: bool,
    /// First retry delay while a file is missing or unreadable.
    pub backoff_base_ms: u64,
    /// Retry delay cap.
    pub backoff_max_ms: u64,
    /// Lines replayed on first attach. `0` means start at end-of-file.
    pub backfill_lines: usize,
    /// Bytes scanned backwards when looking for backfill lines.
    pub backfill_max_bytes: u64,
    /// A partial line longer than this is flushed as a line.
    pub max_line_bytes: usize,
    /// Bytes read per blocking read call.
    pub max_read_bytes: usize,
    /// Tear down a tracked file after this long without subscribers.
    pub idle_timeout_secs: u64,
    /// How often the idle reaper runs, in milliseconds.
    pub reap_interval_ms: u64,
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            use_notify: true,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            backfill_lines: 0,
            backfill_max_bytes: 64 * 1024,
            max_line_bytes: 1024 * 1024,
            max_read_bytes: 256 * 1024,
            idle_timeout_secs: 60,
            reap_interval_ms: 1_000,
        }
    }
}

impl TailSettings {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Reaper period as a `Duration`.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Broadcast hub settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Bounded queue size per subscription.
    pub queue_capacity: usize,
    /// Lines and rotation markers retained per file for late subscribers.
    pub history_capacity: usize,
    /// Evict a subscriber that keeps dropping for this long, in seconds.
    pub eviction_window_secs: u64,
    /// How long a blocking publisher waits for queue space, in milliseconds.
    pub block_timeout_ms: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            history_capacity: 1000,
            eviction_window_secs: 30,
            block_timeout_ms: 250,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` still wins.
    pub level: String,
    /// Emit JSON lines.
    pub json: bool,
    /// Per-module level overrides.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

impl TailwebSettings {
    /// Build the allow-list from [`files`](Self::files).
    pub fn allow_list(&self) -> Result<AllowList> {
        Ok(AllowList::from_pairs(
            self.files
                .iter()
                .map(|(name, path)| (name.clone(), path.clone())),
        )?)
    }

    /// Check cross-field constraints. Run after every override layer.
    pub fn validate(&self) -> Result<()> {
        let files = self.allow_list()?;
        if files.is_empty() {
            return Err(SettingsError::InvalidValue(
                "at least one file must be allow-listed".into(),
            ));
        }
        if !(50..=5_000).contains(&self.tail.poll_interval_ms) {
            return Err(SettingsError::InvalidValue(format!(
                "tail.pollIntervalMs must be within 50..=5000, got {}",
                self.tail.poll_interval_ms
            )));
        }
        if self.hub.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.queueCapacity must be at least 1".into(),
            ));
        }
        if self.hub.history_capacity < self.tail.backfill_lines {
            return Err(SettingsError::InvalidValue(format!(
                "hub.historyCapacity ({}) must be >= tail.backfillLines ({})",
                self.hub.history_capacity, self.tail.backfill_lines
            )));
        }
        if self.tail.max_read_bytes == 0 || self.tail.max_line_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "tail read and line limits must be non-zero".into(),
            ));
        }
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutMs must be >= heartbeatIntervalMs".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn valid() -> TailwebSettings {
        let mut settings = TailwebSettings::default();
        let _ = settings
            .files
            .insert("app".into(), "/var/log/app.log".into());
        settings
    }

    #[test]
    fn defaults() {
        let settings = TailwebSettings::default();
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.tail.poll_interval_ms, 250);
        assert_eq!(settings.tail.backfill_lines, 0);
        assert_eq!(settings.tail.idle_timeout_secs, 60);
        assert_eq!(settings.hub.queue_capacity, 1024);
        assert_eq!(settings.hub.eviction_window_secs, 30);
        assert_eq!(settings.server.max_connections, 256);
        assert!(settings.files.is_empty());
    }

    #[test]
    fn valid_settings_pass() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn empty_allow_list_rejected() {
        assert_matches!(
            TailwebSettings::default().validate(),
            Err(SettingsError::InvalidValue(ref msg)) if msg.contains("allow-listed")
        );
    }

    #[test]
    fn relative_path_rejected() {
        let mut settings = TailwebSettings::default();
        let _ = settings.files.insert("app".into(), "app.log".into());
        assert_matches!(settings.validate(), Err(SettingsError::AllowList(_)));
    }

    #[test]
    fn poll_interval_bounds() {
        let mut settings = valid();
        settings.tail.poll_interval_ms = 10;
        assert!(settings.validate().is_err());
        settings.tail.poll_interval_ms = 5_000;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn history_must_cover_backfill() {
        let mut settings = valid();
        settings.tail.backfill_lines = 2_000;
        assert!(settings.validate().is_err());
        settings.hub.history_capacity = 2_000;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_queue_rejected() {
        let mut settings = valid();
        settings.hub.queue_capacity = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(TailwebSettings::default()).unwrap();
        assert_eq!(json["tail"]["pollIntervalMs"], 250);
        assert_eq!(json["hub"]["queueCapacity"], 1024);
        assert_eq!(json["server"]["heartbeatIntervalMs"], 30_000);
    }

    #[test]
    fn durations() {
        let tail = TailSettings::default();
        assert_eq!(tail.poll_interval(), Duration::from_millis(250));
        assert_eq!(tail.idle_timeout(), Duration::from_secs(60));
    }
}
