//! # tailweb
//!
//! Live log tailing server binary: wires settings, telemetry, the tail
//! registry and the HTTP/WebSocket server together.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tailweb_core::AllowList;
use tailweb_hub::{BroadcastHub, HubConfig};
use tailweb_server::{ServerConfig, TailwebServer};
use tailweb_settings::TailwebSettings;
use tailweb_tail::{ReaderConfig, TailConfig, TailRegistry, WatcherConfig};
use tailweb_telemetry::{TelemetryConfig, init_telemetry, parse_level};

/// Stream allow-listed log files to browsers over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "tailweb", about = "Live log tailing over WebSocket")]
struct Cli {
    /// Settings file (defaults to `~/.tailweb/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Allow-list entry as `NAME=/absolute/path`. Repeatable.
    #[arg(long = "file", value_name = "NAME=PATH")]
    files: Vec<String>,

    /// Lines replayed to a client when it selects a file.
    #[arg(long)]
    backfill_lines: Option<usize>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Layer CLI flags over loaded settings.
    fn apply(&self, settings: &mut TailwebSettings) -> Result<()> {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(lines) = self.backfill_lines {
            settings.tail.backfill_lines = lines;
        }
        if self.log_json {
            settings.logging.json = true;
        }
        if !self.files.is_empty() {
            // Flags replace the configured allow-list rather than extend it.
            settings.files.clear();
            for entry in &self.files {
                let (name, path) = AllowList::parse_entry(entry)
                    .with_context(|| format!("invalid --file entry '{entry}'"))?;
                let _ = settings
                    .files
                    .insert(name, path.to_string_lossy().into_owned());
            }
        }
        Ok(())
    }
}

fn telemetry_config(settings: &TailwebSettings) -> TelemetryConfig {
    let defaults = TelemetryConfig::default();
    TelemetryConfig {
        log_level: parse_level(&settings.logging.level).unwrap_or(defaults.log_level),
        module_levels: settings
            .logging
            .modules
            .iter()
            .filter_map(|(module, level)| parse_level(level).map(|l| (module.clone(), l)))
            .collect(),
        json: settings.logging.json,
        ..defaults
    }
}

fn tail_config(settings: &TailwebSettings) -> TailConfig {
    let tail = &settings.tail;
    TailConfig {
        watcher: WatcherConfig {
            poll_interval: tail.poll_interval(),
            use_notify: tail.use_notify,
            backoff_base: Duration::from_millis(tail.backoff_base_ms),
            backoff_max: Duration::from_millis(tail.backoff_max_ms),
        },
        reader: ReaderConfig {
            backfill_lines: tail.backfill_lines,
            backfill_max_bytes: tail.backfill_max_bytes,
            max_line_bytes: tail.max_line_bytes,
            max_read_bytes: tail.max_read_bytes,
        },
        idle_timeout: tail.idle_timeout(),
        reap_interval: tail.reap_interval(),
        ..TailConfig::default()
    }
}

fn hub_config(settings: &TailwebSettings) -> HubConfig {
    HubConfig {
        history_capacity: settings.hub.history_capacity,
        eviction_window: Duration::from_secs(settings.hub.eviction_window_secs),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings = match &args.config {
        Some(path) => tailweb_settings::load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => tailweb_settings::load_settings().context("failed to load settings")?,
    };
    args.apply(&mut settings)?;
    settings.validate().context("invalid settings")?;

    let telemetry = init_telemetry(&telemetry_config(&settings));

    let files = settings.allow_list().context("invalid allow-list")?;
    tracing::info!(files = ?files.names().collect::<Vec<_>>(), "allow-list loaded");

    let hub = BroadcastHub::new(hub_config(&settings));
    let registry = TailRegistry::new(files, hub, tail_config(&settings));
    let reaper = registry.spawn_reaper();

    let server = TailwebServer::new(
        ServerConfig::from_settings(&settings),
        registry.clone(),
        telemetry.prometheus(),
    );
    let (addr, handle) = server.listen().await.context("failed to bind server")?;
    tracing::info!("tailweb listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    registry.shutdown().await;
    server.shutdown(vec![handle, reaper]).await;
    Ok(())
}
