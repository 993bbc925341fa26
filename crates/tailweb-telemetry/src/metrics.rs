//! Prometheus recorder and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Returns `None` if another recorder is already installed.
pub fn install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("prometheus metrics recorder installed");
            Some(handle)
        }
        Err(e) => {
            warn!(error = %e, "failed to install metrics recorder");
            None
        }
    }
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// Lines read from tracked files (counter, labels: file).
pub const TAIL_LINES_TOTAL: &str = "tail_lines_total";
/// Rotations detected (counter, labels: file, cause).
pub const TAIL_ROTATIONS_TOTAL: &str = "tail_rotations_total";
/// Watcher faults raised (counter, labels: file, kind).
pub const TAIL_FAULTS_TOTAL: &str = "tail_faults_total";
/// Lines that were not valid UTF-8 (counter, labels: file).
pub const TAIL_DECODE_ANOMALIES_TOTAL: &str = "tail_decode_anomalies_total";
/// Tracked files with a running tail task (gauge).
pub const TRACKED_FILES_ACTIVE: &str = "tracked_files_active";
/// Records dropped from subscriber queues (counter, labels: file).
pub const HUB_RECORDS_DROPPED_TOTAL: &str = "hub_records_dropped_total";
/// Subscribers evicted for sustained backpressure (counter, labels: file).
pub const HUB_EVICTIONS_TOTAL: &str = "hub_evictions_total";
/// Open subscriptions across all files (gauge).
pub const HUB_SUBSCRIPTIONS_ACTIVE: &str = "hub_subscriptions_active";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
