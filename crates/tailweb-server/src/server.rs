//! `TailwebServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tailweb_tail::{FileInfo, TailRegistry, TrackedFileStatus};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionRegistry, ConnectionStatus};
use crate::errors::ServerError;
use crate::protocol::ServerMessage;
use crate::session::{SessionContext, run_session};
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Tracked-file registry.
    pub registry: TailRegistry,
    /// Live WebSocket connections.
    pub connections: Arc<ConnectionRegistry>,
    /// Gateway configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: ShutdownCoordinator,
    /// Running sessions.
    pub sessions: TaskTracker,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// The tailweb HTTP + WebSocket server.
pub struct TailwebServer {
    state: AppState,
}

impl TailwebServer {
    /// Create a new server over `registry`.
    pub fn new(
        config: ServerConfig,
        registry: TailRegistry,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let connections = Arc::new(ConnectionRegistry::new(config.max_connections));
        Self {
            state: AppState {
                registry,
                connections,
                config: Arc::new(config),
                shutdown: ShutdownCoordinator::new(),
                sessions: TaskTracker::new(),
                start_time: Instant::now(),
                metrics,
            },
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/api/files", get(files_handler))
            .route("/api/status", get(status_handler))
            .route("/api/last-lines", get(last_lines_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown begins.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.state.shutdown.token();
        info!(%addr, "listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(error = %e, "server stopped with error");
            }
        });
        Ok((addr, handle))
    }

    /// Signal every session to close and wait up to `shutdown_timeout` for
    /// them and for `handles`.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        let timeout = self.state.config.shutdown_timeout;
        let sessions = self.state.sessions.clone();
        let _ = sessions.close();
        self.state.shutdown.graceful_shutdown(handles, timeout).await;
        if tokio::time::timeout(timeout, sessions.wait()).await.is_err() {
            warn!(remaining = sessions.len(), "sessions still open at shutdown deadline");
        }
        info!("server stopped");
    }

    /// Shutdown coordinator.
    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.state.shutdown
    }

    /// Live WebSocket connections.
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.state.connections
    }

    /// Tracked-file registry.
    pub fn registry(&self) -> &TailRegistry {
        &self.state.registry
    }

    /// Gateway configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP handlers
// ─────────────────────────────────────────────────────────────────────────────

/// `/health` body. `status` is always `"ok"` while the server answers.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    connections: usize,
    tracked_files: usize,
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        connections: state.connections.count(),
        tracked_files: state.registry.tracked_count(),
    })
}

#[derive(Serialize)]
struct FilesResponse {
    files: Vec<FileInfo>,
}

/// GET /api/files
async fn files_handler(State(state): State<AppState>) -> Json<FilesResponse> {
    Json(FilesResponse {
        files: state.registry.file_info().await,
    })
}

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    files: Vec<TrackedFileStatus>,
    connections: ConnectionStats,
    config: ConfigEcho,
}

#[derive(Serialize)]
struct ConnectionStats {
    active: usize,
    limit: usize,
    subscriptions: usize,
    clients: Vec<ConnectionStatus>,
}

#[derive(Serialize)]
struct ConfigEcho {
    files: Vec<String>,
    heartbeat_interval_ms: u64,
    heartbeat_timeout_ms: u64,
    queue_capacity: usize,
    backfill_lines: usize,
    max_connections: usize,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// GET /api/status
async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let config = &state.config;
    Json(StatusResponse {
        uptime_secs: state.start_time.elapsed().as_secs(),
        files: state.registry.status(),
        connections: ConnectionStats {
            active: state.connections.count(),
            limit: state.connections.limit(),
            subscriptions: state.registry.hub().subscription_count(),
            clients: state.connections.snapshot(),
        },
        config: ConfigEcho {
            files: state.registry.files().names().map(ToOwned::to_owned).collect(),
            heartbeat_interval_ms: millis(config.heartbeat_interval),
            heartbeat_timeout_ms: millis(config.heartbeat_timeout),
            queue_capacity: config.queue_capacity,
            backfill_lines: config.backfill_lines,
            max_connections: config.max_connections,
        },
    })
}

#[derive(Debug, Deserialize)]
struct LastLinesQuery {
    file: String,
    lines: Option<usize>,
}

#[derive(Serialize)]
struct LastLinesResponse {
    file: String,
    lines: Vec<String>,
    count: usize,
    file_size: Option<u64>,
}

/// GET /api/last-lines?file=NAME&lines=N
async fn last_lines_handler(
    State(state): State<AppState>,
    Query(query): Query<LastLinesQuery>,
) -> Result<Json<LastLinesResponse>, ServerError> {
    let requested = query.lines.unwrap_or(state.config.default_last_lines);
    if requested == 0 {
        return Err(ServerError::InvalidRequest("lines must be at least 1".into()));
    }
    let n = requested.min(state.config.max_last_lines);
    let lines = state.registry.last_lines(&query.file, n).await?;
    let file_size = state
        .registry
        .file_info()
        .await
        .into_iter()
        .find(|info| info.name == query.file)
        .and_then(|info| info.size);
    Ok(Json(LastLinesResponse {
        count: lines.len(),
        file: query.file,
        lines,
        file_size,
    }))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [("content-type", "text/plain; version=0.0.4")],
            tailweb_telemetry::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// GET /ws
///
/// The connection is registered inside the upgrade callback so a client that
/// vanishes during the handshake never holds a slot.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.connections.is_full() {
        return ServerError::TooManyConnections {
            limit: state.connections.limit(),
        }
        .into_response();
    }

    let ctx = SessionContext {
        registry: state.registry.clone(),
        config: Arc::clone(&state.config),
    };
    let connections = Arc::clone(&state.connections);
    let cancel = state.shutdown.child_token();
    let sessions = state.sessions.clone();

    ws.on_upgrade(move |mut socket| async move {
        let guard = match connections.register() {
            Ok(guard) => guard,
            Err(e) => {
                let message = ServerMessage::error(e.kind(), e.public_message(), true, None);
                let _ = socket.send(Message::Text(message.to_json().into())).await;
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AGAIN,
                        reason: "too many connections".into(),
                    })))
                    .await;
                return;
            }
        };
        let _ = sessions.track_future(run_session(socket, ctx, guard, cancel)).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::path::Path;
    use tailweb_core::AllowList;
    use tailweb_hub::{BroadcastHub, HubConfig};
    use tailweb_tail::TailConfig;
    use tower::ServiceExt;

    fn make_server(path: &Path) -> TailwebServer {
        let files = AllowList::from_pairs([("app", path)]).unwrap();
        let registry = TailRegistry::new(
            files,
            BroadcastHub::new(HubConfig::default()),
            TailConfig::default(),
        );
        TailwebServer::new(ServerConfig::default(), registry, None)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
            .await
            .unwrap();
        let parsed = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, parsed)
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(&dir.path().join("app.log"));
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["tracked_files"], 0);
        assert!(body["uptime_secs"].as_u64().unwrap() < 5);
    }

    #[tokio::test]
    async fn files_endpoint_lists_names_without_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "hello\n").unwrap();
        let server = make_server(&path);

        let (status, body) = get_json(server.router(), "/api/files").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["files"][0]["name"], "app");
        assert_eq!(body["files"][0]["exists"], true);
        assert_eq!(body["files"][0]["size"], 6);
        assert!(!body.to_string().contains(dir.path().to_str().unwrap()));
    }

    #[tokio::test]
    async fn status_endpoint_echoes_config() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(&dir.path().join("app.log"));
        let (status, body) = get_json(server.router(), "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["config"]["files"][0], "app");
        assert_eq!(body["config"]["max_connections"], 256);
        assert_eq!(body["connections"]["active"], 0);
        assert!(body["files"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_lines_returns_tail_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();
        let server = make_server(&path);

        let (status, body) = get_json(server.router(), "/api/last-lines?file=app&lines=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["file"], "app");
        assert_eq!(body["lines"], serde_json::json!(["two", "three"]));
        assert_eq!(body["count"], 2);
        assert_eq!(body["file_size"], 14);
    }

    #[tokio::test]
    async fn last_lines_defaults_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let content: String = (0..20).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, content).unwrap();
        let server = make_server(&path);

        let (_, body) = get_json(server.router(), "/api/last-lines?file=app").await;
        assert_eq!(body["count"], 10);
        assert_eq!(body["lines"][9], "line 19");

        let (_, body) = get_json(server.router(), "/api/last-lines?file=app&lines=100000").await;
        assert_eq!(body["count"], 20);
    }

    #[tokio::test]
    async fn last_lines_rejects_zero() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(&dir.path().join("app.log"));
        let (status, body) = get_json(server.router(), "/api/last-lines?file=app&lines=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn last_lines_unknown_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(&dir.path().join("app.log"));
        let (status, body) = get_json(server.router(), "/api/last-lines?file=nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "unknown_file");
    }

    #[tokio::test]
    async fn last_lines_missing_file_hides_path() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(&dir.path().join("app.log"));
        let (status, body) = get_json(server.router(), "/api/last-lines?file=app").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "file_not_found");
        assert!(!body.to_string().contains(dir.path().to_str().unwrap()));
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(&dir.path().join("app.log"));
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_without_upgrade_headers_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(&dir.path().join("app.log"));
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(&dir.path().join("app.log"));
        let (status, _) = get_json(server.router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server = make_server(&dir.path().join("app.log"));
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown(vec![handle]).await;
        assert!(server.shutdown_coordinator().is_shutting_down());
    }
}
