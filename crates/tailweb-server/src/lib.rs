//! # tailweb-server
//!
//! Axum HTTP + `WebSocket` gateway streaming tailed files to browsers.
//!
//! - HTTP endpoints: health, file list, status, last lines, Prometheus metrics
//! - `WebSocket` sessions: file selection, per-client clear marker, pause,
//!   heartbeat and backpressure reporting
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod errors;
pub mod heartbeat;
pub mod protocol;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod view;

pub use config::ServerConfig;
pub use connection::{ClientConnection, ConnectionGuard, ConnectionRegistry, ConnectionStatus};
pub use errors::ServerError;
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{AppState, HealthResponse, TailwebServer};
pub use session::{SessionContext, SessionEnd, run_session};
pub use shutdown::ShutdownCoordinator;
pub use view::ViewState;
