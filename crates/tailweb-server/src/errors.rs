//! Gateway errors and their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tailweb_core::{ErrorKind, FileFault, TailError};

/// Errors raised by the HTTP surface and the listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding or serving failed.
    #[error("server i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A tailing operation failed.
    #[error(transparent)]
    Tail(#[from] TailError),
    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// `max_connections` reached.
    #[error("connection limit of {limit} reached")]
    TooManyConnections {
        /// Configured limit.
        limit: usize,
    },
}

impl ServerError {
    /// Wire-level classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::Tail(e) => e.kind(),
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::TooManyConnections { .. } => ErrorKind::TransportClosed,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Tail(TailError::UnknownFile { .. } | TailError::FileNotFound { .. }) => {
                StatusCode::NOT_FOUND
            }
            Self::Tail(TailError::PermissionDenied { .. }) => StatusCode::FORBIDDEN,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::TooManyConnections { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Io(_) | Self::Tail(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Filesystem paths are never included.
    pub fn public_message(&self) -> String {
        match self {
            Self::Tail(
                e @ (TailError::FileNotFound { .. }
                | TailError::PermissionDenied { .. }
                | TailError::Io { .. }),
            ) => FileFault::from_error(e).message,
            Self::Io(_) => "internal error".into(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.public_message(),
            }
        });
        (status, Json(body)).into_response()
    }
}
