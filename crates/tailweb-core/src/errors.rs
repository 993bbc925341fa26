//! Error taxonomy for the tailing core.
//!
//! Nothing here is process-fatal. `FileNotFound`, `PermissionDenied` and `Io`
//! are retried on backoff, and `BackpressureEviction` / `TransportClosed` only
//! ever end one client's session.
//!
//! [`ErrorKind`] also labels conditions that are signalled rather than
//! raised: a lossy line carries `lossy: true` and a rotation is its own event.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Stable, wire-level classification of a [`TailError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The tracked file does not exist (yet).
    FileNotFound,
    /// The tracked file exists but cannot be read.
    PermissionDenied,
    /// A single line was not valid UTF-8 and was replaced.
    DecodeAnomaly,
    /// The file was rotated or truncated. Signalled, not a failure.
    RotationDetected,
    /// The subscriber could not keep up and was evicted.
    BackpressureEviction,
    /// The client transport went away.
    TransportClosed,
    /// The requested logical name is not on the allow-list.
    UnknownFile,
    /// Any other I/O failure.
    Io,
    /// A client message could not be understood.
    InvalidRequest,
}

impl ErrorKind {
    /// Short snake_case label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileNotFound => "file_not_found",
            Self::PermissionDenied => "permission_denied",
            Self::DecodeAnomaly => "decode_anomaly",
            Self::RotationDetected => "rotation_detected",
            Self::BackpressureEviction => "backpressure_eviction",
            Self::TransportClosed => "transport_closed",
            Self::UnknownFile => "unknown_file",
            Self::Io => "io",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

/// Errors raised by the watcher, reader, registry and gateway.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TailError {
    // Retried with backoff
    /// The tracked file does not exist.
    #[error("file not found: {path}")]
    FileNotFound { path: String },
    /// The tracked file cannot be opened.
    #[error("permission denied: {path}")]
    PermissionDenied { path: String },
    /// Any other I/O failure.
    #[error("i/o error on {path}: {message}")]
    Io { path: String, message: String },

    // Per-client
    /// The subscriber stayed saturated for the eviction window.
    #[error("subscriber evicted after sustained backpressure")]
    BackpressureEviction,
    /// The client connection went away.
    #[error("transport closed: {reason}")]
    TransportClosed { reason: String },
    /// The logical name is not on the allow-list.
    #[error("unknown file: {name}")]
    UnknownFile { name: String },
}

impl TailError {
    /// Classify an I/O error raised while touching `path`.
    pub fn from_io(err: &io::Error, path: &Path) -> Self {
        let path = path.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => Self::FileNotFound { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io {
                path,
                message: err.to_string(),
            },
        }
    }

    /// Wire-level classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FileNotFound { .. } => ErrorKind::FileNotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Io { .. } => ErrorKind::Io,
            Self::BackpressureEviction => ErrorKind::BackpressureEviction,
            Self::TransportClosed { .. } => ErrorKind::TransportClosed,
            Self::UnknownFile { .. } => ErrorKind::UnknownFile,
        }
    }

    /// Whether the tail task keeps retrying after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FileNotFound { .. } | Self::PermissionDenied { .. } | Self::Io { .. }
        )
    }

    /// Whether this error ends the client session that observed it.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            Self::BackpressureEviction | Self::TransportClosed { .. }
        )
    }
}
