//! Hub error types.

use tailweb_core::ErrorKind;
use thiserror::Error;

/// Errors returned by [`BroadcastHub`](crate::BroadcastHub) operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HubError {
    /// No channel is open for this file.
    #[error("no open channel for file {file:?}")]
    UnknownFile {
        /// Logical file name.
        file: String,
    },
}

impl HubError {
    /// Wire-level classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownFile { .. } => ErrorKind::UnknownFile,
        }
    }
}
