//! Records that flow from the reader, through the hub, to each session.
//!
//! A [`HubEvent`] is immutable once published; the hub hands out `Arc`s so
//! fan-out never copies line text.

use std::fs::Metadata;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, TailError};

/// Stable identity of an on-disk file (device + inode).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Device number.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
}

impl Fingerprint {
    /// Identity of the file described by `meta`, where the platform exposes one.
    #[cfg(unix)]
    pub fn of(meta: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    /// Identity of the file described by `meta`, where the platform exposes one.
    #[cfg(not(unix))]
    pub fn of(_meta: &Metadata) -> Option<Self> {
        None
    }
}

/// Point-in-time view of a tracked file, as seen by `stat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// `None` on platforms without an inode equivalent.
    pub fingerprint: Option<Fingerprint>,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, when the filesystem reports one.
    pub modified: Option<DateTime<Utc>>,
}

impl FileSnapshot {
    /// Build a snapshot from file metadata.
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            fingerprint: Fingerprint::of(meta),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }
    }

    /// Whether `other` is known to be a different file than `self`.
    ///
    /// Unknown identity on either side is never treated as a change.
    pub fn identity_differs(&self, other: &FileSnapshot) -> bool {
        match (self.fingerprint, other.fingerprint) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }
}

/// Why a tracked file's read position was reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationCause {
    /// The path now refers to a different file (rename/recreate).
    Replaced,
    /// Same file, but it shrank (truncate in place, copy-truncate).
    Truncated,
}

impl RotationCause {
    /// Short label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replaced => "replaced",
            Self::Truncated => "truncated",
        }
    }
}

/// Discontinuity marker published before any line from the new content.
///
/// The marker takes its own slot in the file's sequence: lines before the
/// rotation are below `seq`, lines after it start at `seq + 1`. A clear marker
/// placed on the rotation therefore never hides the first new line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEvent {
    /// Position of the marker in the file's sequence.
    pub seq: u64,
    /// Last snapshot before the rotation, if the file had been seen.
    pub old: Option<FileSnapshot>,
    /// First snapshot after the rotation.
    pub new: FileSnapshot,
    /// What kind of discontinuity was detected.
    pub cause: RotationCause,
    /// When the rotation was observed.
    pub at: DateTime<Utc>,
}

/// One complete line read from a tracked file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecord {
    /// Monotonic per tracked file.
    pub seq: u64,
    /// Line text without its terminator.
    pub text: String,
    /// When the reader produced the record.
    pub at: DateTime<Utc>,
    /// `true` when the raw bytes were not valid UTF-8 and were replaced.
    pub lossy: bool,
}

impl LineRecord {
    /// Decode `bytes` into a record, replacing invalid UTF-8.
    pub fn decode(seq: u64, bytes: &[u8]) -> Self {
        let (text, lossy) = match std::str::from_utf8(bytes) {
            Ok(s) => (s.to_owned(), false),
            Err(_) => (String::from_utf8_lossy(bytes).into_owned(), true),
        };
        Self {
            seq,
            text,
            at: Utc::now(),
            lossy,
        }
    }
}

/// A non-fatal file-level problem surfaced to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFault {
    /// Wire-level classification.
    pub kind: ErrorKind,
    /// Human readable detail. Never contains the filesystem path.
    pub message: String,
    /// When the fault was first observed.
    pub at: DateTime<Utc>,
}

impl FileFault {
    /// Build a fault from an error, stripping any filesystem path.
    pub fn from_error(err: &TailError) -> Self {
        let message = match err {
            TailError::FileNotFound { .. } => "waiting for file to appear".to_owned(),
            TailError::PermissionDenied { .. } => "file is not readable".to_owned(),
            TailError::Io { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            kind: err.kind(),
            message,
            at: Utc::now(),
        }
    }
}

/// Everything the hub fans out for a tracked file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    /// A newly read line.
    Line(LineRecord),
    /// A rotation marker.
    Rotation(RotationEvent),
    /// A watcher fault (file missing, unreadable).
    Fault(FileFault),
}

impl HubEvent {
    /// Sequence number for lines and rotation markers; faults carry none.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Line(line) => Some(line.seq),
            Self::Rotation(rotation) => Some(rotation.seq),
            Self::Fault(_) => None,
        }
    }

    /// Whether this event belongs in the replay history.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Fault(_))
    }
}

impl From<LineRecord> for HubEvent {
    fn from(line: LineRecord) -> Self {
        Self::Line(line)
    }
}

impl From<RotationEvent> for HubEvent {
    fn from(rotation: RotationEvent) -> Self {
        Self::Rotation(rotation)
    }
}

impl From<FileFault> for HubEvent {
    fn from(fault: FileFault) -> Self {
        Self::Fault(fault)
    }
}
