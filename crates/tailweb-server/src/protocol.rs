//! WebSocket wire protocol.
//!
//! Every frame is a JSON text message tagged by `type`. Data messages
//! (`line`, `rotation`, `dropped`, `error`) carry `seq` where one applies and a
//! `payload` object.
//!
//! Client → server: `select` (alias `switch-file`), `clear`, `pause`,
//! `resume`, `close`, `ping`. A bare `ping` text frame is accepted too.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tailweb_core::{ErrorKind, FileFault, HubEvent, RotationCause};
use tailweb_hub::DropNotice;

// ─────────────────────────────────────────────────────────────────────────────
// Client → server
// ─────────────────────────────────────────────────────────────────────────────

/// A control message sent by the browser.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to a logical file, replacing any current subscription.
    #[serde(alias = "switch-file", alias = "switch_file")]
    Select {
        /// Allow-listed logical name.
        file: String,
        /// Clear marker carried over from a previous session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<u64>,
        /// Ask the publisher to wait briefly instead of dropping. Only
        /// honoured while this is the file's sole subscriber.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        lossless: bool,
    },
    /// Hide everything published so far from this view.
    Clear,
    /// Stop forwarding lines until `resume`.
    Pause,
    /// Resume forwarding; lines skipped while paused are summarised.
    Resume,
    /// End the session.
    Close,
    /// Application-level keepalive.
    Ping,
}

impl ClientMessage {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        if text.trim().eq_ignore_ascii_case("ping") {
            return Ok(Self::Ping);
        }
        serde_json::from_str(text)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → client
// ─────────────────────────────────────────────────────────────────────────────

/// A message pushed to the browser.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame of every session.
    Hello {
        /// Greeting details.
        payload: HelloPayload,
    },
    /// A `select` succeeded.
    Selected {
        /// Newest published sequence number at subscription time.
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        /// Subscription details.
        payload: SelectedPayload,
    },
    /// One log line.
    Line {
        /// Per-file sequence number.
        seq: u64,
        /// Line content.
        payload: LinePayload,
    },
    /// The file was rotated or truncated. Precedes the next generation's lines.
    Rotation {
        /// Position of the marker in the file's sequence.
        seq: u64,
        /// Rotation details.
        payload: RotationPayload,
    },
    /// Lines were skipped ahead of the next message.
    Dropped {
        /// Highest skipped sequence number.
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        /// What was skipped and why.
        payload: DroppedPayload,
    },
    /// A file fault or session error.
    Error {
        /// Error details.
        payload: ErrorPayload,
    },
    /// `clear` acknowledged; nothing at or below `seq` will follow.
    Cleared {
        /// The clear marker.
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        /// Which file the marker applies to.
        payload: FilePayload,
    },
    /// `pause` acknowledged.
    Paused {
        /// Which file was paused.
        payload: FilePayload,
    },
    /// `resume` acknowledged.
    Resumed {
        /// Which file was resumed.
        payload: FilePayload,
    },
    /// Reply to `ping`.
    Pong,
}

/// Payload of [`ServerMessage::Hello`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HelloPayload {
    /// This connection's id.
    pub connection_id: String,
    /// Logical names the client may select.
    pub files: Vec<String>,
}

/// Payload of [`ServerMessage::Selected`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SelectedPayload {
    /// Selected logical name.
    pub file: String,
    /// Hub subscription id.
    pub subscriber_id: String,
    /// Clear marker in effect, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<u64>,
}

/// Payload of [`ServerMessage::Line`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinePayload {
    /// Logical name.
    pub file: String,
    /// Decoded text, without the terminator.
    pub text: String,
    /// When the line was read.
    pub at: DateTime<Utc>,
    /// Invalid UTF-8 was replaced.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub lossy: bool,
}

/// Payload of [`ServerMessage::Rotation`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RotationPayload {
    /// Logical name.
    pub file: String,
    /// Replaced or truncated.
    pub cause: RotationCause,
    /// Size before the rotation, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_size: Option<u64>,
    /// Size after the rotation.
    pub new_size: u64,
    /// When the rotation was observed.
    pub at: DateTime<Utc>,
}

/// Why lines were skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The subscription queue overflowed.
    Backpressure,
    /// The view was paused.
    Paused,
}

/// Payload of [`ServerMessage::Dropped`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DroppedPayload {
    /// Logical name.
    pub file: String,
    /// Entries skipped.
    pub count: u64,
    /// Lowest skipped sequence number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seq: Option<u64>,
    /// Highest skipped sequence number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
    /// Rotation markers among the skipped entries.
    pub rotations: u64,
    /// Overflow or pause.
    pub reason: DropReason,
}

/// Payload of [`ServerMessage::Error`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    /// Stable classification.
    pub kind: ErrorKind,
    /// Human readable detail, never a filesystem path.
    pub message: String,
    /// The server closes the session after a fatal error.
    pub fatal: bool,
    /// Logical name, when the error concerns a file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Payload naming a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FilePayload {
    /// Logical name, if one is selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl ServerMessage {
    /// Wire form of a hub event for `file`.
    pub fn from_event(file: &str, event: &HubEvent) -> Self {
        match event {
            HubEvent::Line(line) => Self::Line {
                seq: line.seq,
                payload: LinePayload {
                    file: file.to_owned(),
                    text: line.text.clone(),
                    at: line.at,
                    lossy: line.lossy,
                },
            },
            HubEvent::Rotation(rotation) => Self::Rotation {
                seq: rotation.seq,
                payload: RotationPayload {
                    file: file.to_owned(),
                    cause: rotation.cause,
                    old_size: rotation.old.map(|s| s.size),
                    new_size: rotation.new.size,
                    at: rotation.at,
                },
            },
            HubEvent::Fault(fault) => Self::fault(file, fault),
        }
    }

    /// Non-fatal `error` for a file fault.
    pub fn fault(file: &str, fault: &FileFault) -> Self {
        Self::Error {
            payload: ErrorPayload {
                kind: fault.kind,
                message: fault.message.clone(),
                fatal: false,
                file: Some(file.to_owned()),
            },
        }
    }

    /// `dropped` summary.
    pub fn dropped(file: &str, notice: DropNotice, reason: DropReason) -> Self {
        Self::Dropped {
            seq: notice.last_seq,
            payload: DroppedPayload {
                file: file.to_owned(),
                count: notice.count,
                first_seq: notice.first_seq,
                last_seq: notice.last_seq,
                rotations: notice.rotations,
                reason,
            },
        }
    }

    /// `error` not tied to a file event.
    pub fn error(kind: ErrorKind, message: impl Into<String>, fatal: bool, file: Option<&str>) -> Self {
        Self::Error {
            payload: ErrorPayload {
                kind,
                message: message.into(),
                fatal,
                file: file.map(ToOwned::to_owned),
            },
        }
    }

    /// Serialize to a text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize server message");
            String::from(r#"{"type":"error","payload":{"kind":"io","message":"serialization failed","fatal":false}}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::Value;
    use tailweb_core::{FileSnapshot, LineRecord, RotationEvent};

    fn value(msg: &ServerMessage) -> Value {
        serde_json::from_str(&msg.to_json()).unwrap()
    }

    #[test]
    fn parses_select() {
        let msg = ClientMessage::parse(r#"{"type":"select","file":"app"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Select {
                file: "app".into(),
                after: None,
                lossless: false,
            }
        );
    }

    #[test]
    fn switch_file_is_an_alias_for_select() {
        let msg = ClientMessage::parse(r#"{"type":"switch-file","file":"db","after":41}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Select {
                file: "db".into(),
                after: Some(41),
                lossless: false,
            }
        );
    }

    #[test]
    fn lossless_flag_is_optional() {
        let msg =
            ClientMessage::parse(r#"{"type":"select","file":"app","lossless":true}"#).unwrap();
        assert_matches!(msg, ClientMessage::Select { lossless: true, .. });
    }

    #[test]
    fn parses_unit_messages() {
        assert_eq!(ClientMessage::parse(r#"{"type":"clear"}"#).unwrap(), ClientMessage::Clear);
        assert_eq!(ClientMessage::parse(r#"{"type":"close"}"#).unwrap(), ClientMessage::Close);
        assert_eq!(ClientMessage::parse(r#"{"type":"pause"}"#).unwrap(), ClientMessage::Pause);
        assert_eq!(ClientMessage::parse(r#"{"type":"resume"}"#).unwrap(), ClientMessage::Resume);
    }

    #[test]
    fn bare_ping_text_is_accepted() {
        assert_eq!(ClientMessage::parse("ping").unwrap(), ClientMessage::Ping);
        assert_eq!(ClientMessage::parse(" PING\n").unwrap(), ClientMessage::Ping);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(ClientMessage::parse(r#"{"type":"read","path":"/etc/passwd"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn line_wire_shape() {
        let event = HubEvent::Line(LineRecord::decode(7, b"hello"));
        let v = value(&ServerMessage::from_event("app", &event));
        assert_eq!(v["type"], "line");
        assert_eq!(v["seq"], 7);
        assert_eq!(v["payload"]["text"], "hello");
        assert_eq!(v["payload"]["file"], "app");
        assert!(v["payload"].get("lossy").is_none());
    }

    #[test]
    fn rotation_wire_shape() {
        let event = HubEvent::Rotation(RotationEvent {
            seq: 3,
            old: Some(FileSnapshot {
                fingerprint: None,
                size: 100,
                modified: None,
            }),
            new: FileSnapshot {
                fingerprint: None,
                size: 0,
                modified: None,
            },
            cause: RotationCause::Truncated,
            at: Utc::now(),
        });
        let v = value(&ServerMessage::from_event("app", &event));
        assert_eq!(v["type"], "rotation");
        assert_eq!(v["seq"], 3);
        assert_eq!(v["payload"]["cause"], "truncated");
        assert_eq!(v["payload"]["old_size"], 100);
    }

    #[test]
    fn fault_becomes_non_fatal_error() {
        let event = HubEvent::Fault(FileFault {
            kind: ErrorKind::FileNotFound,
            message: "waiting for file to appear".into(),
            at: Utc::now(),
        });
        let msg = ServerMessage::from_event("app", &event);
        assert_matches!(&msg, ServerMessage::Error { payload } if !payload.fatal);
        let v = value(&msg);
        assert_eq!(v["payload"]["kind"], "file_not_found");
    }

    #[test]
    fn dropped_wire_shape() {
        let notice = DropNotice {
            count: 5,
            first_seq: Some(10),
            last_seq: Some(14),
            rotations: 0,
        };
        let v = value(&ServerMessage::dropped("app", notice, DropReason::Backpressure));
        assert_eq!(v["type"], "dropped");
        assert_eq!(v["seq"], 14);
        assert_eq!(v["payload"]["count"], 5);
        assert_eq!(v["payload"]["reason"], "backpressure");
    }

    #[test]
    fn eviction_error_is_fatal() {
        let v = value(&ServerMessage::error(
            ErrorKind::BackpressureEviction,
            "too slow",
            true,
            Some("app"),
        ));
        assert_eq!(v["type"], "error");
        assert_eq!(v["payload"]["kind"], "backpressure_eviction");
        assert_eq!(v["payload"]["fatal"], true);
    }

    #[test]
    fn pong_is_just_a_type() {
        assert_eq!(ServerMessage::Pong.to_json(), r#"{"type":"pong"}"#);
    }
}
