//! # tailweb-core
//!
//! Domain types shared by every tailweb crate.
//!
//! - [`records`]: `LineRecord`, `RotationEvent`, `HubEvent` and file identity
//! - [`errors`]: the `TailError` taxonomy and its wire-level `ErrorKind`
//! - [`allowlist`]: logical file name → absolute path mapping
//! - [`backoff`]: capped exponential backoff for fault retries
//! - [`ids`]: prefixed identifiers for subscribers and connections

#![deny(unsafe_code)]

pub mod allowlist;
pub mod backoff;
pub mod errors;
pub mod ids;
pub mod records;

pub use allowlist::{AllowList, AllowListError};
pub use backoff::Backoff;
pub use errors::{ErrorKind, TailError};
pub use ids::{ConnectionId, SubscriberId};
pub use records::{
    FileFault, FileSnapshot, Fingerprint, HubEvent, LineRecord, RotationCause, RotationEvent,
};
