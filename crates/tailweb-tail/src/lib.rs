//! # tailweb-tail
//!
//! Turns allow-listed files into streams of hub events.
//!
//! - [`FileWatcher`]: growth, rotation and fault detection for one path
//! - [`TailReader`]: offset-tracked, newline-delimited reads with backfill
//! - [`TailRegistry`]: one tail task per tracked file, created on first
//!   attach and reaped after the idle timeout

#![deny(unsafe_code)]

pub mod reader;
pub mod registry;
mod task;
pub mod watcher;

pub use reader::{LineSplitter, ReadBatch, ReaderConfig, TailReader, read_last_lines};
pub use registry::{FileInfo, TailConfig, TailRegistry, TrackedFileStatus};
pub use task::FileStatus;
pub use watcher::{FileWatcher, WatchEvent, WatcherConfig};
