//! Growth and rotation detection for one tracked file.
//!
//! Polling `stat` on a fixed interval is the baseline. When enabled, a
//! `notify` watcher on the parent directory only shortens the wait.
//!
//! Rotation rules, in order:
//! 1. device/inode changed → `Replaced`
//! 2. same (or unknown) identity, size shrank → `Truncated`
//! 3. file came back after a fault and identity is unknown → `Replaced`

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tailweb_core::{Backoff, ErrorKind, FileFault, FileSnapshot, RotationCause, TailError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Polling and retry parameters.
#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Baseline poll interval.
    pub poll_interval: Duration,
    /// Wake early on filesystem notifications.
    pub use_notify: bool,
    /// First retry delay while faulted.
    pub backoff_base: Duration,
    /// Retry delay cap.
    pub backoff_max: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            use_notify: true,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// What the watcher observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// The file grew to `size` bytes.
    Grown {
        /// New size in bytes.
        size: u64,
    },
    /// The file was replaced or truncated.
    Rotated {
        /// Last snapshot before the change.
        old: Option<FileSnapshot>,
        /// Current snapshot.
        new: FileSnapshot,
        /// Replaced or truncated.
        cause: RotationCause,
    },
    /// The file is missing or unreadable. Emitted once per episode.
    Fault(FileFault),
    /// A fault episode ended.
    Recovered,
}

struct NotifyWake {
    _watcher: notify::RecommendedWatcher,
    rx: mpsc::Receiver<()>,
}

/// Lazy sequence of [`WatchEvent`]s for one path.
pub struct FileWatcher {
    path: PathBuf,
    config: WatcherConfig,
    last: Option<FileSnapshot>,
    fault: Option<ErrorKind>,
    backoff: Backoff,
    pending: VecDeque<WatchEvent>,
    next_wait: Option<Duration>,
    wake: Option<NotifyWake>,
}

impl FileWatcher {
    /// Watch `path`. No snapshot is known yet, so existing content counts as
    /// growth from offset 0.
    pub fn new(path: impl Into<PathBuf>, config: WatcherConfig) -> Self {
        let path = path.into();
        let wake = if config.use_notify {
            setup_notify(&path)
        } else {
            None
        };
        Self {
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            path,
            config,
            last: None,
            fault: None,
            pending: VecDeque::new(),
            next_wait: None,
            wake,
        }
    }

    /// Start from the snapshot the reader positioned its offset against.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: Option<FileSnapshot>) -> Self {
        self.last = snapshot;
        if snapshot.is_some() {
            self.next_wait = Some(self.config.poll_interval);
        }
        self
    }

    /// Wait for the next event. Never ends; faults are retried on backoff.
    pub async fn next_event(&mut self) -> WatchEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            if let Some(delay) = self.next_wait.take() {
                self.sleep(delay).await;
            }
            self.poll().await;
            self.next_wait = Some(if self.fault.is_some() {
                self.backoff.next_delay()
            } else {
                self.config.poll_interval
            });
        }
    }

    /// Last snapshot seen.
    pub fn snapshot(&self) -> Option<FileSnapshot> {
        self.last
    }

    /// Poll right away, outside the regular schedule. Returns the first event
    /// that poll produced; the rest follow from
    /// [`next_event`](Self::next_event).
    pub async fn poll_now(&mut self) -> Option<WatchEvent> {
        if self.pending.is_empty() {
            self.poll().await;
        }
        self.pending.pop_front()
    }

    async fn sleep(&mut self, delay: Duration) {
        let Some(wake) = self.wake.as_mut() else {
            tokio::time::sleep(delay).await;
            return;
        };
        let closed = tokio::select! {
            () = tokio::time::sleep(delay) => false,
            msg = wake.rx.recv() => msg.is_none(),
        };
        if closed {
            self.wake = None;
        }
    }

    async fn poll(&mut self) {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) => {
                let err = TailError::from_io(&e, &self.path);
                if self.fault != Some(err.kind()) {
                    debug!(path = %self.path.display(), error = %err, "watch fault");
                    self.fault = Some(err.kind());
                    self.pending.push_back(WatchEvent::Fault(FileFault::from_error(&err)));
                }
                return;
            }
        };

        let snap = FileSnapshot::from_metadata(&meta);
        let recovered = self.fault.take().is_some();
        if recovered {
            self.backoff.reset();
            self.pending.push_back(WatchEvent::Recovered);
        }

        match self.last {
            None => {
                if snap.size > 0 {
                    self.pending.push_back(WatchEvent::Grown { size: snap.size });
                }
            }
            Some(prev) => {
                let cause = if prev.identity_differs(&snap) {
                    Some(RotationCause::Replaced)
                } else if snap.size < prev.size {
                    Some(RotationCause::Truncated)
                } else if recovered && (prev.fingerprint.is_none() || snap.fingerprint.is_none()) {
                    Some(RotationCause::Replaced)
                } else {
                    None
                };
                match cause {
                    Some(cause) => self.pending.push_back(WatchEvent::Rotated {
                        old: Some(prev),
                        new: snap,
                        cause,
                    }),
                    None if snap.size > prev.size => {
                        self.pending.push_back(WatchEvent::Grown { size: snap.size });
                    }
                    None => {}
                }
            }
        }
        self.last = Some(snap);
    }
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("path", &self.path)
            .field("last", &self.last)
            .field("fault", &self.fault)
            .field("notify", &self.wake.is_some())
            .finish_non_exhaustive()
    }
}

/// Watch the parent directory so creation and renames wake the poller too.
fn setup_notify(path: &Path) -> Option<NotifyWake> {
    use notify::{RecursiveMode, Watcher};

    let (tx, rx) = mpsc::channel::<()>(1);
    let target: Option<OsString> = path.file_name().map(ToOwned::to_owned);
    let mut watcher = match notify::recommended_watcher(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let relevant = event.paths.is_empty()
                    || event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == target.as_deref());
                if relevant {
                    let _ = tx.try_send(());
                }
            }
        },
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "notify unavailable, polling only");
            return None;
        }
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!(dir = %dir.display(), error = %e, "cannot watch directory, polling only");
        return None;
    }
    Some(NotifyWake {
        _watcher: watcher,
        rx,
    })
}
