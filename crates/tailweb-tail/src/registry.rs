//! Keyed registry of tracked files.
//!
//! A tracked file is created by the first `attach` for its name and torn
//! down by the reaper once it has had no subscribers for `idle_timeout`.
//! Creation and teardown for one name are serialised by the map entry lock,
//! so an attach never lands on a channel that is being closed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use tailweb_core::{AllowList, Backoff, FileSnapshot, HubEvent, SubscriberId, TailError};
use tailweb_hub::{BroadcastHub, CloseReason, Subscription, SubscriptionOptions};
use tailweb_telemetry::metrics::TRACKED_FILES_ACTIVE;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::reader::{self, ReaderConfig, TailReader};
use crate::task::{FileStatus, TailTask};
use crate::watcher::{FileWatcher, WatcherConfig};

/// Registry-wide settings.
#[derive(Clone, Debug)]
pub struct TailConfig {
    /// Watcher parameters, shared by every file.
    pub watcher: WatcherConfig,
    /// Reader limits and backfill policy.
    pub reader: ReaderConfig,
    /// Tear down a file after this long without subscribers.
    pub idle_timeout: Duration,
    /// Reaper period.
    pub reap_interval: Duration,
    /// Byte budget for [`TailRegistry::last_lines`].
    pub last_lines_max_bytes: u64,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            watcher: WatcherConfig::default(),
            reader: ReaderConfig::default(),
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(1),
            last_lines_max_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Point-in-time view of one tracked file. Never includes the path.
#[derive(Clone, Debug, Serialize)]
pub struct TrackedFileStatus {
    /// Logical name.
    pub name: String,
    /// Current subscriptions.
    pub subscribers: usize,
    /// Seconds since tracking began.
    pub tracked_secs: u64,
    /// Seconds without subscribers, if idle.
    pub idle_secs: Option<u64>,
    /// Reader and watcher counters.
    #[serde(flatten)]
    pub file: FileStatus,
}

/// Allow-list entry as shown to clients: existence and size, no path.
#[derive(Clone, Debug, Serialize)]
pub struct FileInfo {
    /// Logical name.
    pub name: String,
    /// Whether the path currently exists.
    pub exists: bool,
    /// Size in bytes, if it exists.
    pub size: Option<u64>,
    /// Whether a tail task is running for it.
    pub tracked: bool,
}

struct TrackedFile {
    status: Arc<Mutex<FileStatus>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    created: Instant,
    idle_since: Option<Instant>,
}

struct RegistryInner {
    files: AllowList,
    hub: BroadcastHub,
    config: TailConfig,
    tracked: DashMap<String, TrackedFile>,
    shutdown: CancellationToken,
}

/// Owns every tracked file's tail task.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TailRegistry {
    inner: Arc<RegistryInner>,
}

impl TailRegistry {
    /// Registry over `files`, publishing into `hub`.
    pub fn new(files: AllowList, hub: BroadcastHub, config: TailConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                files,
                hub,
                config,
                tracked: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The allow-list clients choose from.
    pub fn files(&self) -> &AllowList {
        &self.inner.files
    }

    /// The hub tracked files publish into.
    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    /// Subscribe `id` to the logical file `name`, starting its tail task if
    /// it is not already tracked.
    pub async fn attach(
        &self,
        name: &str,
        id: SubscriberId,
        options: SubscriptionOptions,
    ) -> Result<Subscription, TailError> {
        let path = self.inner.files.resolve(name)?.to_path_buf();

        if let Some(mut tracked) = self.inner.tracked.get_mut(name) {
            tracked.idle_since = None;
            return self.subscribe(name, id, options);
        }

        let prepared = self.prepare(name, path).await?;

        let created = match self.inner.tracked.entry(name.to_owned()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().idle_since = None;
                return self.subscribe(name, id, options);
            }
            Entry::Vacant(entry) => {
                let _ = self
                    .inner
                    .hub
                    .open_with_backfill(name, prepared.backfill);
                let subscription = self.subscribe(name, id, options)?;
                let cancel = self.inner.shutdown.child_token();
                let watcher_config = &self.inner.config.watcher;
                let task = TailTask::new(
                    name.to_owned(),
                    self.inner.hub.clone(),
                    prepared.reader,
                    prepared.watcher,
                    Arc::clone(&prepared.status),
                    cancel.clone(),
                    Backoff::new(watcher_config.backoff_base, watcher_config.backoff_max),
                );
                let now = Instant::now();
                let _ = entry.insert(TrackedFile {
                    status: prepared.status,
                    cancel,
                    task: tokio::spawn(task.run(prepared.attach_error)),
                    created: now,
                    idle_since: None,
                });
                subscription
            }
        };

        metrics::gauge!(TRACKED_FILES_ACTIVE).set(self.inner.tracked.len() as f64);
        info!(file = name, "tracking file");
        Ok(created)
    }

    /// Drop a subscription by id.
    pub fn detach(&self, id: &SubscriberId) -> bool {
        self.inner.hub.unsubscribe(id)
    }

    /// Status of every tracked file, sorted by name.
    pub fn status(&self) -> Vec<TrackedFileStatus> {
        let now = Instant::now();
        let mut out: Vec<TrackedFileStatus> = self
            .inner
            .tracked
            .iter()
            .map(|entry| TrackedFileStatus {
                name: entry.key().clone(),
                subscribers: self.inner.hub.subscriber_count(entry.key()),
                tracked_secs: now.duration_since(entry.created).as_secs(),
                idle_secs: entry.idle_since.map(|since| now.duration_since(since).as_secs()),
                file: entry.status.lock().clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Number of tracked files.
    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.len()
    }

    /// Whether `name` currently has a tail task.
    pub fn is_tracked(&self, name: &str) -> bool {
        self.inner.tracked.contains_key(name)
    }

    /// Existence and size of every allow-listed file, sorted by name.
    pub async fn file_info(&self) -> Vec<FileInfo> {
        let mut out = Vec::with_capacity(self.inner.files.len());
        for (name, path) in self.inner.files.iter() {
            let size = tokio::fs::metadata(path).await.ok().map(|m| m.len());
            out.push(FileInfo {
                name: name.to_owned(),
                exists: size.is_some(),
                size,
                tracked: self.is_tracked(name),
            });
        }
        out
    }

    /// Last `lines` complete lines of an allow-listed file, read directly.
    pub async fn last_lines(&self, name: &str, lines: usize) -> Result<Vec<String>, TailError> {
        let path = self.inner.files.resolve(name)?.to_path_buf();
        let max_bytes = self.inner.config.last_lines_max_bytes;
        let display = path.display().to_string();
        tokio::task::spawn_blocking(move || reader::read_last_lines(&path, lines, max_bytes))
            .await
            .map_err(|e| TailError::Io {
                path: display,
                message: e.to_string(),
            })?
    }

    /// Tear down files idle for longer than `idle_timeout`. Returns their names.
    pub fn reap_idle(&self) -> Vec<String> {
        let now = Instant::now();
        let idle_timeout = self.inner.config.idle_timeout;
        let hub = &self.inner.hub;
        let mut reaped = Vec::new();

        self.inner.tracked.retain(|name, file| {
            if hub.subscriber_count(name) > 0 {
                file.idle_since = None;
                return true;
            }
            let since = *file.idle_since.get_or_insert(now);
            if now.duration_since(since) < idle_timeout {
                return true;
            }
            file.cancel.cancel();
            let _ = hub.close(name, CloseReason::FileClosed);
            reaped.push(name.clone());
            false
        });

        if !reaped.is_empty() {
            metrics::gauge!(TRACKED_FILES_ACTIVE).set(self.inner.tracked.len() as f64);
            for name in &reaped {
                info!(file = %name, "idle file torn down");
            }
        }
        reaped
    }

    /// Run [`reap_idle`](Self::reap_idle) every `reap_interval` until shutdown.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.inner.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = registry.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = registry.reap_idle();
                    }
                }
            }
            debug!("idle reaper stopped");
        })
    }

    /// Stop every tail task and close every channel.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let names: Vec<String> = self.inner.tracked.iter().map(|e| e.key().clone()).collect();
        let mut tasks = Vec::with_capacity(names.len());
        for name in names {
            if let Some((_, file)) = self.inner.tracked.remove(&name) {
                file.cancel.cancel();
                let _ = self.inner.hub.close(&name, CloseReason::Shutdown);
                tasks.push(file.task);
            }
        }
        for task in tasks {
            let _ = task.await;
        }
        metrics::gauge!(TRACKED_FILES_ACTIVE).set(0.0);
        info!("tail registry stopped");
    }

    fn subscribe(
        &self,
        name: &str,
        id: SubscriberId,
        options: SubscriptionOptions,
    ) -> Result<Subscription, TailError> {
        self.inner
            .hub
            .subscribe(name, id, options)
            .map_err(|_| TailError::UnknownFile {
                name: name.to_owned(),
            })
    }

    /// Open the file and apply the backfill policy, off the async runtime.
    async fn prepare(&self, name: &str, path: PathBuf) -> Result<Prepared, TailError> {
        let mut reader = TailReader::new(path.clone(), self.inner.config.reader.clone());
        let display = path.display().to_string();
        let (reader, attached) = tokio::task::spawn_blocking(move || {
            let attached = reader.attach();
            (reader, attached)
        })
        .await
        .map_err(|e| TailError::Io {
            path: display,
            message: e.to_string(),
        })?;

        let (backfill, snapshot, attach_error) = match attached {
            Ok(attached) => (
                attached.records.into_iter().map(HubEvent::Line).collect(),
                Some(attached.snapshot),
                None,
            ),
            Err(err) => {
                debug!(file = name, error = %err, "file unavailable at attach, the tail task retries");
                (Vec::new(), None, Some(err))
            }
        };

        let status = FileStatus {
            offset: reader.offset(),
            size: snapshot.map_or(0, |s| s.size),
            fingerprint: snapshot.and_then(|s| s.fingerprint),
            next_seq: reader.next_seq(),
            ..FileStatus::default()
        };
        let watcher =
            FileWatcher::new(path, self.inner.config.watcher.clone()).with_snapshot(snapshot);

        Ok(Prepared {
            reader,
            watcher,
            backfill,
            status: Arc::new(Mutex::new(status)),
            attach_error,
        })
    }
}

impl std::fmt::Debug for TailRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailRegistry")
            .field("files", &self.inner.files.len())
            .field("tracked", &self.inner.tracked.len())
            .finish_non_exhaustive()
    }
}

struct Prepared {
    reader: TailReader,
    watcher: FileWatcher,
    backfill: Vec<HubEvent>,
    status: Arc<Mutex<FileStatus>>,
    attach_error: Option<TailError>,
}
