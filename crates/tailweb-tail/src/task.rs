//! The per-file tail loop: watcher events in, hub events out.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tailweb_core::{
    Backoff, ErrorKind, FileFault, Fingerprint, HubEvent, LineRecord, RotationCause, TailError,
};
use tailweb_hub::BroadcastHub;
use tailweb_telemetry::metrics::{
    TAIL_DECODE_ANOMALIES_TOTAL, TAIL_FAULTS_TOTAL, TAIL_LINES_TOTAL, TAIL_ROTATIONS_TOTAL,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reader::TailReader;
use crate::watcher::{FileWatcher, WatchEvent};

/// Live counters for one tracked file.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FileStatus {
    /// Reader byte offset.
    pub offset: u64,
    /// Last observed size.
    pub size: u64,
    /// Last observed identity.
    pub fingerprint: Option<Fingerprint>,
    /// Next sequence number to assign.
    pub next_seq: u64,
    /// Lines published since tracking began.
    pub lines_read: u64,
    /// Rotations observed.
    pub rotations: u64,
    /// Lines that were not valid UTF-8.
    pub decode_anomalies: u64,
    /// Current fault, if any.
    pub last_fault: Option<FileFault>,
}

pub(crate) struct TailTask {
    name: String,
    hub: BroadcastHub,
    reader: Option<TailReader>,
    watcher: FileWatcher,
    status: Arc<Mutex<FileStatus>>,
    cancel: CancellationToken,
    /// Kind of the open or read failure currently being retried.
    fault: Option<ErrorKind>,
    backoff: Backoff,
    retry: Option<Instant>,
}

enum Step {
    Watch(WatchEvent),
    Retry,
}

impl TailTask {
    pub(crate) fn new(
        name: String,
        hub: BroadcastHub,
        reader: TailReader,
        watcher: FileWatcher,
        status: Arc<Mutex<FileStatus>>,
        cancel: CancellationToken,
        backoff: Backoff,
    ) -> Self {
        Self {
            name,
            hub,
            reader: Some(reader),
            watcher,
            status,
            cancel,
            fault: None,
            backoff,
            retry: None,
        }
    }

    /// Tail until cancelled. `attach_error` is the failure, if any, from the
    /// initial attach; it opens a fault episode like any later read failure.
    pub(crate) async fn run(mut self, attach_error: Option<TailError>) {
        debug!(file = %self.name, "tail task started");
        let mut keep_going = match attach_error {
            Some(err) => self.read_failed(err).await,
            None => true,
        };
        while keep_going {
            if self.fault.is_some() && self.retry.is_none() {
                self.retry = Some(Instant::now() + self.backoff.next_delay());
            }
            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = retry_due(self.retry) => {
                    self.retry = None;
                    // Let the watcher see a rotation before reading again.
                    match self.watcher.poll_now().await {
                        Some(event) => Step::Watch(event),
                        None => Step::Retry,
                    }
                }
                event = self.watcher.next_event() => Step::Watch(event),
            };
            keep_going = match step {
                Step::Watch(event) => self.on_watch_event(event).await,
                Step::Retry => {
                    let size = self.status.lock().size;
                    self.catch_up(size).await
                }
            };
        }
        debug!(file = %self.name, "tail task stopped");
    }

    async fn on_watch_event(&mut self, event: WatchEvent) -> bool {
        match event {
            WatchEvent::Grown { size } => {
                self.status.lock().size = size;
                self.catch_up(size).await
            }
            WatchEvent::Rotated { old, new, cause } => {
                let Some(reader) = self.reader.as_mut() else {
                    return false;
                };
                let rotation = reader.rotate(old, new, cause);
                info!(
                    file = %self.name,
                    kind = ErrorKind::RotationDetected.as_str(),
                    cause = cause.as_str(),
                    old_size = old.map(|s| s.size),
                    new_size = new.size,
                    seq = rotation.seq,
                    "rotation detected"
                );
                self.record_rotation(cause, new.size, new.fingerprint);
                self.publish(HubEvent::Rotation(rotation)).await && self.catch_up(new.size).await
            }
            WatchEvent::Fault(fault) => {
                warn!(file = %self.name, kind = fault.kind.as_str(), message = %fault.message, "file fault");
                self.report_fault(fault).await
            }
            WatchEvent::Recovered => {
                info!(file = %self.name, "file available again");
                // A read failure that persists is reported again on the next
                // attempt.
                self.fault = None;
                self.status.lock().last_fault = None;
                self.hub.clear_fault(&self.name);
                true
            }
        }
    }

    /// Read until the reader's offset reaches `size`. Returns `false` when the
    /// task should stop.
    async fn catch_up(&mut self, size: u64) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let Some(mut reader) = self.reader.take() else {
                return false;
            };
            let joined = tokio::task::spawn_blocking(move || {
                let result = reader.read_to(size);
                (reader, result)
            })
            .await;
            let (reader, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(file = %self.name, error = %e, "reader task failed");
                    return false;
                }
            };
            {
                let mut status = self.status.lock();
                status.offset = reader.offset();
                status.next_seq = reader.next_seq();
            }
            self.reader = Some(reader);

            match result {
                Ok(batch) => {
                    self.read_recovered();
                    if !self.publish_lines(batch.records).await {
                        return false;
                    }
                    if !batch.more {
                        return true;
                    }
                }
                Err(err) => return self.read_failed(err).await,
            }
        }
    }

    /// Surface an open or read failure once per episode. The retry runs on
    /// the backoff schedule from the main loop.
    async fn read_failed(&mut self, err: TailError) -> bool {
        if !err.is_retryable() {
            error!(file = %self.name, error = %err, "unrecoverable read failure");
            return false;
        }
        if err.kind() == ErrorKind::FileNotFound {
            // The watcher reports missing files from its own stat.
            debug!(file = %self.name, error = %err, "file vanished before it was read");
            self.fault = None;
            return true;
        }
        if self.fault == Some(err.kind()) {
            debug!(file = %self.name, error = %err, "read still failing");
            return true;
        }
        warn!(file = %self.name, kind = err.kind().as_str(), error = %err, "file unreadable");
        self.fault = Some(err.kind());
        self.report_fault(FileFault::from_error(&err)).await
    }

    fn read_recovered(&mut self) {
        if self.fault.take().is_none() {
            return;
        }
        info!(file = %self.name, "file readable again");
        self.retry = None;
        self.backoff.reset();
        self.status.lock().last_fault = None;
        self.hub.clear_fault(&self.name);
    }

    async fn report_fault(&self, fault: FileFault) -> bool {
        metrics::counter!(TAIL_FAULTS_TOTAL, "file" => self.name.clone(), "kind" => fault.kind.as_str())
            .increment(1);
        self.status.lock().last_fault = Some(fault.clone());
        self.publish(HubEvent::Fault(fault)).await
    }

    async fn publish_lines(&mut self, records: Vec<LineRecord>) -> bool {
        if records.is_empty() {
            return true;
        }
        let count = records.len() as u64;
        let anomalies = records.iter().filter(|r| r.lossy).count() as u64;
        for record in records {
            if record.lossy {
                debug!(
                    file = %self.name,
                    seq = record.seq,
                    kind = ErrorKind::DecodeAnomaly.as_str(),
                    "invalid UTF-8 replaced"
                );
            }
            if !self.publish(HubEvent::Line(record)).await {
                return false;
            }
        }
        metrics::counter!(TAIL_LINES_TOTAL, "file" => self.name.clone()).increment(count);
        if anomalies > 0 {
            metrics::counter!(TAIL_DECODE_ANOMALIES_TOTAL, "file" => self.name.clone())
                .increment(anomalies);
        }
        let mut status = self.status.lock();
        status.lines_read += count;
        status.decode_anomalies += anomalies;
        true
    }

    async fn publish(&self, event: HubEvent) -> bool {
        match self.hub.publish(&self.name, event).await {
            Ok(report) => {
                if report.dropped > 0 {
                    debug!(file = %self.name, dropped = report.dropped, "publish overflowed slow subscribers");
                }
                true
            }
            Err(e) => {
                debug!(file = %self.name, error = %e, "channel gone, stopping");
                false
            }
        }
    }

    fn record_rotation(&self, cause: RotationCause, size: u64, fingerprint: Option<Fingerprint>) {
        metrics::counter!(TAIL_ROTATIONS_TOTAL, "file" => self.name.clone(), "cause" => cause.as_str())
            .increment(1);
        let mut status = self.status.lock();
        status.rotations += 1;
        status.offset = 0;
        status.size = size;
        status.fingerprint = fingerprint;
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
