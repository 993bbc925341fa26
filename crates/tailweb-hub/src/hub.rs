//! Per-file fan-out of hub events to bounded subscriber queues.
//!
//! Each open file owns a [`FileChannel`]: a short `parking_lot` mutex over its
//! replay history and copy-on-write subscriber list, plus an async mutex that
//! serialises publishers of that file only. Subscribing never touches the
//! publish mutex, so registration cannot stall a publish and vice versa.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tailweb_core::{HubEvent, SubscriberId};
use tailweb_telemetry::metrics::{
    HUB_EVICTIONS_TOTAL, HUB_RECORDS_DROPPED_TOTAL, HUB_SUBSCRIPTIONS_ACTIVE,
};
use tracing::{debug, info, warn};

use crate::errors::HubError;
use crate::queue::{
    CloseReason, Offer, OverflowPolicy, Replay, Subscription, SubscriptionOptions,
    SubscriptionQueue,
};

/// Hub-wide sizing.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Lines and rotation markers retained per file for replay.
    pub history_capacity: usize,
    /// How long a subscription may drop continuously before eviction.
    pub eviction_window: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            eviction_window: Duration::from_secs(30),
        }
    }
}

/// Outcome of one [`BroadcastHub::publish`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscriptions that queued the event without loss.
    pub delivered: usize,
    /// Subscriptions that had to drop an older entry.
    pub dropped: usize,
    /// Subscriptions evicted by this publish.
    pub evicted: Vec<SubscriberId>,
}

struct ChannelState {
    history: VecDeque<Arc<HubEvent>>,
    last_fault: Option<Arc<HubEvent>>,
    subscribers: Arc<Vec<Arc<SubscriptionQueue>>>,
    latest_seq: Option<u64>,
}

/// Shared state for one tracked file.
struct FileChannel {
    name: String,
    state: Mutex<ChannelState>,
    publish_lock: tokio::sync::Mutex<()>,
}

impl FileChannel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: Mutex::new(ChannelState {
                history: VecDeque::new(),
                last_fault: None,
                subscribers: Arc::new(Vec::new()),
                latest_seq: None,
            }),
            publish_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn remember(state: &mut ChannelState, event: &Arc<HubEvent>, history_capacity: usize) {
        if !event.is_replayable() {
            state.last_fault = Some(Arc::clone(event));
            return;
        }
        if let Some(seq) = event.seq() {
            state.latest_seq = Some(seq);
        }
        state.last_fault = None;
        if history_capacity == 0 {
            return;
        }
        if state.history.len() == history_capacity {
            let _ = state.history.pop_front();
        }
        state.history.push_back(Arc::clone(event));
    }

    fn replay(state: &ChannelState, replay: Replay) -> Vec<Arc<HubEvent>> {
        let mut seed: Vec<Arc<HubEvent>> = match replay {
            Replay::None => Vec::new(),
            Replay::Last(n) => {
                let skip = state.history.len().saturating_sub(n);
                state.history.iter().skip(skip).cloned().collect()
            }
            Replay::After(after) => state
                .history
                .iter()
                .filter(|e| e.seq().is_some_and(|seq| seq > after))
                .cloned()
                .collect(),
        };
        if let Some(fault) = &state.last_fault {
            seed.push(Arc::clone(fault));
        }
        seed
    }

    fn remove_subscriber(&self, id: &SubscriberId) -> Option<Arc<SubscriptionQueue>> {
        let mut state = self.state.lock();
        let pos = state.subscribers.iter().position(|q| &q.id == id)?;
        let mut next = state.subscribers.as_ref().clone();
        let removed = next.remove(pos);
        state.subscribers = Arc::new(next);
        Some(removed)
    }
}

pub(crate) struct HubInner {
    channels: DashMap<String, Arc<FileChannel>>,
    index: DashMap<SubscriberId, String>,
    config: HubConfig,
}

impl HubInner {
    fn channel(&self, file: &str) -> Result<Arc<FileChannel>, HubError> {
        self.channels
            .get(file)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| HubError::UnknownFile {
                file: file.to_owned(),
            })
    }

    fn update_gauge(&self) {
        metrics::gauge!(HUB_SUBSCRIPTIONS_ACTIVE).set(self.index.len() as f64);
    }

    pub(crate) fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let Some((_, file)) = self.index.remove(id) else {
            return false;
        };
        if let Some(channel) = self.channels.get(&file).map(|c| Arc::clone(c.value())) {
            if let Some(queue) = channel.remove_subscriber(id) {
                let _ = queue.close(CloseReason::Unsubscribed);
            }
        }
        self.update_gauge();
        debug!(subscriber_id = %id, file = %file, "unsubscribed");
        true
    }
}

/// Fan-out of hub events to per-file subscriber sets.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// Create an empty hub.
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: DashMap::new(),
                index: DashMap::new(),
                config,
            }),
        }
    }

    /// Open a channel for `file`. Returns `false` if one is already open.
    pub fn open(&self, file: &str) -> bool {
        self.open_with_backfill(file, Vec::new())
    }

    /// Open a channel whose history starts with `backfill`.
    pub fn open_with_backfill(&self, file: &str, backfill: Vec<HubEvent>) -> bool {
        let mut created = false;
        let _ = self.inner.channels.entry(file.to_owned()).or_insert_with(|| {
            created = true;
            let channel = FileChannel::new(file);
            {
                let mut state = channel.state.lock();
                for event in backfill {
                    FileChannel::remember(
                        &mut state,
                        &Arc::new(event),
                        self.inner.config.history_capacity,
                    );
                }
            }
            Arc::new(channel)
        });
        if created {
            debug!(file, "channel opened");
        }
        created
    }

    /// Tear down `file`'s channel, closing every subscription with `reason`.
    pub fn close(&self, file: &str, reason: CloseReason) -> bool {
        let Some((_, channel)) = self.inner.channels.remove(file) else {
            return false;
        };
        let subscribers = {
            let mut state = channel.state.lock();
            std::mem::replace(&mut state.subscribers, Arc::new(Vec::new()))
        };
        for queue in subscribers.iter() {
            let _ = self.inner.index.remove(&queue.id);
            let _ = queue.close(reason);
        }
        self.inner.update_gauge();
        info!(file, subscribers = subscribers.len(), ?reason, "channel closed");
        true
    }

    /// Close every channel.
    pub fn close_all(&self, reason: CloseReason) {
        let files: Vec<String> = self.inner.channels.iter().map(|e| e.key().clone()).collect();
        for file in files {
            let _ = self.close(&file, reason);
        }
    }

    /// Register a subscription for `file`.
    ///
    /// The replayed history and the registration happen under the same lock
    /// a publisher takes to record an event, so each event reaches the new
    /// subscriber exactly once: either in the replay or live.
    pub fn subscribe(
        &self,
        file: &str,
        id: SubscriberId,
        options: SubscriptionOptions,
    ) -> Result<Subscription, HubError> {
        let channel = self.inner.channel(file)?;
        let queue = Arc::new(SubscriptionQueue::new(
            id.clone(),
            file.to_owned(),
            &options,
            self.inner.config.eviction_window,
        ));
        {
            let mut state = channel.state.lock();
            queue.seed(FileChannel::replay(&state, options.replay));
            let mut next = state.subscribers.as_ref().clone();
            next.push(Arc::clone(&queue));
            state.subscribers = Arc::new(next);
        }
        if let Some(previous) = self.inner.index.insert(id.clone(), file.to_owned()) {
            warn!(subscriber_id = %id, previous = %previous, "subscriber id reused");
        }
        self.inner.update_gauge();
        debug!(subscriber_id = %id, file, "subscribed");
        Ok(Subscription::new(queue, Arc::downgrade(&self.inner)))
    }

    /// Remove a subscription. Nothing is delivered to it after this returns.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Fan `event` out to every current subscriber of `file`, in order.
    pub async fn publish(&self, file: &str, event: HubEvent) -> Result<PublishReport, HubError> {
        let channel = self.inner.channel(file)?;
        let _serial = channel.publish_lock.lock().await;

        let event = Arc::new(event);
        let subscribers = {
            let mut state = channel.state.lock();
            FileChannel::remember(&mut state, &event, self.inner.config.history_capacity);
            Arc::clone(&state.subscribers)
        };

        let sole = subscribers.len() == 1;
        let mut report = PublishReport::default();
        for queue in subscribers.iter() {
            let outcome = match queue.policy {
                OverflowPolicy::Block { timeout } if sole => {
                    queue.offer_blocking(&event, timeout).await
                }
                _ => queue.offer(&event),
            };
            match outcome {
                Offer::Queued => report.delivered += 1,
                Offer::Dropped => report.dropped += 1,
                Offer::Evicted => report.evicted.push(queue.id.clone()),
                Offer::Closed => {}
            }
        }

        if report.dropped > 0 || !report.evicted.is_empty() {
            let lost = (report.dropped + report.evicted.len()) as u64;
            metrics::counter!(HUB_RECORDS_DROPPED_TOTAL, "file" => channel.name.clone())
                .increment(lost);
        }
        for id in &report.evicted {
            let _ = self.inner.index.remove(id);
            let _ = channel.remove_subscriber(id);
            metrics::counter!(HUB_EVICTIONS_TOTAL, "file" => channel.name.clone()).increment(1);
            warn!(subscriber_id = %id, file, "subscriber evicted after sustained backpressure");
        }
        if !report.evicted.is_empty() {
            self.inner.update_gauge();
        }
        Ok(report)
    }

    /// Forget the remembered fault for `file` once it has recovered.
    pub fn clear_fault(&self, file: &str) {
        if let Ok(channel) = self.inner.channel(file) {
            channel.state.lock().last_fault = None;
        }
    }

    /// Number of subscriptions on `file` (0 if not open).
    pub fn subscriber_count(&self, file: &str) -> usize {
        self.inner
            .channel(file)
            .map(|c| c.state.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Sequence number of the newest line or rotation marker published for
    /// `file`.
    pub fn latest_seq(&self, file: &str) -> Option<u64> {
        self.inner
            .channel(file)
            .ok()
            .and_then(|c| c.state.lock().latest_seq)
    }

    /// Whether a channel is open for `file`.
    pub fn is_open(&self, file: &str) -> bool {
        self.inner.channels.contains_key(file)
    }

    /// Open channel names.
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.inner.channels.iter().map(|e| e.key().clone()).collect();
        files.sort();
        files
    }

    /// Total open subscriptions across all files.
    pub fn subscription_count(&self) -> usize {
        self.inner.index.len()
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("files", &self.inner.channels.len())
            .field("subscriptions", &self.inner.index.len())
            .finish()
    }
}
