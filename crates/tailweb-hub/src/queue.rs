//! Bounded per-subscriber queues and the receiving handle.
//!
//! Each queue is guarded by its own short mutex. The publisher only ever holds
//! one queue lock at a time and never awaits while holding it.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tailweb_core::{HubEvent, SubscriberId};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::hub::HubInner;

/// What happens when a publish finds the queue full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued entry and record it in a drop notice.
    DropOldest,
    /// Wait up to `timeout` for room, then fall back to `DropOldest`.
    ///
    /// Only honoured while the subscription is the file's sole subscriber.
    Block {
        /// Longest a publisher waits for this queue.
        timeout: Duration,
    },
}

/// Which retained history a new subscription starts with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Replay {
    /// Live records only.
    None,
    /// The last `n` retained entries.
    Last(usize),
    /// Every retained entry with a sequence number greater than this.
    After(u64),
}

/// Per-subscription options.
#[derive(Clone, Copy, Debug)]
pub struct SubscriptionOptions {
    /// Queue bound. Clamped to at least 1.
    pub capacity: usize,
    /// Overflow behaviour.
    pub policy: OverflowPolicy,
    /// History to seed the queue with.
    pub replay: Replay,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            capacity: 1024,
            policy: OverflowPolicy::DropOldest,
            replay: Replay::None,
        }
    }
}

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Keeping up.
    Active,
    /// Queue full, dropping since the last drain.
    Backpressured,
    /// Terminal. Never reused.
    Closed,
}

/// Why a subscription was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The owner unsubscribed or dropped the handle.
    Unsubscribed,
    /// Dropped records continuously for the eviction window.
    Evicted,
    /// The file's channel was torn down.
    FileClosed,
    /// The hub is shutting down.
    Shutdown,
}

/// Coalesced summary of records evicted from a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DropNotice {
    /// Entries lost.
    pub count: u64,
    /// Lowest sequence number lost.
    pub first_seq: Option<u64>,
    /// Highest sequence number lost.
    pub last_seq: Option<u64>,
    /// Rotation markers among the lost entries.
    pub rotations: u64,
}

impl DropNotice {
    fn record(&mut self, event: &HubEvent) {
        self.count += 1;
        if let Some(seq) = event.seq() {
            let _ = self.first_seq.get_or_insert(seq);
            self.last_seq = Some(seq);
        }
        if matches!(event, HubEvent::Rotation(_)) {
            self.rotations += 1;
        }
    }
}

/// One item handed to a consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    /// A published event.
    Event(Arc<HubEvent>),
    /// Entries were dropped ahead of the next event.
    Dropped(DropNotice),
}

/// Result of offering an event to one queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Offer {
    Queued,
    Dropped,
    Evicted,
    Closed,
}

struct QueueState {
    entries: VecDeque<Arc<HubEvent>>,
    pending_drop: Option<DropNotice>,
    state: SubscriptionState,
    close_reason: Option<CloseReason>,
    saturated_since: Option<Instant>,
}

impl QueueState {
    fn close(&mut self, reason: CloseReason) {
        self.state = SubscriptionState::Closed;
        self.close_reason = Some(reason);
        self.entries = VecDeque::new();
        self.pending_drop = None;
        self.saturated_since = None;
    }
}

pub(crate) struct SubscriptionQueue {
    pub(crate) id: SubscriberId,
    pub(crate) file: String,
    capacity: usize,
    pub(crate) policy: OverflowPolicy,
    eviction_window: Duration,
    inner: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
}

impl SubscriptionQueue {
    pub(crate) fn new(
        id: SubscriberId,
        file: String,
        options: &SubscriptionOptions,
        eviction_window: Duration,
    ) -> Self {
        let capacity = options.capacity.max(1);
        Self {
            id,
            file,
            capacity,
            policy: options.policy,
            eviction_window,
            inner: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity.min(64)),
                pending_drop: None,
                state: SubscriptionState::Active,
                close_reason: None,
                saturated_since: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueue without waiting, evicting the oldest entry when full.
    pub(crate) fn offer(&self, event: &Arc<HubEvent>) -> Offer {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.state == SubscriptionState::Closed {
            return Offer::Closed;
        }
        if inner.entries.len() < self.capacity {
            inner.entries.push_back(Arc::clone(event));
            drop(inner);
            self.readable.notify_one();
            return Offer::Queued;
        }

        if let Some(oldest) = inner.entries.pop_front() {
            inner
                .pending_drop
                .get_or_insert_with(DropNotice::default)
                .record(&oldest);
        }
        inner.entries.push_back(Arc::clone(event));

        let since = *inner.saturated_since.get_or_insert(now);
        let outcome = if now.duration_since(since) >= self.eviction_window {
            inner.close(CloseReason::Evicted);
            Offer::Evicted
        } else {
            inner.state = SubscriptionState::Backpressured;
            Offer::Dropped
        };
        drop(inner);
        self.readable.notify_one();
        outcome
    }

    /// Wait up to `timeout` for room, then fall back to [`offer`](Self::offer).
    pub(crate) async fn offer_blocking(&self, event: &Arc<HubEvent>, timeout: Duration) -> Offer {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.state == SubscriptionState::Closed {
                    return Offer::Closed;
                }
                if inner.entries.len() < self.capacity {
                    inner.entries.push_back(Arc::clone(event));
                    drop(inner);
                    self.readable.notify_one();
                    return Offer::Queued;
                }
            }
            if tokio::time::timeout_at(deadline, self.writable.notified())
                .await
                .is_err()
            {
                break;
            }
        }
        self.offer(event)
    }

    /// Seed entries at registration, before the queue is visible to publishers.
    pub(crate) fn seed(&self, events: impl IntoIterator<Item = Arc<HubEvent>>) {
        let mut inner = self.inner.lock();
        for event in events {
            if inner.entries.len() == self.capacity {
                if let Some(oldest) = inner.entries.pop_front() {
                    inner
                        .pending_drop
                        .get_or_insert_with(DropNotice::default)
                        .record(&oldest);
                }
            }
            inner.entries.push_back(event);
        }
        let ready = !inner.entries.is_empty();
        drop(inner);
        if ready {
            self.readable.notify_one();
        }
    }

    /// Mark closed and free the queue. Returns `false` if already closed.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SubscriptionState::Closed {
            return false;
        }
        inner.close(reason);
        drop(inner);
        self.readable.notify_one();
        self.writable.notify_one();
        true
    }

    fn take(&self) -> Result<Option<Delivery>, CloseReason> {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.close_reason {
            return Err(reason);
        }
        if let Some(notice) = inner.pending_drop.take() {
            return Ok(Some(Delivery::Dropped(notice)));
        }
        let Some(event) = inner.entries.pop_front() else {
            return Ok(None);
        };
        inner.saturated_since = None;
        inner.state = SubscriptionState::Active;
        drop(inner);
        self.writable.notify_one();
        Ok(Some(Delivery::Event(event)))
    }

    fn clear_through(&self, seq: u64) {
        let mut inner = self.inner.lock();
        inner
            .entries
            .retain(|event| !matches!(event.as_ref(), HubEvent::Line(line) if line.seq <= seq));
        if inner
            .pending_drop
            .is_some_and(|n| n.rotations == 0 && n.last_seq.is_some_and(|last| last <= seq))
        {
            inner.pending_drop = None;
        }
        if inner.entries.len() < self.capacity {
            inner.saturated_since = None;
            if inner.state == SubscriptionState::Backpressured {
                inner.state = SubscriptionState::Active;
            }
        }
        drop(inner);
        self.writable.notify_one();
    }

    fn state(&self) -> SubscriptionState {
        self.inner.lock().state
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    queue: Arc<SubscriptionQueue>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub(crate) fn new(queue: Arc<SubscriptionQueue>, hub: Weak<HubInner>) -> Self {
        Self { queue, hub }
    }

    /// Subscriber identifier.
    pub fn id(&self) -> &SubscriberId {
        &self.queue.id
    }

    /// Logical name of the subscribed file.
    pub fn file(&self) -> &str {
        &self.queue.file
    }

    /// Wait for the next delivery.
    ///
    /// Returns the close reason once the subscription is closed. Cancel-safe.
    pub async fn recv(&self) -> Result<Delivery, CloseReason> {
        loop {
            if let Some(delivery) = self.queue.take()? {
                return Ok(delivery);
            }
            self.queue.readable.notified().await;
        }
    }

    /// Next delivery if one is ready.
    pub fn try_recv(&self) -> Result<Option<Delivery>, CloseReason> {
        self.queue.take()
    }

    /// Discard queued lines with `seq <= through`.
    pub fn clear_through(&self, through: u64) {
        self.queue.clear_through(through);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.queue.state()
    }

    /// Why the subscription closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.queue.close_reason()
    }

    /// Entries currently queued (excluding any drop notice).
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.queue.id)
            .field("file", &self.queue.file)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            let _ = hub.unsubscribe(&self.queue.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tailweb_core::LineRecord;

    fn line(seq: u64) -> Arc<HubEvent> {
        Arc::new(HubEvent::Line(LineRecord::decode(seq, format!("l{seq}").as_bytes())))
    }

    fn queue(capacity: usize, window: Duration) -> Arc<SubscriptionQueue> {
        let options = SubscriptionOptions {
            capacity,
            ..SubscriptionOptions::default()
        };
        Arc::new(SubscriptionQueue::new(
            SubscriberId::new(),
            "app".into(),
            &options,
            window,
        ))
    }

    fn handle(queue: &Arc<SubscriptionQueue>) -> Subscription {
        Subscription::new(Arc::clone(queue), Weak::new())
    }

    fn seq_of(delivery: Delivery) -> u64 {
        match delivery {
            Delivery::Event(event) => event.seq().unwrap(),
            Delivery::Dropped(n) => panic!("unexpected drop notice {n:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_with_one_notice() {
        let q = queue(3, Duration::from_secs(30));
        for seq in 0..10 {
            let _ = q.offer(&line(seq));
        }
        let sub = handle(&q);
        assert_eq!(sub.state(), SubscriptionState::Backpressured);
        assert_matches!(
            sub.try_recv(),
            Ok(Some(Delivery::Dropped(DropNotice { count: 7, first_seq: Some(0), last_seq: Some(6), rotations: 0 })))
        );
        let rest: Vec<u64> = (0..3).map(|_| seq_of(sub.try_recv().unwrap().unwrap())).collect();
        assert_eq!(rest, vec![7, 8, 9]);
        assert_matches!(sub.try_recv(), Ok(None));
        assert_eq!(sub.state(), SubscriptionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_drops_evict() {
        let q = queue(1, Duration::from_secs(30));
        assert_eq!(q.offer(&line(0)), Offer::Queued);
        assert_eq!(q.offer(&line(1)), Offer::Dropped);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(q.offer(&line(2)), Offer::Dropped);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(q.offer(&line(3)), Offer::Evicted);

        let sub = handle(&q);
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert_eq!(sub.queued(), 0);
        assert_matches!(sub.recv().await, Err(CloseReason::Evicted));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_resets_saturation_clock() {
        let q = queue(1, Duration::from_secs(30));
        let sub = handle(&q);
        let _ = q.offer(&line(0));
        assert_eq!(q.offer(&line(1)), Offer::Dropped);
        tokio::time::advance(Duration::from_secs(20)).await;

        let _ = sub.try_recv().unwrap();
        let _ = sub.try_recv().unwrap();
        let _ = q.offer(&line(2));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(q.offer(&line(3)), Offer::Dropped);
        assert_eq!(sub.state(), SubscriptionState::Backpressured);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_offer_waits_for_space() {
        let q = queue(1, Duration::from_secs(30));
        let sub = handle(&q);
        let _ = q.offer(&line(0));

        let publisher = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.offer_blocking(&line(1), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seq_of(sub.recv().await.unwrap()), 0);
        assert_eq!(publisher.await.unwrap(), Offer::Queued);
        assert_eq!(seq_of(sub.recv().await.unwrap()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_offer_falls_back_after_timeout() {
        let q = queue(1, Duration::from_secs(30));
        let _ = q.offer(&line(0));
        let outcome = q.offer_blocking(&line(1), Duration::from_millis(250)).await;
        assert_eq!(outcome, Offer::Dropped);
    }

    #[tokio::test]
    async fn closed_queue_rejects_and_reports_reason() {
        let q = queue(4, Duration::from_secs(30));
        let _ = q.offer(&line(0));
        assert!(q.close(CloseReason::Unsubscribed));
        assert!(!q.close(CloseReason::Shutdown));
        assert_eq!(q.offer(&line(1)), Offer::Closed);
        let sub = handle(&q);
        assert_eq!(sub.close_reason(), Some(CloseReason::Unsubscribed));
        assert_matches!(sub.try_recv(), Err(CloseReason::Unsubscribed));
    }

    #[tokio::test]
    async fn recv_wakes_on_offer() {
        let q = queue(4, Duration::from_secs(30));
        let sub = handle(&q);
        let waiter = tokio::spawn(async move { sub.recv().await.map(seq_of) });
        tokio::task::yield_now().await;
        let _ = q.offer(&line(42));
        assert_eq!(waiter.await.unwrap(), Ok(42));
    }

    #[tokio::test]
    async fn clear_through_discards_old_lines() {
        let q = queue(8, Duration::from_secs(30));
        for seq in 0..5 {
            let _ = q.offer(&line(seq));
        }
        let sub = handle(&q);
        sub.clear_through(2);
        assert_eq!(sub.queued(), 2);
        assert_eq!(seq_of(sub.try_recv().unwrap().unwrap()), 3);
    }

    #[test]
    fn seed_over_capacity_keeps_newest() {
        let q = queue(2, Duration::from_secs(30));
        q.seed((0..5).map(line));
        let sub = handle(&q);
        assert_matches!(
            sub.try_recv(),
            Ok(Some(Delivery::Dropped(DropNotice { count: 3, .. })))
        );
        assert_eq!(seq_of(sub.try_recv().unwrap().unwrap()), 3);
    }
}
