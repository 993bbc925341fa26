//! # tailweb-hub
//!
//! Per-file broadcast of [`HubEvent`](tailweb_core::HubEvent)s to bounded
//! subscriber queues.
//!
//! - [`BroadcastHub`]: open/close channels, subscribe, publish
//! - [`Subscription`]: the receiving handle, drop to unsubscribe
//! - Overflow is handled per subscription: drop-oldest with a coalesced
//!   [`DropNotice`], or a bounded publisher wait for a sole subscriber.
//!   A subscription that keeps dropping for the eviction window is closed
//!   with [`CloseReason::Evicted`].

#![deny(unsafe_code)]

pub mod errors;
pub mod hub;
pub mod queue;

pub use errors::HubError;
pub use hub::{BroadcastHub, HubConfig, PublishReport};
pub use queue::{
    CloseReason, Delivery, DropNotice, OverflowPolicy, Replay, Subscription, SubscriptionOptions,
    SubscriptionState,
};
