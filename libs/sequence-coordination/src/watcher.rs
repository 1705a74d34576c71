//! Session event fan-out.
//!
//! The ensemble client pushes every connectivity change into a
//! [`SessionWatcher`], which relays it to its subscribers one at a time in
//! subscription order. Dispatch is serialized, so a second event is not
//! delivered to anyone until every subscriber has finished with the first.
//!
//! A watcher handed to one session handle is tagged with that handle's
//! [`HandleId`] via [`SessionWatcher::for_handle`]; every event it relays
//! carries the tag, so a subscriber can tell a late event from a discarded
//! handle apart from one about the current handle.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::ensemble::SessionEvent;
use crate::error::CoordinationResult;

/// Identifies the session handle an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// A session event and the handle that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchedEvent {
    pub state: SessionEvent,
    /// `None` when delivered through an untagged watcher
    pub handle: Option<HandleId>,
}

/// Receives session events from a [`SessionWatcher`].
#[async_trait]
pub trait SessionListener: Send + Sync + 'static {
    async fn on_event(&self, event: WatchedEvent) -> CoordinationResult<()>;
}

/// Identifies one registration; the same listener subscribed twice gets two ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct WatcherInner {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn SessionListener>)>>,
    dispatch: tokio::sync::Mutex<()>,
}

/// Ordered, sequential relay of session events.
///
/// Clones share subscribers and dispatch order.
#[derive(Clone, Default)]
pub struct SessionWatcher {
    inner: Arc<WatcherInner>,
    origin: Option<HandleId>,
}

impl SessionWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone whose events are tagged with `handle`.
    pub fn for_handle(&self, handle: HandleId) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            origin: Some(handle),
        }
    }

    pub fn origin(&self) -> Option<HandleId> {
        self.origin
    }

    /// Register a listener at the end of the delivery order.
    pub fn subscribe(&self, listener: Arc<dyn SessionListener>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.write().push((id, listener));
        id
    }

    /// Remove a registration. Returns false if it was not present.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Deliver `event` to every subscriber, awaiting each in turn.
    ///
    /// A subscriber error is logged and does not stop delivery to the rest.
    pub async fn on_event(&self, event: SessionEvent) {
        let _dispatch = self.inner.dispatch.lock().await;
        info!(state = %event, handle = ?self.origin, "new session event");

        let watched = WatchedEvent {
            state: event,
            handle: self.origin,
        };
        // snapshot so listeners may (un)subscribe while being called
        let subscribers = self.inner.subscribers.read().clone();
        for (id, listener) in subscribers {
            if let Err(err) = listener.on_event(watched).await {
                warn!(subscription = ?id, state = %event, error = %err, "session listener failed");
            }
        }
        debug!(state = %event, "session event delivered");
    }
}

impl fmt::Debug for SessionWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionWatcher")
            .field("subscribers", &self.subscriber_count())
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}
