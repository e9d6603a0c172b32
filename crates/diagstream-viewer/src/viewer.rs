//! [`Viewer`] – one mounted diagnostics view.
//!
//! Mounting opens a feed subscription whose callback pushes every decoded
//! event into the viewer's own [`EventLog`]. Two viewers never share a
//! subscription or a log. Unmounting (or dropping the viewer) disposes the
//! subscription and clears the log; nothing survives teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use diagstream_middleware::{FeedClient, Subscription, SubscriptionState};
use diagstream_types::Event;
use tracing::debug;

use crate::event_log::{EventLog, Snapshot};

/// Rendered in place of the log while it is empty.
pub const EMPTY_PLACEHOLDER: &str = "No events yet…";

fn lock(log: &Mutex<EventLog>) -> MutexGuard<'_, EventLog> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A mounted view over a diagnostics feed.
pub struct Viewer {
    log: Arc<Mutex<EventLog>>,
    transport_errors: Arc<AtomicU64>,
    subscription: Option<Subscription>,
}

impl Viewer {
    /// Mount a viewer on `url`, retaining up to `capacity` events.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn mount(client: &FeedClient, url: impl Into<String>, capacity: usize) -> Self {
        Self::mount_with_listener(client, url, capacity, |_| {})
    }

    /// Like [`Viewer::mount`], additionally calling `on_update` with the new
    /// snapshot after every accepted event.
    pub fn mount_with_listener<L>(
        client: &FeedClient,
        url: impl Into<String>,
        capacity: usize,
        mut on_update: L,
    ) -> Self
    where
        L: FnMut(&Snapshot) + Send + 'static,
    {
        let log = Arc::new(Mutex::new(EventLog::with_capacity(capacity)));
        let transport_errors = Arc::new(AtomicU64::new(0));

        let log_cb = Arc::clone(&log);
        let errors_cb = Arc::clone(&transport_errors);
        let subscription = client.open_with_errors(
            url,
            move |event: Event| {
                let snapshot = lock(&log_cb).push(event);
                on_update(&snapshot);
            },
            move |err| {
                errors_cb.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, "viewer feed interrupted");
            },
        );

        Self {
            log,
            transport_errors,
            subscription: Some(subscription),
        }
    }

    /// Current log contents, newest first.
    pub fn snapshot(&self) -> Snapshot {
        lock(&self.log).snapshot()
    }

    pub fn len(&self) -> usize {
        lock(&self.log).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.log).is_empty()
    }

    pub fn capacity(&self) -> usize {
        lock(&self.log).capacity()
    }

    /// Clear the log without touching the subscription.
    pub fn clear(&self) {
        lock(&self.log).reset();
    }

    /// Transport failures seen since mounting.
    pub fn transport_errors(&self) -> u64 {
        self.transport_errors.load(Ordering::Relaxed)
    }

    /// Feed URL, or `None` once unmounted.
    pub fn url(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.url())
    }

    pub fn state(&self) -> SubscriptionState {
        self.subscription
            .as_ref()
            .map_or(SubscriptionState::Closed, |s| s.state())
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.is_some()
    }

    /// Dispose the subscription and clear the log. Idempotent.
    pub fn unmount(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.dispose();
        }
        lock(&self.log).reset();
    }

    /// Text rendition of the whole log.
    pub fn render(&self) -> String {
        render_events(&self.snapshot())
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Pretty-printed JSON per event, newest first, or [`EMPTY_PLACEHOLDER`].
pub fn render_events(events: &[Event]) -> String {
    if events.is_empty() {
        return EMPTY_PLACEHOLDER.to_string();
    }
    events
        .iter()
        .map(|ev| serde_json::to_string_pretty(ev).unwrap_or_else(|_| format!("{ev:?}")))
        .collect::<Vec<_>>()
        .join("\n")
}
