//! In-process event bus feeding the diagnostics stream.
//!
//! Uses [`tokio::sync::broadcast`] so every connected stream receives every
//! event and a slow stream never blocks the publisher or the other streams.
//! A stream that falls behind by more than the channel capacity skips the
//! oldest events (reported as `Lagged`).

use diagstream_types::{DiagError, Event};
use tokio::sync::broadcast;
use tracing::debug;

/// Default channel capacity (events buffered per slow subscriber).
const DEFAULT_CAPACITY: usize = 256;

/// Shared event bus. Clone it cheaply – all clones share one channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    ///
    /// A `capacity` of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish `event` to every current subscriber.
    ///
    /// Returns the number of subscribers handed the event. With nobody
    /// listening the event is dropped and [`DiagError::Server`] is returned;
    /// there is no backlog for late subscribers.
    pub fn publish(&self, event: Event) -> Result<usize, DiagError> {
        self.sender.send(event).map_err(|e| {
            debug!(kind = %e.0.kind, "no stream subscribers; event dropped");
            DiagError::Server(format!("no subscribers for event {}", e.0.kind))
        })
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Number of live subscribers (connected streams).
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let event = Event::step_message("hi");
        assert_eq!(bus.publish(event.clone())?, 1);

        assert_eq!(rx.recv().await?, event);
        Ok(())
    }

    #[tokio::test]
    async fn every_subscriber_receives_every_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(Event::new("a"))?;
        bus.publish(Event::new("b"))?;

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await?.kind, "a");
            assert_eq!(rx.recv().await?.kind, "b");
        }
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_an_error() {
        let bus = EventBus::default();
        assert!(matches!(bus.publish(Event::new("x")), Err(DiagError::Server(_))));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe();
        for i in 0..100 {
            bus.publish(Event::new(format!("e{i}"))).unwrap();
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
