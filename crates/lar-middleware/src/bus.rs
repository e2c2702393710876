//! Session event bus: one [`tokio::sync::broadcast`] channel per [`Topic`].
//!
//! Publishing never waits on subscribers. A subscriber that falls behind
//! loses the oldest notifications (`Lagged`) and carries on from there.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::MapUpdates`] | One [`MapChange`](lar_types::MapChange) per committed map revision |
//! | [`Topic::Localization`] | Tracker results and georeferenced user locations |
//! | [`Topic::SessionAlerts`] | Skipped frames, persistence faults |

use lar_types::Event;
use tokio::sync::broadcast;
use tracing::warn;

/// Events buffered per topic before slow subscribers start lagging.
pub const DEFAULT_CAPACITY: usize = 256;

/// Enumeration of all routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Committed map mutations: landmarks, GPS log, anchors.
    MapUpdates,
    /// Localization outcomes and surfaced user locations.
    Localization,
    /// Non-fatal session problems the user should hear about.
    SessionAlerts,
}

/// Clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    map_updates: broadcast::Sender<Event>,
    localization: broadcast::Sender<Event>,
    session_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is per topic.
    pub fn new(capacity: usize) -> Self {
        let (map_updates, _) = broadcast::channel(capacity);
        let (localization, _) = broadcast::channel(capacity);
        let (session_alerts, _) = broadcast::channel(capacity);
        Self {
            map_updates,
            localization,
            session_alerts,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event.
    /// Publishing with nobody listening is a normal condition and yields `0`.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        self.topic_sender(topic).send(event).unwrap_or(0)
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::MapUpdates => &self.map_updates,
            Topic::Localization => &self.localization,
            Topic::SessionAlerts => &self.session_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and `n`
    ///   messages were dropped.
    /// * `Err(RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event, skipping over lag.
    ///
    /// Returns `None` once the bus is closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive used by polling consumers.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lar_types::{EventPayload, MapChange, MapChangeKind};

    fn make_event(revision: u64) -> Event {
        Event::new(
            "lar-middleware::test",
            EventPayload::MapChanged(MapChange {
                revision,
                kind: MapChangeKind::GpsObservationsAppended { count: 1 },
            }),
        )
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish_to(Topic::MapUpdates, make_event(1)), 0);
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut subscriber1 = bus.subscribe_to(Topic::MapUpdates);
        let mut subscriber2 = bus.subscribe_to(Topic::MapUpdates);

        let event = make_event(2);
        assert_eq!(bus.publish_to(Topic::MapUpdates, event.clone()), 2);

        assert_eq!(subscriber1.recv().await?.id, event.id);
        assert_eq!(subscriber2.recv().await?.id, event.id);
        Ok(())
    }

    /// A subscriber on `SessionAlerts` must not receive events published to
    /// `MapUpdates` because they are routed through separate channels.
    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topic_events() {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SessionAlerts);
        let _updates = bus.subscribe_to(Topic::MapUpdates);

        bus.publish_to(Topic::MapUpdates, make_event(3));

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), alerts.recv()).await;
        assert!(result.is_err(), "SessionAlerts must not see MapUpdates traffic");
    }

    /// Flooding a low-capacity channel while a subscriber sleeps must produce
    /// a `Lagged` error rather than blocking the publisher.
    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::MapUpdates);

        for revision in 0..1_000 {
            bus.publish_to(Topic::MapUpdates, make_event(revision));
        }

        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn next_event_skips_lag_and_returns_newest_window() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe_to(Topic::MapUpdates);
        for revision in 0..10 {
            bus.publish_to(Topic::MapUpdates, make_event(revision));
        }

        let event = slow.next_event().await.expect("bus still open");
        match event.payload {
            EventPayload::MapChanged(change) => assert_eq!(change.revision, 6),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn next_event_returns_none_when_bus_dropped() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Localization);
        drop(bus);
        assert!(rx.next_event().await.is_none());
    }
}
