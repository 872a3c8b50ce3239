use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

pub mod topic;

#[cfg(feature = "redis")]
pub mod redis_bus;

pub use topic::{TopicRouter, topic_matches};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Connectivity of the underlying rendezvous transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Up,
}

/// Topic-based publish/subscribe used purely as a rendezvous channel.
///
/// Subscriptions take a topic filter: `+` matches exactly one path segment and
/// a trailing `#` matches any remaining depth. Delivery is best-effort; a
/// receiver that falls behind observes `RecvError::Lagged`.
pub trait Bus: Send + Sync {
    fn subscribe(&self, filter: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
    fn link_state(&self) -> watch::Receiver<LinkState>;
}

/// Simple in-memory bus for tests and non-transport contexts.
#[derive(Debug)]
pub struct LocalBus {
    router: TopicRouter,
    link: watch::Sender<LinkState>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self {
            router: TopicRouter::default(),
            link: watch::channel(LinkState::Up).0,
        }
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the rendezvous link dropping or coming back.
    pub fn set_link_state(&self, state: LinkState) {
        self.link.send_replace(state);
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, filter: &str) -> broadcast::Receiver<BusMessage> {
        self.router.subscribe(filter)
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        if *self.link.borrow() == LinkState::Down {
            return Err(BusError::Closed);
        }
        self.router.dispatch(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("tiller/boat/vehicle/signal");
        bus.publish("tiller/boat/vehicle/signal", Bytes::from_static(b"ping"))
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "tiller/boat/vehicle/signal");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn wildcard_subscription_sees_nested_topics() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("tiller/boat/vehicle/telemetry/#");
        bus.publish("tiller/boat/vehicle/signal", Bytes::from_static(b"x"))
            .expect("publish ok");
        bus.publish(
            "tiller/boat/vehicle/telemetry/stm32:voltage",
            Bytes::from_static(b"12.1"),
        )
        .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "tiller/boat/vehicle/telemetry/stm32:voltage");
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn publish_fails_while_link_is_down() {
        let bus = LocalBus::new();
        let mut link = bus.link_state();
        bus.set_link_state(LinkState::Down);
        assert!(link.has_changed().expect("sender alive"));
        assert_eq!(*link.borrow_and_update(), LinkState::Down);
        let err = bus
            .publish("tiller/boat/operator/heartbeat", Bytes::from_static(b"alive"))
            .unwrap_err();
        assert!(matches!(err, BusError::Closed));
    }
}
