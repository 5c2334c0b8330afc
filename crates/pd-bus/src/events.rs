//! Broadcast-style in-process event bus. Components publish one
//! [`DaemonEvent`] per state change; the webhook pipeline (and anything else
//! interested) subscribes. Built on a bounded tokio broadcast channel, so a
//! slow subscriber loses the oldest events rather than stalling publishers.

use serde::Serialize;
use tokio::sync::broadcast;

/// One daemon-internal event, mirroring the webhook wire payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonEvent {
    pub event: String,
    pub target_id: Option<String>,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

impl DaemonEvent {
    pub fn new(
        event: impl Into<String>,
        target_id: Option<String>,
        timestamp: i64,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event: event.into(),
            target_id,
            timestamp,
            data,
        }
    }
}

/// Cheaply cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    /// Default capacity holds a burst of ~1k events before lagging
    /// subscribers start losing the oldest.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to all current subscribers. A bus with no subscribers
    /// silently drops the event.
    pub fn publish(&self, event: DaemonEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(DaemonEvent::new(
            "service.claim",
            Some("myapp:api".into()),
            1,
            serde_json::json!({"port": 3100}),
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "service.claim");
        assert_eq!(event.target_id.as_deref(), Some("myapp:api"));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for i in 0..4 {
            bus.publish(DaemonEvent::new(format!("e{i}"), None, i, serde_json::Value::Null));
        }
        // The first recv reports the lag, subsequent recvs yield the newest.
        let first = rx.recv().await;
        assert!(matches!(
            first,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_))
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "e2");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(DaemonEvent::new("daemon.start", None, 0, serde_json::Value::Null));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
