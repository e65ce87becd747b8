use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Outcome of one attempt to switch a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub id: Uuid,
    pub circuit_id: String,
    pub board_id: String,
    pub channel: u8,
    pub desired_on: bool,
    /// State reported by the board, if it answered.
    pub acked_on: Option<bool>,
    pub success: bool,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Fan-out of relay events to any number of observers.
///
/// Publishing never blocks; slow subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RelayEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(circuit_id: &str) -> RelayEvent {
        RelayEvent {
            id: Uuid::new_v4(),
            circuit_id: circuit_id.to_owned(),
            board_id: "1".to_owned(),
            channel: 1,
            desired_on: true,
            acked_on: Some(true),
            success: true,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.clone().subscribe();

        bus.publish(event("boiler"));

        assert_eq!(a.recv().await.unwrap().circuit_id, "boiler");
        assert_eq!(b.recv().await.unwrap().circuit_id, "boiler");
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        EventBus::new(4).publish(event("boiler"));
    }
}
