//! Domain event system: decoupled communication between bounded contexts.
//!
//! The pipeline, the breakers, and the dispatcher publish here; metrics
//! exporters or a management UI subscribe without being wired into the
//! request path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::breaker::BreakerState;
use crate::message::Classification;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// Memory lookup was skipped or failed; the request went ahead without it.
    MemoryDegraded {
        request_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A circuit breaker changed state
    BreakerStateChanged {
        name: String,
        from: BreakerState,
        to: BreakerState,
        timestamp: DateTime<Utc>,
    },

    /// A request made it through the pipeline
    RequestProcessed {
        request_id: String,
        classification: Classification,
        tokens_saved: usize,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Cloning shares
/// the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::MemoryDegraded {
            request_id: "req-1".into(),
            reason: "timeout".into(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::MemoryDegraded {
                request_id, reason, ..
            } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(reason, "timeout");
            }
            _ => panic!("Expected MemoryDegraded event"),
        }
    }

    #[tokio::test]
    async fn clones_share_the_channel() {
        let bus = EventBus::new(16);
        let publisher = bus.clone();
        let mut rx = bus.subscribe();

        publisher.publish(DomainEvent::BreakerStateChanged {
            name: "memory".into(),
            from: BreakerState::Closed,
            to: BreakerState::Open,
            timestamp: Utc::now(),
        });

        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            DomainEvent::BreakerStateChanged { .. }
        ));
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::RequestProcessed {
            request_id: "req-2".into(),
            classification: Classification::Chat,
            tokens_saved: 0,
            timestamp: Utc::now(),
        });
    }
}
