//! Broadcast event bus for distributing `WorkflowEvent` to subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op.

use loom_types::event::WorkflowEvent;
use tokio::sync::broadcast;

/// Publish-only outbound channel for lifecycle events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: WorkflowEvent);
}

/// Multi-consumer event bus. Cloning the bus clones the sender.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Discards every event. Used by isolated replay runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: WorkflowEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_event() -> WorkflowEvent {
        WorkflowEvent::TaskSkipped {
            run_id: Uuid::now_v7(),
            step_id: "notify".to_string(),
            reason: "condition false".to_string(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(sample_event());

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, WorkflowEvent::TaskSkipped { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.clone().subscribe();

        bus.publish(sample_event());

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(sample_event());
        NullSink.publish(sample_event());
    }
}
