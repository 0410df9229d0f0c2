//! `EventBus` over `tokio::sync::broadcast`.

use task_queue_core::events::{Event, EventBus};
use tokio::sync::broadcast;

/// Broadcast-backed event bus. Publishing never blocks: `broadcast::Sender`
/// drops the event for subscribers whose buffer is already full rather than
/// awaiting them.
pub struct TokioEventBus {
    sender: broadcast::Sender<Event>,
}

impl TokioEventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for TokioEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for TokioEventBus {
    fn publish(&self, event: Event) {
        // A send error only means there are currently no subscribers, which
        // is not a failure for a fire-and-forget bus.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use task_queue_common::ids::UuidGen;
    use task_queue_common::IdGen;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = TokioEventBus::new(16);
        let mut rx = bus.subscribe();
        let gen = UuidGen;
        let task_id = gen.task_id();
        bus.publish(Event::TaskSubmitted {
            task_id,
            at: chrono::Utc::now(),
        });
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Event::TaskSubmitted { task_id: id, .. } if id == task_id));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = TokioEventBus::new(4);
        bus.publish(Event::QueueRebalanced {
            queued_count: 0,
            at: chrono::Utc::now(),
        });
    }
}
