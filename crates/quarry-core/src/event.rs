use crate::types::ResearchEvent;

/// Progress sink for research runs, backed by a tokio broadcast channel.
/// Every subscriber receives every event; publishing never blocks the engine.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ResearchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ResearchEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ResearchEvent> {
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

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(ResearchEvent::StepStarted {
            step_id: 1,
            description: "look things up".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(ResearchEvent::QueryAttempt {
            query: "rust".into(),
            attempt: 1,
        });
        bus.publish(ResearchEvent::RefinerScored {
            query: "rust".into(),
            attempt: 1,
            score: 0.7,
            reason: "good".into(),
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.stage(), "search");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.stage(), "refine");
        assert!(second.message().contains("0.70"));
    }
}
