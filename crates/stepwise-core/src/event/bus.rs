//! Broadcast event bus for distributing queue and workflow events.
//!
//! Built on `tokio::sync::broadcast`, the `EventBus` supports multiple
//! concurrent subscribers. Publishing with no active subscribers is a no-op.

use tokio::sync::broadcast;

/// Multi-consumer event bus.
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers.
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: E) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_types::event::QueueEvent;
    use stepwise_types::job::QueueName;

    fn sample_event() -> QueueEvent {
        QueueEvent::JobAdded {
            queue: QueueName::Notifications,
            job_id: "job-1".to_string(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(sample_event());

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, QueueEvent::JobAdded { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(sample_event());

        assert!(matches!(rx1.recv().await.unwrap(), QueueEvent::JobAdded { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), QueueEvent::JobAdded { .. }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus: EventBus<QueueEvent> = EventBus::new(16);
        bus.publish(sample_event());
        bus.publish(sample_event());
    }

    #[tokio::test]
    async fn lagged_receiver_handles_gracefully() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for i in 0..10 {
            bus.publish(QueueEvent::QueuePaused {
                queue: QueueName::ALL[i % QueueName::ALL.len()],
            });
        }

        match rx.try_recv() {
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(sample_event());

        assert!(rx.try_recv().is_ok());
        assert_eq!(bus.receiver_count(), 1);
    }
}
