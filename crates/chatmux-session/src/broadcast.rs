//! Fan-out of session events to observers.

use chatmux_protocol::SessionEvent;
use tokio::sync::broadcast;

/// Publishes [`SessionEvent`]s to every subscribed observer.
///
/// Backed by a bounded `tokio::sync::broadcast` channel: emitting never
/// waits on a receiver, and a receiver that falls more than `capacity`
/// events behind gets `RecvError::Lagged` and resumes at the oldest
/// retained event.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Sends `event` to all current subscribers and returns how many
    /// received it.
    pub fn emit(&self, event: SessionEvent) -> usize {
        let topic = event.topic();
        match self.tx.send(event) {
            Ok(receivers) => {
                tracing::trace!(topic, receivers, "session event broadcast");
                receivers
            }
            Err(_) => {
                tracing::debug!(topic, "no observers for session event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
