//! Where watcher output goes.
//!
//! Every [`DaemonEvent`] is pushed to connected clients as an `event` frame and
//! onto an in-process feed that the status board and the audit relay follow.

use tokio::sync::broadcast;

use crate::events::DaemonEvent;
use crate::websocket::protocol::{ClientMessage, MESSAGE_TYPE_EVENT, NOTICE_WARNING};
use crate::websocket::Broadcaster;

const FEED_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct DaemonNotifier {
    bus: Broadcaster,
    feed: broadcast::Sender<DaemonEvent>,
}

impl DaemonNotifier {
    pub fn new(bus: Broadcaster) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self { bus, feed }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.feed.subscribe()
    }

    pub fn publish(&self, event: DaemonEvent) {
        match serde_json::to_value(&event) {
            Ok(data) => self.bus.publish(ClientMessage::new(MESSAGE_TYPE_EVENT, data)),
            Err(e) => tracing::error!(env = %event.env(), "failed to encode daemon event: {}", e),
        }
        tracing::trace!(env = %event.env(), kind = event.event_type(), "daemon event published");
        // No receivers is fine: nobody is following the feed yet.
        let _ = self.feed.send(event);
    }

    /// Tell every client that a live daemon connection was lost.
    pub fn connection_lost(&self, env: &str, reason: &str) {
        self.bus.notice(
            "Daemon connection lost",
            &format!("{}: {}", env, reason),
            NOTICE_WARNING,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_bus_and_feed() {
        let (bus, mut bus_rx) = Broadcaster::new();
        let notifier = DaemonNotifier::new(bus);
        let mut feed = notifier.subscribe();

        notifier.publish(DaemonEvent::Started {
            env: "local".to_string(),
        });

        let frame = bus_rx.recv().await.unwrap();
        assert_eq!(frame.message_type, MESSAGE_TYPE_EVENT);
        assert_eq!(frame.data["type"], "docker_start");
        assert_eq!(frame.data["env"], "local");
        assert!(!frame.is_targeted());

        assert_eq!(
            feed.recv().await.unwrap(),
            DaemonEvent::Started {
                env: "local".to_string()
            }
        );
    }
}
