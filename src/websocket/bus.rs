//! The process-wide Broadcast bus.
//!
//! Every producer (progress channels, environment watchers, the read loops
//! answering pings) pushes onto one unbounded queue. The hub drains it from a
//! single task, which is what keeps each producer's messages in call order.

use serde_json::json;
use tokio::sync::mpsc;

use super::protocol::{ClientMessage, MESSAGE_TYPE_NOTICE};

#[derive(Clone, Debug)]
pub struct Broadcaster {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl Broadcaster {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Never blocks. Dropped silently once the hub has shut down.
    pub fn publish(&self, message: ClientMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("broadcast bus closed, message dropped");
        }
    }

    /// User-facing notice for every client, `{"title", "message", "type"}`.
    pub fn notice(&self, title: &str, message: &str, level: &str) {
        self.publish(ClientMessage::new(
            MESSAGE_TYPE_NOTICE,
            json!({ "title": title, "message": message, "type": level }),
        ));
    }
}
