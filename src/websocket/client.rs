//! One connected websocket client.
//!
//! A connection owns an outbound queue (drained by its socket writer) and a
//! cancellation token shared by its read and write halves. Inbound control frames
//! are routed through a [`HandlerTable`] keyed by frame type.

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::hub::ConnectionHub;
use super::progress::ProgressRegistry;
use super::protocol::{parse_inbound, ClientMessage, ControlFrame, Inbound, MESSAGE_TYPE_EVENT};

#[derive(Debug, Error, PartialEq)]
pub enum HubError {
    #[error("no handler for control frame {0}")]
    UnknownControl(String),

    #[error("bad control frame: {0}")]
    BadFrame(String),

    #[error("client {0} is gone")]
    ClientGone(String),
}

pub struct ClientConnection {
    fd: String,
    user_id: String,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ClientConnection {
    /// Returns the connection and the receiving end of its outbound queue.
    pub fn new(
        fd: impl Into<String>,
        user_id: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            fd: fd.into(),
            user_id: user_id.into(),
            outbound,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        (client, rx)
    }

    pub fn fd(&self) -> &str {
        &self.fd
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::ClientGone(self.fd.clone()));
        }
        self.outbound
            .send(message)
            .map_err(|_| HubError::ClientGone(self.fd.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Stop both halves. Only the first call does anything; returns whether it was this one.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        tracing::debug!(fd = %self.fd, "client closed");
        true
    }

    /// Read frames until the socket fails, the peer closes or the connection is
    /// cancelled. The caller is expected to `leave` the hub afterwards.
    pub async fn read_loop<S, E>(self: &Arc<Self>, mut frames: S, hub: &ConnectionHub)
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        loop {
            let frame = tokio::select! {
                _ = self.cancelled() => break,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => self.handle_text(&text, hub),
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(fd = %self.fd, "client closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::info!(fd = %self.fd, "stop read loop: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_text(&self, text: &str, hub: &ConnectionHub) {
        match parse_inbound(text) {
            Inbound::Ping => {
                hub.bus().publish(ClientMessage::new(MESSAGE_TYPE_EVENT, "pong").to(self.fd.clone()));
            }
            Inbound::Control(frame) => {
                tracing::debug!(fd = %self.fd, frame = %frame.frame_type, "control frame");
                if let Err(e) = hub.handlers().dispatch(self, &frame) {
                    tracing::warn!(fd = %self.fd, "{}", e);
                }
            }
            Inbound::Malformed(e) => {
                tracing::warn!(fd = %self.fd, "failed to parse frame: {}", e);
            }
        }
    }
}

/// Strategy for one inbound control frame type.
pub trait ControlHandler: Send + Sync {
    fn handle(&self, client: &ClientConnection, frame: &ControlFrame) -> Result<(), HubError>;
}

#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn ControlHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, frame_type: impl Into<String>, handler: Arc<dyn ControlHandler>) {
        self.handlers.insert(frame_type.into(), handler);
    }

    pub fn dispatch(&self, client: &ClientConnection, frame: &ControlFrame) -> Result<(), HubError> {
        match self.handlers.get(&frame.frame_type) {
            Some(handler) => handler.handle(client, frame),
            None => Err(HubError::UnknownControl(frame.frame_type.clone())),
        }
    }
}

/// `{"type":"progress:close","data":"<channel>"}`
pub struct CloseProgress {
    progress: Arc<ProgressRegistry>,
}

impl CloseProgress {
    pub fn new(progress: Arc<ProgressRegistry>) -> Self {
        Self { progress }
    }
}

impl ControlHandler for CloseProgress {
    fn handle(&self, client: &ClientConnection, frame: &ControlFrame) -> Result<(), HubError> {
        let name = frame
            .data
            .as_str()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| HubError::BadFrame("progress:close expects a channel name".to_string()))?;
        self.progress.close_requested(name, client.fd());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::bus::Broadcaster;
    use serde_json::json;

    #[test]
    fn test_close_is_idempotent() {
        let (client, _rx) = ClientConnection::new("fd:1", "admin");
        assert!(client.close());
        assert!(!client.close());
        assert!(client.is_closed());
        assert_eq!(
            client.send(ClientMessage::new("event", "x")),
            Err(HubError::ClientGone("fd:1".to_string()))
        );
    }

    #[test]
    fn test_send_fails_when_writer_is_gone() {
        let (client, rx) = ClientConnection::new("fd:1", "admin");
        drop(rx);
        assert!(client.send(ClientMessage::new("event", "x")).is_err());
    }

    #[test]
    fn test_close_progress_handler() {
        let (bus, _rx) = Broadcaster::new();
        let progress = Arc::new(ProgressRegistry::new(bus));
        progress.open("image:pull:demo", false);

        let mut table = HandlerTable::new();
        table.insert("progress:close", Arc::new(CloseProgress::new(progress.clone())));
        let (client, _out) = ClientConnection::new("fd:1", "admin");

        let bad = ControlFrame {
            frame_type: "progress:close".to_string(),
            data: json!(5),
        };
        assert!(matches!(table.dispatch(&client, &bad), Err(HubError::BadFrame(_))));

        let unknown = ControlFrame {
            frame_type: "shell:resize".to_string(),
            data: json!(null),
        };
        assert_eq!(
            table.dispatch(&client, &unknown),
            Err(HubError::UnknownControl("shell:resize".to_string()))
        );

        let close = ControlFrame {
            frame_type: "progress:close".to_string(),
            data: json!("image:pull:demo"),
        };
        table.dispatch(&client, &close).unwrap();
        assert!(!progress.contains("image:pull:demo"));
    }

    fn hub() -> (ConnectionHub, tokio::sync::mpsc::UnboundedReceiver<ClientMessage>) {
        let (bus, rx) = Broadcaster::new();
        let progress = Arc::new(ProgressRegistry::new(bus.clone()));
        (ConnectionHub::new(progress, bus), rx)
    }

    fn text(frame: &str) -> Result<Message, String> {
        Ok(Message::Text(frame.to_string()))
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_read_loop_routes_frames_until_close() {
        let (hub, mut bus_rx) = hub();
        let (client, _out) = ClientConnection::new("fd:1", "admin");
        hub.join(client.clone());
        let channel = hub.progress().open("image:pull:demo", false);

        let frames = futures::stream::iter(vec![
            text("{broken"),
            text("ping"),
            text(r#"{"type":"progress:close","data":"image:pull:demo"}"#),
            Ok(Message::Close(None)),
            text("ping"),
        ]);
        client.read_loop(frames, &hub).await;

        // The malformed frame did not end the loop, the frame after Close was never read.
        let pongs = drain(&mut bus_rx);
        assert_eq!(pongs.len(), 1);
        assert_eq!(pongs[0].fd, "fd:1");
        let json: serde_json::Value = serde_json::from_str(&pongs[0].to_json()).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["data"], "pong");

        assert!(channel.is_closed());
        assert!(!hub.progress().contains("image:pull:demo"));
    }

    #[tokio::test]
    async fn test_read_loop_stops_on_socket_error() {
        let (hub, mut bus_rx) = hub();
        let (client, _out) = ClientConnection::new("fd:1", "admin");

        let frames = futures::stream::iter(vec![Err("connection reset".to_string()), text("ping")]);
        client.read_loop(frames, &hub).await;
        assert!(drain(&mut bus_rx).is_empty());

        // End of stream is treated like a close.
        client.read_loop(futures::stream::iter(Vec::<Result<Message, String>>::new()), &hub).await;
    }

    #[tokio::test]
    async fn test_read_loop_stops_on_cancellation() {
        let (hub, _bus_rx) = hub();
        let (client, _out) = ClientConnection::new("fd:1", "admin");

        let reader = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .read_loop(futures::stream::pending::<Result<Message, String>>(), &hub)
                    .await;
            })
        };
        tokio::task::yield_now().await;
        client.close();
        reader.await.unwrap();
    }
}
