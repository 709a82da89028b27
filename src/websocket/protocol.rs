//! Wire frames exchanged with websocket clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Daemon notifications and pongs
pub const MESSAGE_TYPE_EVENT: &str = "event";
/// User-facing notices
pub const MESSAGE_TYPE_NOTICE: &str = "notice";
/// Inbound request to close a progress channel by name
pub const MESSAGE_TYPE_PROGRESS_CLOSE: &str = "progress:close";

pub const NOTICE_WARNING: &str = "warning";

pub fn image_pull_channel(tag: &str) -> String {
    format!("image:pull:{}", tag)
}

/// Outbound frame. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Target connection; empty means every connected client
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fd: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: Value,
    #[serde(rename = "respAt")]
    pub resp_at: DateTime<Utc>,
}

impl ClientMessage {
    pub fn new(message_type: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            fd: String::new(),
            message_type: message_type.into(),
            data: data.into(),
            resp_at: Utc::now(),
        }
    }

    pub fn to(mut self, fd: impl Into<String>) -> Self {
        self.fd = fd.into();
        self
    }

    pub fn is_targeted(&self) -> bool {
        !self.fd.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Inbound control frame, `{"type": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub data: Value,
}

/// What the read loop should do with one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ping,
    Control(ControlFrame),
    Malformed(String),
}

pub fn parse_inbound(text: &str) -> Inbound {
    let trimmed = text.trim();
    if trimmed == "ping" || trimmed == "pong" {
        return Inbound::Ping;
    }
    match serde_json::from_str::<ControlFrame>(trimmed) {
        Ok(frame) => Inbound::Control(frame),
        Err(e) => Inbound::Malformed(e.to_string()),
    }
}
