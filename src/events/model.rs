//! Normalized daemon events and connectivity notifications.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DOCKER_START_EVENT: &str = "docker_start";
pub const DOCKER_STOP_EVENT: &str = "docker_stop";
pub const DOCKER_MESSAGE_EVENT: &str = "docker_message";

/// Compact, daemon-agnostic form of one daemon event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Environment the event came from
    pub env: String,
    /// `<type>/<action>`, e.g. `container/start`
    pub action: String,
    pub attributes: BTreeMap<String, String>,
    #[serde(rename = "timeNano")]
    pub time_nano: i64,
    pub message: String,
}

impl NormalizedEvent {
    pub fn kind(&self) -> &str {
        self.action.split('/').next().unwrap_or_default()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.time_nano)
    }
}

/// Everything an environment watcher reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonEvent {
    #[serde(rename = "docker_start")]
    Started { env: String },

    #[serde(rename = "docker_stop")]
    Stopped { env: String, message: String },

    #[serde(rename = "docker_message")]
    Message(NormalizedEvent),
}

impl DaemonEvent {
    pub fn env(&self) -> &str {
        match self {
            DaemonEvent::Started { env } | DaemonEvent::Stopped { env, .. } => env,
            DaemonEvent::Message(event) => &event.env,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            DaemonEvent::Started { .. } => DOCKER_START_EVENT,
            DaemonEvent::Stopped { .. } => DOCKER_STOP_EVENT,
            DaemonEvent::Message(_) => DOCKER_MESSAGE_EVENT,
        }
    }
}
