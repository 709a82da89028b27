//! Write hook for daemon progress streams (image pull, push, build).
//!
//! The daemon answers these requests with newline-delimited JSON that may arrive
//! split across arbitrary chunks. The hook buffers partial lines, keeps the latest
//! state of every layer and forwards a structured snapshot per line. An
//! `errorDetail` line is forwarded as `{"error": ...}` and fails the write so the
//! producer stops.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::progress::{ProgressChannel, ProgressError, WriteHook};

#[derive(Debug, Default, Deserialize)]
struct Line {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "progressDetail")]
    progress_detail: Option<Detail>,
    #[serde(default, rename = "errorDetail")]
    error_detail: Option<ErrorDetail>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    aux: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Detail {
    #[serde(default)]
    current: Option<i64>,
    #[serde(default)]
    total: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// One parsed line of daemon progress.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonProgress {
    Error(String),
    Aux(Value),
    Layer {
        id: String,
        status: String,
        current: i64,
        total: i64,
    },
    Status(String),
    Step {
        current: u32,
        total: u32,
        text: String,
    },
    Stream(String),
}

pub fn parse_line(line: &str) -> Option<DaemonProgress> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let parsed: Line = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(_) => return Some(DaemonProgress::Stream(line.to_string())),
    };

    if let Some(message) = parsed.error_detail.and_then(|d| d.message).or(parsed.error) {
        return Some(DaemonProgress::Error(message));
    }
    if let Some(aux) = parsed.aux {
        return Some(DaemonProgress::Aux(aux));
    }
    if let Some(status) = parsed.status {
        return Some(match parsed.id {
            Some(id) if !id.is_empty() => {
                let detail = parsed.progress_detail.unwrap_or_default();
                DaemonProgress::Layer {
                    id,
                    status,
                    current: detail.current.unwrap_or_default(),
                    total: detail.total.unwrap_or_default(),
                }
            }
            _ => DaemonProgress::Status(status),
        });
    }
    let stream = parsed.stream?;
    if let Some((current, total)) = parse_step(&stream) {
        return Some(DaemonProgress::Step {
            current,
            total,
            text: stream.trim_end().to_string(),
        });
    }
    Some(DaemonProgress::Stream(stream))
}

/// `Step 3/12 : RUN make` -> (3, 12)
fn parse_step(stream: &str) -> Option<(u32, u32)> {
    let rest = stream.trim_start().strip_prefix("Step ")?;
    let fraction = rest.split_whitespace().next()?;
    let (current, total) = fraction.split_once('/')?;
    Some((current.parse().ok()?, total.parse().ok()?))
}

#[derive(Debug, Default)]
struct State {
    pending: Vec<u8>,
    layers: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
pub struct DockerProgressHook {
    state: Mutex<State>,
}

impl DockerProgressHook {
    pub fn new() -> Self {
        Self::default()
    }

    fn payload(state: &mut State, progress: DaemonProgress) -> Result<Value, ProgressError> {
        Ok(match progress {
            DaemonProgress::Error(message) => return Err(ProgressError::Daemon(message)),
            DaemonProgress::Aux(aux) => json!({ "aux": aux }),
            DaemonProgress::Layer {
                id,
                status,
                current,
                total,
            } => {
                state.layers.insert(
                    id,
                    json!({ "status": status, "current": current, "total": total }),
                );
                json!({ "layers": state.layers })
            }
            DaemonProgress::Status(status) => json!({ "status": status }),
            DaemonProgress::Step { current, total, text } => json!({
                "step": { "current": current, "total": total },
                "stream": text,
            }),
            DaemonProgress::Stream(stream) => json!({ "stream": stream }),
        })
    }
}

impl WriteHook for DockerProgressHook {
    fn handle(&self, channel: &ProgressChannel, data: &[u8]) -> Result<(), ProgressError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.pending.extend_from_slice(data);

        while let Some(pos) = state.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = state.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let Some(progress) = parse_line(&text) else {
                continue;
            };
            match Self::payload(&mut state, progress) {
                Ok(payload) => channel.emit(payload),
                Err(ProgressError::Daemon(message)) => {
                    channel.emit(json!({ "error": message }));
                    return Err(ProgressError::Daemon(message));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
