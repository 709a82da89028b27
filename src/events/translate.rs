//! Translation table from raw daemon events to [`NormalizedEvent`].
//!
//! Only the pairs listed here are kept. Anything else (exec_* noise, health
//! checks, plugin chatter) is dropped without error.

use std::collections::BTreeMap;

use super::model::NormalizedEvent;
use crate::docker::RawEvent;

/// Attributes worth keeping on the normalized event.
const KEEP_ATTRIBUTES: [&str; 2] = ["name", "image"];

pub fn translate(env: &str, raw: &RawEvent) -> Option<NormalizedEvent> {
    let message = render(raw)?;
    let attributes: BTreeMap<String, String> = KEEP_ATTRIBUTES
        .iter()
        .filter_map(|key| raw.attributes.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect();

    Some(NormalizedEvent {
        env: env.to_string(),
        action: format!("{}/{}", raw.kind, raw.action),
        attributes,
        time_nano: raw.time_nano,
        message,
    })
}

fn render(raw: &RawEvent) -> Option<String> {
    let attr = |key: &str| raw.attributes.get(key).cloned().unwrap_or_default();

    let parts: Vec<String> = match (raw.kind.as_str(), raw.action.as_str()) {
        ("container", "create" | "destroy" | "start" | "stop" | "restart" | "kill" | "die") => {
            vec![attr("name")]
        }
        ("image", "pull" | "push" | "tag" | "untag" | "delete" | "import" | "load" | "save") => {
            let name = attr("name");
            vec![if name.is_empty() { raw.actor_id.clone() } else { name }]
        }
        ("network", "connect" | "disconnect") => {
            let container = attr("container");
            vec![
                "container".to_string(),
                short_id(&container).to_string(),
                raw.action.clone(),
                attr("name"),
            ]
        }
        ("volume", "create" | "destroy") => vec![raw.actor_id.clone()],
        _ => return None,
    };

    Some(parts.join(" "))
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
