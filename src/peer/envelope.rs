//! Peer DM frames and inbound payload hydration
//!
//! Every DM frame carries `from`, `componentId`, optional `targetId`,
//! `graphId`, and `ts`. Inbound datagrams arrive as strings, byte
//! arrays, or parsed objects; hydration is best-effort and repeated (a
//! JSON string field is parsed, a base64-looking string is decoded and
//! re-parsed).

use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};

/// Keys tried, in order, when picking the text of a DM payload.
pub const DM_TEXT_KEYS: &[&str] = &[
    "text",
    "message",
    "content",
    "value",
    "body",
    "payload",
    "data",
    "note",
    "detail",
    "result",
    "entry",
    "summary",
    "description",
];

/// Identity stamped on every outbound frame.
#[derive(Debug, Clone)]
pub struct FrameContext {
    /// Our relay address
    pub from: String,
    /// `<graphId>:<nodeId>` of the sending node
    pub component_id: String,
    pub graph_id: String,
}

impl FrameContext {
    fn stamp(&self, mut frame: Value, target_id: Option<&str>) -> Value {
        frame["from"] = json!(self.from);
        frame["componentId"] = json!(self.component_id);
        frame["graphId"] = json!(self.graph_id);
        frame["ts"] = json!(Utc::now().timestamp_millis());
        if let Some(t) = target_id.filter(|t| !t.is_empty()) {
            frame["targetId"] = json!(t);
        }
        frame
    }

    pub fn handshake(&self, action: &str, target_id: Option<&str>, heartbeat_s: u64) -> Value {
        self.stamp(
            json!({"event": "handshake", "action": action, "heartbeat": heartbeat_s}),
            target_id,
        )
    }

    pub fn heartbeat(&self, action: &str, target_id: Option<&str>) -> Value {
        self.stamp(json!({"event": "heartbeat", "action": action}), target_id)
    }

    pub fn data(&self, id: &str, seq: usize, total: usize, text: &str, target_id: Option<&str>) -> Value {
        self.stamp(
            json!({"event": "data", "id": id, "seq": seq, "total": total, "text": text}),
            target_id,
        )
    }

    pub fn debug(&self, action: &str, note: &str, target_id: Option<&str>) -> Value {
        self.stamp(
            json!({"event": "debug", "action": action, "note": note}),
            target_id,
        )
    }
}

/// Parse an inbound datagram into a frame, hydrating nested encodings.
pub fn hydrate(payload: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(payload) {
        Ok(v) => hydrate_value(v, 3),
        Err(_) => hydrate_value(
            Value::String(String::from_utf8_lossy(payload).into_owned()),
            3,
        ),
    }
}

fn hydrate_value(value: Value, depth: u8) -> Value {
    if depth == 0 {
        return value;
    }
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
                    return hydrate_value(v, depth - 1);
                }
            }
            if looks_base64(trimmed) {
                if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
                    if let Ok(v) = serde_json::from_slice::<Value>(&bytes) {
                        return hydrate_value(v, depth - 1);
                    }
                }
            }
            Value::String(s)
        }
        other => other,
    }
}

fn looks_base64(s: &str) -> bool {
    s.len() >= 8
        && s.len() % 4 == 0
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

/// Pick the best textual representation of a DM payload.
pub fn best_text(value: &Value) -> String {
    if let Value::String(s) = value {
        return s.clone();
    }
    for key in DM_TEXT_KEYS {
        if let Some(s) = value.get(*key).and_then(|v| v.as_str()) {
            if !s.is_empty() {
                return s.to_string();
            }
        }
    }
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Event name of a hydrated frame, empty when absent.
pub fn frame_event(frame: &Value) -> &str {
    frame.get("event").and_then(|v| v.as_str()).unwrap_or("")
}

/// Graph id addressed by a frame's `targetId` (`<graphId>:<nodeId>`).
pub fn target_graph_id(frame: &Value) -> Option<&str> {
    frame
        .get("targetId")
        .and_then(|v| v.as_str())
        .and_then(|t| t.split(':').next())
        .filter(|s| !s.is_empty())
}
