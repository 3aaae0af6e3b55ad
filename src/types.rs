//! Shared types used across modules
//!
//! Port addressing, wires, node kinds, and the payload normalization
//! rule that sinks use to pull text out of arbitrary message shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Direction of a port relative to its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// Address of a single port: `(nodeId, direction, portName)`
///
/// Rendered as `"<nodeId>:(in|out):<portName>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortAddress {
    pub node: String,
    pub direction: Direction,
    pub port: String,
}

impl PortAddress {
    pub fn input(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            direction: Direction::In,
            port: port.into(),
        }
    }

    pub fn output(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            direction: Direction::Out,
            port: port.into(),
        }
    }
}

impl fmt::Display for PortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.node, self.direction.as_str(), self.port)
    }
}

impl FromStr for PortAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let node = parts.next().unwrap_or_default();
        let dir = parts.next().unwrap_or_default();
        let port = parts.next().unwrap_or_default();
        if node.is_empty() || port.is_empty() {
            anyhow::bail!("Malformed port address: {}", s);
        }
        let direction = match dir {
            "in" => Direction::In,
            "out" => Direction::Out,
            other => anyhow::bail!("Unknown port direction: {}", other),
        };
        Ok(Self {
            node: node.to_string(),
            direction,
            port: port.to_string(),
        })
    }
}

/// A directed edge from an output port to an input port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wire {
    pub from: PortAddress,
    pub to: PortAddress,
}

impl Wire {
    pub fn new(from: PortAddress, to: PortAddress) -> Self {
        Self { from, to }
    }
}

/// Node kinds known to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Asr,
    Llm,
    Tts,
    TextInput,
    Template,
    PeerDm,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Asr => "asr",
            NodeKind::Llm => "llm",
            NodeKind::Tts => "tts",
            NodeKind::TextInput => "textinput",
            NodeKind::Template => "template",
            NodeKind::PeerDm => "peerdm",
        }
    }

    /// Output port names fixed per node kind
    pub fn output_ports(&self) -> &'static [&'static str] {
        match self {
            NodeKind::Asr => &["partial", "phrase", "final"],
            NodeKind::Llm => &["delta", "final", "memory"],
            NodeKind::Tts => &[],
            NodeKind::TextInput => &["text"],
            NodeKind::Template => &["text"],
            NodeKind::PeerDm => &["incoming", "status", "raw"],
        }
    }

    /// Statically known input port names (Template adds one per variable)
    pub fn input_ports(&self) -> &'static [&'static str] {
        match self {
            NodeKind::Asr => &[],
            NodeKind::Llm => &["prompt", "system"],
            NodeKind::Tts => &["text"],
            NodeKind::TextInput => &[],
            NodeKind::Template => &["trigger"],
            NodeKind::PeerDm => &["text"],
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asr" => Ok(NodeKind::Asr),
            "llm" => Ok(NodeKind::Llm),
            "tts" => Ok(NodeKind::Tts),
            "textinput" | "text-input" | "text" => Ok(NodeKind::TextInput),
            "template" => Ok(NodeKind::Template),
            "peerdm" | "peer-dm" | "peer" => Ok(NodeKind::PeerDm),
            other => anyhow::bail!("Unknown node kind: {}", other),
        }
    }
}

/// Canonical text view of a routed payload
///
/// Sinks depend only on this record, never on the raw payload shape.
#[derive(Debug, Clone)]
pub struct NormalizedText {
    /// Best textual representation of the payload
    pub text: String,
    /// The original payload, when it was structured
    pub parsed: Option<Value>,
}

/// Extract the canonical text from an arbitrary payload.
///
/// Rule: a string `text` field wins; else `value`, `content`, or `data`;
/// else the payload itself if it is a string; else the payload stringified.
pub fn normalize_payload(payload: &Value) -> NormalizedText {
    if let Value::String(s) = payload {
        return NormalizedText {
            text: s.clone(),
            parsed: None,
        };
    }
    for key in ["text", "value", "content", "data"] {
        if let Some(s) = payload.get(key).and_then(|v| v.as_str()) {
            return NormalizedText {
                text: s.to_string(),
                parsed: Some(payload.clone()),
            };
        }
    }
    NormalizedText {
        text: payload.to_string(),
        parsed: Some(payload.clone()),
    }
}

/// Build the standard text message routed between nodes
pub fn text_message(node_id: &str, text: &str) -> Value {
    serde_json::json!({
        "nodeId": node_id,
        "type": "text",
        "text": text,
        "eos": true,
    })
}
