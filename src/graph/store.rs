//! Durable node configuration records and graph-level config
//!
//! Per-node records live under `graph.node.<id>` in the KV store; the
//! graph-level record (transport selection, wire set, graph identity)
//! lives under `graph.cfg`. The editor-owned `graph.workspace` record is
//! consumed here only during restore.

use crate::graph::kv::KvStore;
use crate::graph::router::Router;
use crate::types::{NodeKind, PortAddress, Wire};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Graph-level configuration key
pub const GRAPH_CFG_KEY: &str = "graph.cfg";
/// Prefix for per-node records
pub const NODE_KEY_PREFIX: &str = "graph.node.";
/// Editor-owned workspace snapshot, consumed only during restore
pub const WORKSPACE_KEY: &str = "graph.workspace";

/// Transport selection for the whole graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Relay,
}

/// `{transport, wires[], graphId}` under `graph.cfg`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphConfig {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub wires: Vec<Wire>,
    #[serde(default, rename = "graphId")]
    pub graph_id: String,
}

/// One durable node record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl NodeRecord {
    /// Fetch a config field as string, empty when absent.
    pub fn str_field(&self, key: &str) -> String {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    pub fn bool_field(&self, key: &str, default: bool) -> bool {
        self.config.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn f64_field(&self, key: &str, default: f64) -> f64 {
        self.config.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub fn u64_field(&self, key: &str, default: u64) -> u64 {
        self.config.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
    }
}

/// Typed default config per node kind.
pub fn default_config(kind: NodeKind) -> Map<String, Value> {
    let v = match kind {
        NodeKind::Asr => json!({
            "base": "",
            "apiKey": "",
            "useRelay": false,
            "relay": "",
            "live": true,
            "rate": 16000,
            "chunkMs": 120,
            "emaMs": 120,
            "rms": 0.012,
            "holdMs": 250,
            "preMs": 450,
            "silenceMs": 800,
            "minTailMs": 300,
            "phraseMin": 3,
            "phraseStableMs": 350,
            "emitPartials": true,
            "mode": "auto",
            "model": "",
            "prompt": "",
        }),
        NodeKind::Llm => json!({
            "base": "",
            "apiKey": "",
            "useRelay": false,
            "relay": "",
            "model": "",
            "stream": true,
            "system": "",
            "useSystem": false,
            "memoryOn": true,
            "maxTurns": 8,
            "memory": [],
        }),
        NodeKind::Tts => json!({
            "base": "",
            "apiKey": "",
            "useRelay": false,
            "relay": "",
            "mode": "stream",
            "model": "",
            "voice": "",
        }),
        NodeKind::TextInput => json!({}),
        NodeKind::Template => json!({
            "template": "",
        }),
        NodeKind::PeerDm => json!({
            "peer": "",
            "autoAccept": false,
            "allowedPeers": [],
            "heartbeatS": 15,
            "chunkBytes": 1800,
        }),
    };
    match v {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Owner of durable node records.
pub struct NodeStore {
    kv: Arc<dyn KvStore>,
}

impl NodeStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(id: &str) -> String {
        format!("{}{}", NODE_KEY_PREFIX, id)
    }

    /// Load the record for `id`, or create a fresh one with typed
    /// defaults. A stored record whose type does not match `kind` is
    /// replaced wholesale.
    pub fn ensure(&self, id: &str, kind: NodeKind) -> NodeRecord {
        if let Some(rec) = self.load(id) {
            if rec.kind == kind.as_str() {
                return rec;
            }
            debug!("Node {} type changed {} -> {}, resetting", id, rec.kind, kind);
        }
        let rec = NodeRecord {
            id: id.to_string(),
            kind: kind.as_str().to_string(),
            config: default_config(kind),
        };
        self.save_obj(&rec);
        rec
    }

    pub fn load(&self, id: &str) -> Option<NodeRecord> {
        let raw = self.kv.get(&Self::key(id))?;
        serde_json::from_value(raw).ok()
    }

    pub fn save_obj(&self, rec: &NodeRecord) {
        match serde_json::to_value(rec) {
            Ok(v) => self.kv.set(&Self::key(&rec.id), v),
            Err(e) => warn!("Failed to serialize node {}: {}", rec.id, e),
        }
    }

    /// Shallow-merge `patch` into the node's config and persist.
    pub fn update(&self, id: &str, patch: Value) -> Option<NodeRecord> {
        let mut rec = self.load(id)?;
        if let Value::Object(fields) = patch {
            for (k, v) in fields {
                rec.config.insert(k, v);
            }
        }
        self.save_obj(&rec);
        Some(rec)
    }

    pub fn erase(&self, id: &str) {
        self.kv.remove(&Self::key(id));
    }

    /// Flip the node's transport between direct HTTP and the relay,
    /// recording the relay address alongside.
    pub fn set_relay(&self, id: &str, kind: NodeKind, relay: &str) -> NodeRecord {
        self.ensure(id, kind);
        self.update(
            id,
            json!({ "useRelay": !relay.is_empty(), "relay": relay }),
        )
        .expect("record just ensured")
    }

    /// All node ids with a durable record.
    pub fn node_ids(&self) -> Vec<String> {
        self.kv
            .keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix(NODE_KEY_PREFIX).map(|s| s.to_string()))
            .collect()
    }

    /// Load `graph.cfg`, minting and persisting a graph id on first use.
    pub fn graph_config(&self) -> GraphConfig {
        let mut cfg: GraphConfig = self
            .kv
            .get(GRAPH_CFG_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        if cfg.graph_id.is_empty() {
            cfg.graph_id = Uuid::new_v4().to_string();
            self.save_graph_config(&cfg);
            info!("Minted graph id {}", cfg.graph_id);
        }
        cfg
    }

    pub fn save_graph_config(&self, cfg: &GraphConfig) {
        match serde_json::to_value(cfg) {
            Ok(v) => self.kv.set(GRAPH_CFG_KEY, v),
            Err(e) => warn!("Failed to serialize graph config: {}", e),
        }
    }

    /// Reapply the durable wire set from `graph.cfg` into the router.
    pub fn apply_graph_wires(&self, router: &Router) -> usize {
        let cfg = self.graph_config();
        let mut applied = 0;
        for wire in cfg.wires {
            match router.add_wire(wire.from.clone(), wire.to.clone()) {
                Ok(()) => applied += 1,
                Err(e) => warn!("Skipping stored wire {} -> {}: {}", wire.from, wire.to, e),
            }
        }
        applied
    }

    /// Keep `graph.cfg` in sync with the router's wire table.
    pub fn bind_wire_persistence(self: Arc<Self>, router: &Arc<Router>) {
        let store = self;
        let weak_router = Arc::downgrade(router);
        router.on_wire_event(move |_event| {
            if let Some(router) = weak_router.upgrade() {
                let mut cfg = store.graph_config();
                cfg.wires = router.list_wires();
                store.save_graph_config(&cfg);
            }
        });
    }

    /// Reapply an editor-owned workspace snapshot: node configs first,
    /// then wires. Consume-only; the workspace record is never written.
    pub fn restore_workspace(&self, router: &Router) -> Result<usize> {
        let ws = self
            .kv
            .get(WORKSPACE_KEY)
            .context("No workspace snapshot to restore")?;
        if let Some(configs) = ws.get("nodeConfigs").and_then(|v| v.as_object()) {
            for (id, patch) in configs {
                if self.load(id).is_some() {
                    self.update(id, patch.clone());
                }
            }
        }
        let mut applied = 0;
        if let Some(links) = ws.get("links").and_then(|v| v.as_array()) {
            for link in links {
                let from = link.get("from").and_then(|v| v.as_str());
                let to = link.get("to").and_then(|v| v.as_str());
                if let (Some(from), Some(to)) = (from, to) {
                    let parsed: Result<(PortAddress, PortAddress)> =
                        from.parse().and_then(|f| to.parse().map(|t| (f, t)));
                    match parsed {
                        Ok((f, t)) => {
                            if router.add_wire(f, t).is_ok() {
                                applied += 1;
                            }
                        }
                        Err(e) => warn!("Skipping malformed workspace link: {}", e),
                    }
                }
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::kv::MemoryKv;

    fn store() -> NodeStore {
        NodeStore::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn test_ensure_creates_with_defaults() {
        let s = store();
        let rec = s.ensure("n1", NodeKind::Llm);
        assert_eq!(rec.kind, "llm");
        assert_eq!(rec.u64_field("maxTurns", 0), 8);
        assert!(rec.bool_field("memoryOn", false));
    }

    #[test]
    fn test_ensure_resets_on_type_mismatch() {
        let s = store();
        s.ensure("n1", NodeKind::Llm);
        s.update("n1", json!({"model": "custom"}));
        let rec = s.ensure("n1", NodeKind::Tts);
        assert_eq!(rec.kind, "tts");
        assert_eq!(rec.str_field("model"), "");
    }

    #[test]
    fn test_update_shallow_merges() {
        let s = store();
        s.ensure("n1", NodeKind::Llm);
        let rec = s.update("n1", json!({"model": "m", "maxTurns": 4})).unwrap();
        assert_eq!(rec.str_field("model"), "m");
        assert_eq!(rec.u64_field("maxTurns", 0), 4);
        // untouched defaults survive
        assert!(rec.bool_field("stream", false));
    }

    #[test]
    fn test_erase_removes_record() {
        let s = store();
        s.ensure("n1", NodeKind::Asr);
        s.erase("n1");
        assert!(s.load("n1").is_none());
    }

    #[test]
    fn test_graph_id_minted_once() {
        let s = store();
        let a = s.graph_config();
        let b = s.graph_config();
        assert!(!a.graph_id.is_empty());
        assert_eq!(a.graph_id, b.graph_id);
    }

    #[test]
    fn test_set_relay_flags() {
        let s = store();
        let rec = s.set_relay("n1", NodeKind::Tts, "addr.xyz");
        assert!(rec.bool_field("useRelay", false));
        assert_eq!(rec.str_field("relay"), "addr.xyz");
    }

    #[test]
    fn test_wire_persistence_roundtrip() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let store = Arc::new(NodeStore::new(Arc::clone(&kv)));
        let router = Arc::new(Router::new());
        Arc::clone(&store).bind_wire_persistence(&router);
        router
            .add_wire(
                crate::types::PortAddress::output("a", "text"),
                crate::types::PortAddress::input("b", "text"),
            )
            .unwrap();
        assert_eq!(store.graph_config().wires.len(), 1);

        // A fresh router rebuilds the wire table from graph.cfg.
        let restored = Router::new();
        assert_eq!(store.apply_graph_wires(&restored), 1);
        assert_eq!(restored.list_wires(), router.list_wires());

        router.remove_wire(
            &crate::types::PortAddress::output("a", "text"),
            &crate::types::PortAddress::input("b", "text"),
        );
        assert!(store.graph_config().wires.is_empty());
    }

    #[test]
    fn test_workspace_restore_applies_links() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let s = NodeStore::new(Arc::clone(&kv));
        s.ensure("a", NodeKind::TextInput);
        s.ensure("b", NodeKind::Tts);
        kv.set(
            WORKSPACE_KEY,
            json!({
                "nodes": ["a", "b"],
                "links": [{"from": "a:out:text", "to": "b:in:text"}],
                "nodeConfigs": {"b": {"voice": "alto"}}
            }),
        );
        let router = Router::new();
        let applied = s.restore_workspace(&router).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(router.list_wires().len(), 1);
        assert_eq!(s.load("b").unwrap().str_field("voice"), "alto");
    }
}
