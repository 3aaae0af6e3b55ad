//! Key-value persistence abstraction
//!
//! The runtime treats durable state as string→JSON pairs. Production
//! runs use [`FileKv`] (a single JSON document on disk); tests inject
//! [`MemoryKv`] through constructor parameters.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// String→JSON store. Single-writer; `update`-style callers do
/// read-modify-write and must not assume atomicity across patches.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn remove(&self, key: &str);
    /// Keys currently present, unordered.
    fn keys(&self) -> Vec<String>;
}

/// In-memory store for tests and ephemeral graphs.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<HashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Option<Value> {
        self.map.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.map.lock().unwrap().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.map.lock().unwrap().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.map.lock().unwrap().keys().cloned().collect()
    }
}

/// File-backed store: the whole keyspace is one JSON object on disk,
/// rewritten on every mutation.
pub struct FileKv {
    path: PathBuf,
    cache: Mutex<HashMap<String, Value>>,
}

impl FileKv {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cache = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str::<HashMap<String, Value>>(&raw)
                .with_context(|| format!("Malformed store file {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    /// Open the store at the default per-user data location.
    pub fn open_default() -> Result<Self> {
        let dir = dirs::data_dir()
            .context("No data directory available")?
            .join("voicegraph");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Self::open(dir.join("graph.json"))
    }

    fn persist(&self, cache: &HashMap<String, Value>) {
        match serde_json::to_vec_pretty(cache) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!("Failed to persist {}: {}", self.path.display(), e);
                }
            }
            Err(e) => warn!("Failed to serialize store: {}", e),
        }
    }
}

impl KvStore for FileKv {
    fn get(&self, key: &str) -> Option<Value> {
        self.cache.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(key.to_string(), value);
        self.persist(&cache);
    }

    fn remove(&self, key: &str) {
        let mut cache = self.cache.lock().unwrap();
        if cache.remove(key).is_some() {
            self.persist(&cache);
        }
    }

    fn keys(&self) -> Vec<String> {
        self.cache.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_roundtrip() {
        let kv = MemoryKv::new();
        kv.set("a", json!({"x": 1}));
        assert_eq!(kv.get("a").unwrap()["x"], 1);
        kv.remove("a");
        assert!(kv.get("a").is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        {
            let kv = FileKv::open(&path).unwrap();
            kv.set("graph.cfg", json!({"transport": "http"}));
        }
        let kv = FileKv::open(&path).unwrap();
        assert_eq!(kv.get("graph.cfg").unwrap()["transport"], "http");
    }

    #[test]
    fn test_keys_listing() {
        let kv = MemoryKv::new();
        kv.set("graph.node.a", json!({}));
        kv.set("graph.node.b", json!({}));
        let mut keys = kv.keys();
        keys.sort();
        assert_eq!(keys, vec!["graph.node.a", "graph.node.b"]);
    }
}
