//! Speech recognition: VAD-gated live sessions and one-shot batch mode
//!
//! The microphone has exactly one owner at a time; starting recognition
//! on one node stops any prior owner before activating the new one.

pub mod controller;
pub mod hallucination;
pub mod vad;
pub mod wav;

pub use controller::{AsrConfig, AsrController, PhraseDetector};
pub use hallucination::{matches_signoff, should_drop, FinalMetadata, GuardContext};
pub use vad::{Vad, VadConfig, VadState, VadTransition};

use crate::graph::router::Router;
use crate::graph::store::NodeStore;
use crate::transport::TransportMux;
use crate::types::NodeKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Creates per-node controllers and arbitrates microphone ownership.
pub struct AsrService {
    mux: Arc<TransportMux>,
    router: Arc<Router>,
    store: Arc<NodeStore>,
    controllers: Mutex<HashMap<String, AsrController>>,
    owner: Mutex<Option<String>>,
}

impl AsrService {
    pub fn new(mux: Arc<TransportMux>, router: Arc<Router>, store: Arc<NodeStore>) -> Self {
        Self {
            mux,
            router,
            store,
            controllers: Mutex::new(HashMap::new()),
            owner: Mutex::new(None),
        }
    }

    /// Start capture for `node_id`, stopping any prior owner first.
    pub fn start(&self, node_id: &str) -> AsrController {
        {
            let mut owner = self.owner.lock().unwrap();
            if let Some(prev) = owner.take() {
                if prev != node_id {
                    info!("Microphone moving from {} to {}", prev, node_id);
                    if let Some(ctl) = self.controllers.lock().unwrap().get(&prev) {
                        ctl.stop();
                    }
                }
            }
            *owner = Some(node_id.to_string());
        }
        let rec = self.store.ensure(node_id, NodeKind::Asr);
        let cfg = AsrConfig::from_record(&rec);
        let ctl = AsrController::new(
            node_id,
            cfg,
            Arc::clone(&self.mux),
            Arc::clone(&self.router),
        );
        ctl.activate();
        self.controllers
            .lock()
            .unwrap()
            .insert(node_id.to_string(), ctl.clone());
        ctl
    }

    pub fn stop(&self, node_id: &str) {
        {
            let mut owner = self.owner.lock().unwrap();
            if owner.as_deref() == Some(node_id) {
                *owner = None;
            }
        }
        if let Some(ctl) = self.controllers.lock().unwrap().get(node_id) {
            ctl.stop();
        }
    }

    /// Feed captured audio; ignored unless `node_id` owns the microphone.
    pub fn push_audio(&self, node_id: &str, samples: &[f32], source_rate: u32) {
        if self.owner.lock().unwrap().as_deref() != Some(node_id) {
            return;
        }
        if let Some(ctl) = self.controllers.lock().unwrap().get(node_id) {
            ctl.push_audio(samples, source_rate);
        }
    }

    pub fn owner(&self) -> Option<String> {
        self.owner.lock().unwrap().clone()
    }

    pub fn controller(&self, node_id: &str) -> Option<AsrController> {
        self.controllers.lock().unwrap().get(node_id).cloned()
    }

    /// Tear down a node entirely (graph removal).
    pub fn remove(&self, node_id: &str) {
        self.stop(node_id);
        self.controllers.lock().unwrap().remove(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::kv::MemoryKv;
    use crate::transport::relay::RelayFactory;

    fn service() -> AsrService {
        let kv = Arc::new(MemoryKv::new());
        let factory: RelayFactory = Arc::new(|_| anyhow::bail!("no relay in tests"));
        let mux = TransportMux::new(Arc::clone(&kv) as Arc<dyn crate::graph::kv::KvStore>, factory);
        let router = Arc::new(Router::new());
        let store = Arc::new(NodeStore::new(kv));
        AsrService::new(mux, router, store)
    }

    #[tokio::test]
    async fn test_single_microphone_owner() {
        let svc = service();
        let a = svc.start("asr-a");
        assert!(a.is_active());
        assert_eq!(svc.owner().as_deref(), Some("asr-a"));

        let b = svc.start("asr-b");
        assert!(b.is_active());
        assert!(!a.is_active(), "prior owner must be stopped");
        assert_eq!(svc.owner().as_deref(), Some("asr-b"));
    }

    #[tokio::test]
    async fn test_audio_from_non_owner_ignored() {
        let svc = service();
        svc.start("asr-a");
        // Must not panic or route anywhere.
        svc.push_audio("asr-b", &[0.0; 160], 16_000);
    }

    #[tokio::test]
    async fn test_stop_clears_ownership() {
        let svc = service();
        svc.start("asr-a");
        svc.stop("asr-a");
        assert!(svc.owner().is_none());
    }
}
