//! Voicegraph - Realtime Voice Dataflow Runtime
//!
//! A streaming dataflow engine composing speech-to-text, chat, and
//! text-to-speech services into a user-editable directed graph:
//! - Typed port/wire router with fan-out and exclusive inputs
//! - Request/stream multiplexer over direct HTTP or a datagram relay
//! - Sentence-aware token mux and NDJSON framing pump
//! - VAD-gated live ASR session controller
//! - Peer DM overlay (handshake, heartbeat, chunked delivery)
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use voicegraph::graph::{MemoryKv, NodeStore, Router};
//! use voicegraph::transport::TransportMux;
//!
//! let kv = Arc::new(MemoryKv::new());
//! let router = Arc::new(Router::new());
//! let store = Arc::new(NodeStore::new(kv.clone()));
//! let mux = TransportMux::new(kv, Arc::new(|_| unimplemented!("relay")));
//! let cfg = store.graph_config();
//! println!("graph {}", cfg.graph_id);
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod audio;
pub mod stream;
pub mod graph;
pub mod transport;

// Node controllers
pub mod asr;
pub mod llm;
pub mod nodes;
pub mod peer;
pub mod tts;

// Re-export commonly used types for convenience
pub use graph::{
    kv::{FileKv, KvStore, MemoryKv},
    log::NodeLog,
    router::Router,
    store::{GraphConfig, NodeRecord, NodeStore, TransportKind},
};

pub use stream::{NdjsonPump, ReorderBuffer, SentenceMux, SseParser};

pub use transport::{
    relay::{RelayClient, RelayFactory, RelayHub, RelayInbound, SendOptions, StreamHandlers},
    Route, TransportError, TransportMux,
};

pub use types::{normalize_payload, Direction, NodeKind, PortAddress, Wire};

pub use asr::{AsrConfig, AsrController, AsrService};
pub use llm::{ChatMessage, LlmConfig, LlmController};
pub use nodes::{TemplateNode, TextInputNode};
pub use peer::{Invite, PeerDmService};
pub use tts::{TtsConfig, TtsController};

pub use audio::{AudioSink, Blob, BlobPlayer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize tracing with the standard env-filter setup.
///
/// Embedders that already install a subscriber should skip this.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
