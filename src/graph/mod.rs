//! Graph runtime: wire routing and durable node state
//!
//! The [`Router`] delivers typed messages from output ports to input
//! ports along user-edited wires; the [`NodeStore`] keeps per-node
//! configuration records durable through a key-value abstraction.

pub mod kv;
pub mod log;
pub mod router;
pub mod store;

pub use kv::{FileKv, KvStore, MemoryKv};
pub use log::{LogLevel, NodeLog};
pub use router::{Router, WireEvent};
pub use store::{GraphConfig, NodeRecord, NodeStore, TransportKind};
