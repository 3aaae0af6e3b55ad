//! Streaming text and frame plumbing
//!
//! Small, self-contained pieces used by the controllers:
//! - [`SentenceMux`]: token deltas in, whole sentences out
//! - [`NdjsonPump`]: byte stream in, one JSON object per callback
//! - [`ReorderBuffer`]: sequence-tagged chunks in, in-order chunks out
//! - [`SseParser`]: server-sent event bytes in, JSON events out

pub mod ndjson;
pub mod reorder;
pub mod sentence;
pub mod sse;

pub use ndjson::NdjsonPump;
pub use reorder::ReorderBuffer;
pub use sentence::SentenceMux;
pub use sse::SseParser;
