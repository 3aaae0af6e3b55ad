//! Chunked DM delivery
//!
//! Outbound text is split so that every `data` envelope, fully encoded,
//! fits within the configured datagram budget. Receivers accumulate
//! parts per batch id and complete once every slot is filled.

use crate::peer::envelope::FrameContext;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Default datagram budget for one encoded envelope
pub const DEFAULT_CHUNK_BYTES: usize = 1800;
/// Floor for the configured budget
pub const MIN_CHUNK_BYTES: usize = 512;
/// Envelope overhead assumed when picking the initial text chunk size
const ENVELOPE_MARGIN: usize = 200;

/// Split `text` into `data` frames sharing `batch_id`, each encoding
/// within `chunk_bytes`. Starts at `chunk_bytes - margin` and shrinks by
/// 0.8 until every envelope fits; if no split fits, the whole text goes
/// out as a single best-effort chunk.
pub fn split_into_frames(
    ctx: &FrameContext,
    batch_id: &str,
    text: &str,
    chunk_bytes: usize,
    target_id: Option<&str>,
) -> Vec<Value> {
    let limit = chunk_bytes.max(MIN_CHUNK_BYTES);
    let mut size = (limit.saturating_sub(ENVELOPE_MARGIN)).max(64);
    loop {
        let parts = split_utf8(text, size);
        let total = parts.len();
        let frames: Vec<Value> = parts
            .iter()
            .enumerate()
            .map(|(i, part)| ctx.data(batch_id, i + 1, total, part, target_id))
            .collect();
        let fits = frames
            .iter()
            .all(|f| serde_json::to_vec(f).map(|b| b.len() <= limit).unwrap_or(false));
        if fits {
            return frames;
        }
        let next = (size as f64 * 0.8) as usize;
        if next < 64 {
            debug!("No chunk split fits in {} bytes, sending whole text", limit);
            return vec![ctx.data(batch_id, 1, 1, text, target_id)];
        }
        size = next;
    }
}

/// Split on char boundaries with a per-part byte budget.
fn split_utf8(text: &str, max_bytes: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if !current.is_empty() && current.len() + ch.len_utf8() > max_bytes {
            parts.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    if parts.is_empty() {
        parts.push(String::new());
    }
    parts
}

struct InboxEntry {
    total: usize,
    parts: Vec<Option<String>>,
}

/// Per-node reassembly of chunked batches.
#[derive(Default)]
pub struct Inbox {
    entries: HashMap<String, InboxEntry>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one `data` frame. Returns the assembled text once every
    /// slot of the batch is filled. Frames with out-of-range `seq` or a
    /// mismatched `total` are ignored.
    pub fn accept(&mut self, id: &str, seq: usize, total: usize, text: String) -> Option<String> {
        if seq == 0 || seq > total || total == 0 {
            return None;
        }
        let entry = self.entries.entry(id.to_string()).or_insert_with(|| InboxEntry {
            total,
            parts: vec![None; total],
        });
        if entry.total != total {
            debug!("Batch {} total changed {} -> {}, ignoring frame", id, entry.total, total);
            return None;
        }
        entry.parts[seq - 1] = Some(text);
        if entry.parts.iter().all(|p| p.is_some()) {
            let entry = self.entries.remove(id).unwrap();
            let assembled: String = entry.parts.into_iter().map(|p| p.unwrap()).collect();
            return Some(assembled);
        }
        None
    }

    pub fn pending_batches(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FrameContext {
        FrameContext {
            from: "addr.a".to_string(),
            component_id: "g1:n1".to_string(),
            graph_id: "g1".to_string(),
        }
    }

    #[test]
    fn test_short_text_single_frame() {
        let frames = split_into_frames(&ctx(), "b1", "hello", DEFAULT_CHUNK_BYTES, None);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["seq"], 1);
        assert_eq!(frames[0]["total"], 1);
        assert_eq!(frames[0]["text"], "hello");
    }

    #[test]
    fn test_every_frame_fits_budget() {
        let text = "x".repeat(6000);
        let frames = split_into_frames(&ctx(), "b1", &text, 1800, None);
        assert!(frames.len() > 1);
        for f in &frames {
            assert!(serde_json::to_vec(f).unwrap().len() <= 1800);
        }
    }

    #[test]
    fn test_roundtrip_6000_chars() {
        // Scenario 6: the receiver reassembles the identical string.
        let text: String = (0..6000).map(|i| ((b'a' + (i % 26) as u8) as char)).collect();
        let frames = split_into_frames(&ctx(), "batch", &text, 1800, None);
        assert!(frames.len() > 1);
        let mut inbox = Inbox::new();
        let mut assembled = None;
        for f in &frames {
            assembled = inbox.accept(
                "batch",
                f["seq"].as_u64().unwrap() as usize,
                f["total"].as_u64().unwrap() as usize,
                f["text"].as_str().unwrap().to_string(),
            );
        }
        assert_eq!(assembled.unwrap(), text);
    }

    #[test]
    fn test_missing_part_blocks_completion() {
        let text = "y".repeat(6000);
        let frames = split_into_frames(&ctx(), "b", &text, 1800, None);
        let total = frames.len();
        assert!(total >= 3);
        let mut inbox = Inbox::new();
        // Deliver everything except seq=2.
        for f in frames.iter().filter(|f| f["seq"] != 2) {
            let done = inbox.accept(
                "b",
                f["seq"].as_u64().unwrap() as usize,
                total,
                f["text"].as_str().unwrap().to_string(),
            );
            assert!(done.is_none());
        }
        // The missing frame completes the batch.
        let f = frames.iter().find(|f| f["seq"] == 2).unwrap();
        let done = inbox.accept("b", 2, total, f["text"].as_str().unwrap().to_string());
        assert_eq!(done.unwrap(), text);
    }

    #[test]
    fn test_permuted_delivery() {
        // P6: any permutation reassembles identically.
        let text = "z".repeat(4000);
        let frames = split_into_frames(&ctx(), "b", &text, 1800, None);
        let total = frames.len();
        let mut order: Vec<usize> = (0..total).collect();
        order.reverse();
        let mut inbox = Inbox::new();
        let mut assembled = None;
        for i in order {
            let f = &frames[i];
            assembled = inbox.accept(
                "b",
                f["seq"].as_u64().unwrap() as usize,
                total,
                f["text"].as_str().unwrap().to_string(),
            );
        }
        assert_eq!(assembled.unwrap(), text);
    }

    #[test]
    fn test_out_of_batch_frames_ignored() {
        let mut inbox = Inbox::new();
        assert!(inbox.accept("b", 0, 2, "bad".to_string()).is_none());
        assert!(inbox.accept("b", 3, 2, "bad".to_string()).is_none());
        assert_eq!(inbox.pending_batches(), 0);
    }

    #[test]
    fn test_multibyte_split_preserves_text() {
        let text = "héllo wörld 🌍 ".repeat(300);
        let frames = split_into_frames(&ctx(), "b", &text, 1800, None);
        let mut inbox = Inbox::new();
        let mut assembled = None;
        let total = frames.len();
        for f in &frames {
            assembled = inbox.accept(
                "b",
                f["seq"].as_u64().unwrap() as usize,
                total,
                f["text"].as_str().unwrap().to_string(),
            );
        }
        assert_eq!(assembled.unwrap(), text);
    }
}
