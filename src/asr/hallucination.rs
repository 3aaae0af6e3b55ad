//! Hallucination guard for recognition finals
//!
//! Streaming recognizers trained on broadcast data emit generic
//! sign-offs over silence. A final is dropped only when the sign-off
//! pattern matches AND the utterance is short AND a corroborating
//! condition holds (no speech yet, VAD silent, or low-confidence
//! metadata from the server).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Word-count ceiling for a drop candidate
pub const MAX_SIGNOFF_WORDS: usize = 7;

static SIGNOFF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(thanks?\s+(?:you\s+)?for\s+watching|thank\s+you\s+for\s+watching|like\s+and\s+subscribe|don'?t\s+forget\s+to\s+subscribe|subscribe\s+to\s+(?:my|the|our)\s+channel|link\s+in\s+the\s+description|see\s+you\s+in\s+the\s+next\s+(?:video|one)|thanks?\s+for\s+listening)\b",
    )
    .expect("sign-off pattern")
});

/// Server-side confidence metadata attached to a final event.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinalMetadata {
    pub no_speech_prob: Option<f64>,
    pub avg_logprob: Option<f64>,
    pub compression_ratio: Option<f64>,
}

impl FinalMetadata {
    pub fn from_event(event: &Value) -> Self {
        let root = event.get("metadata").unwrap_or(event);
        Self {
            no_speech_prob: root.get("no_speech_prob").and_then(|v| v.as_f64()),
            avg_logprob: root.get("avg_logprob").and_then(|v| v.as_f64()),
            compression_ratio: root.get("compression_ratio").and_then(|v| v.as_f64()),
        }
    }

    /// Server believes this segment is probably not speech.
    pub fn low_confidence(&self) -> bool {
        self.no_speech_prob.map(|p| p > 0.6).unwrap_or(false)
            || self.avg_logprob.map(|p| p < -1.0).unwrap_or(false)
            || self.compression_ratio.map(|r| r > 2.4).unwrap_or(false)
    }
}

/// Session context consulted when a sign-off pattern matches.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext {
    /// Any partial has been observed this session
    pub speech_seen: bool,
    /// VAD is currently in silence
    pub vad_silent: bool,
    pub metadata: FinalMetadata,
}

/// True if `text` looks like a broadcast sign-off.
pub fn matches_signoff(text: &str) -> bool {
    SIGNOFF.is_match(text)
}

/// Decide whether to drop a final as a hallucination.
pub fn should_drop(text: &str, ctx: &GuardContext) -> bool {
    if !matches_signoff(text) {
        return false;
    }
    if text.split_whitespace().count() > MAX_SIGNOFF_WORDS {
        return false;
    }
    !ctx.speech_seen || ctx.vad_silent || ctx.metadata.low_confidence()
}
