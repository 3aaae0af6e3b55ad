//! Sentence-aware token mux
//!
//! Converts a raw stream of token deltas into a sequence of complete
//! sentences suitable for speech synthesis. The last sentence candidate
//! is held back until either more input proves it complete or a
//! stability timer expires.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

/// Default stability window before a held-back sentence is released
pub const DEFAULT_STABLE_MS: u64 = 250;

type Emit = Arc<dyn Fn(&str) + Send + Sync>;

/// A sentence boundary is one of:
/// - sentence punctuation, optional closing brackets/quotes, then whitespace
/// - a paragraph break (blank line, or newline followed by a list bullet)
/// - a run of presentation-style emoji followed by whitespace
static BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?s)^(?P<head>.*?)(?:",
        r#"(?P<punct>[.!?;:][\)\]\}"'»”’]*)(?P<pws>\s+)"#,
        r"|(?P<para>\n[ \t]*\n)",
        r"|\n[ \t]*(?P<bullet>[-*•])",
        r"|(?P<emoji>\p{Emoji_Presentation}+)\s+",
        r")",
    ))
    .expect("sentence boundary pattern")
});

struct MuxInner {
    /// Unbroken text not yet part of any sentence
    carry: String,
    /// Last produced sentence, awaiting stability
    pending: Option<String>,
    /// Invalidates stale stability timers
    timer_gen: u64,
}

/// Splits a stream of token deltas into complete sentences.
///
/// `emit` receives each completed sentence exactly once, in order.
/// Requires a tokio runtime for the stability timer; without one,
/// held sentences are released by further input or [`flush`](Self::flush).
pub struct SentenceMux {
    stable: Duration,
    emit: Emit,
    inner: Arc<Mutex<MuxInner>>,
}

impl SentenceMux {
    pub fn new(emit: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self::with_stable_ms(DEFAULT_STABLE_MS, emit)
    }

    pub fn with_stable_ms(stable_ms: u64, emit: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            stable: Duration::from_millis(stable_ms),
            emit: Arc::new(emit),
            inner: Arc::new(Mutex::new(MuxInner {
                carry: String::new(),
                pending: None,
                timer_gen: 0,
            })),
        }
    }

    /// Feed a token delta into the mux.
    pub fn push(&self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        let mut to_emit: Vec<String> = Vec::new();
        let mut arm: Option<u64> = None;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.carry.push_str(delta);
            let mut produced = drain_sentences(&mut inner.carry);
            if !produced.is_empty() {
                if let Some(prev) = inner.pending.take() {
                    to_emit.push(prev);
                }
                let last = produced.pop().unwrap();
                to_emit.extend(produced);
                inner.pending = Some(last);
                inner.timer_gen += 1;
                arm = Some(inner.timer_gen);
            } else if inner.pending.is_some() && !inner.carry.trim().is_empty() {
                // Continuation arrived: the held sentence is final as-is.
                inner.timer_gen += 1;
                to_emit.push(inner.pending.take().unwrap());
            } else if inner.pending.is_some() {
                inner.timer_gen += 1;
                arm = Some(inner.timer_gen);
            }
        }
        for s in &to_emit {
            trace!("sentence: {:?}", s);
            (self.emit)(s);
        }
        if let Some(gen) = arm {
            self.arm_timer(gen);
        }
    }

    /// Release the held sentence and any carry residue, then reset.
    pub fn flush(&self) {
        let (pending, residue) = {
            let mut inner = self.inner.lock().unwrap();
            inner.timer_gen += 1;
            let pending = inner.pending.take();
            let residue = inner.carry.trim().to_string();
            inner.carry.clear();
            (pending, residue)
        };
        if let Some(s) = pending {
            (self.emit)(&s);
        }
        if !residue.is_empty() {
            (self.emit)(&residue);
        }
    }

    fn arm_timer(&self, gen: u64) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => return,
        };
        let inner = Arc::clone(&self.inner);
        let emit = Arc::clone(&self.emit);
        let stable = self.stable;
        handle.spawn(async move {
            tokio::time::sleep(stable).await;
            let fired = {
                let mut guard = inner.lock().unwrap();
                if guard.timer_gen == gen {
                    guard.pending.take()
                } else {
                    None
                }
            };
            if let Some(s) = fired {
                emit(&s);
            }
        });
    }
}

/// Pull every complete sentence off the front of `carry`.
fn drain_sentences(carry: &mut String) -> Vec<String> {
    let mut produced = Vec::new();
    loop {
        let caps = match BOUNDARY.captures(carry) {
            Some(c) => c,
            None => break,
        };
        let whole_end = caps.get(0).unwrap().end();
        let head = caps.name("head").map(|m| m.as_str()).unwrap_or("");
        let (sentence, advance) = if let Some(p) = caps.name("punct") {
            (format!("{}{}", head, p.as_str()), whole_end)
        } else if caps.name("para").is_some() {
            (head.to_string(), whole_end)
        } else if let Some(b) = caps.name("bullet") {
            // Keep the bullet: it opens the next item.
            (head.to_string(), b.start())
        } else if let Some(e) = caps.name("emoji") {
            (format!("{}{}", head, e.as_str()), whole_end)
        } else {
            break;
        };
        let s = sentence.trim();
        if !s.is_empty() {
            produced.push(s.to_string());
        }
        carry.replace_range(..advance, "");
    }
    produced
}
