//! Live ASR session controller
//!
//! Drives a remote streaming recognition session from a microphone
//! feed: the VAD opens and closes the uplink, a pump loop paces PCM
//! frames to the server, and an event task ingests partial/detected/
//! final events, guarded against duplicates and hallucinated sign-offs.
//!
//! ```text
//! push_audio → VAD ─ silence→voice ─→ open session ──→ pump loop (PCM frames)
//!                │                          └─────────→ event stream (SSE)
//!                └─ voice→silence + tail ──→ drain and end
//! ```

use crate::asr::hallucination::{should_drop, FinalMetadata, GuardContext};
use crate::asr::vad::{Vad, VadConfig, VadTransition};
use crate::asr::wav::encode_wav_pcm16;
use crate::audio::{encode_pcm16, resample_linear, rms};
use crate::graph::log::NodeLog;
use crate::graph::router::Router;
use crate::graph::store::NodeRecord;
use crate::stream::{ReorderBuffer, SseParser};
use crate::transport::relay::StreamHandlers;
use crate::transport::{Route, TransportMux};
use crate::types::text_message;
use anyhow::{Context, Result};
use base64::Engine;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Max audio POSTs outstanding per session
pub const INFLIGHT_CAP: usize = 4;
/// Quiet window on posts and partials before the session may end
pub const LINGER_MS: u64 = 700;
/// Hard ceiling on waiting for quiescence
pub const FORCE_QUIET_MAX_MS: u64 = 2800;
/// Window in which an identical final is treated as a duplicate
pub const DEDUP_WINDOW_MS: u64 = 1500;
/// Timeout for the session-end request
const END_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for a single audio frame POST
const AUDIO_POST_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for the whole event stream
const EVENTS_TIMEOUT: Duration = Duration::from_secs(300);

/// ASR node configuration, decoded from the durable record.
#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub base: String,
    pub api_key: String,
    pub route: Route,
    /// Streaming session when true, one-shot WAV recognition when false
    pub live: bool,
    pub rate: u32,
    pub chunk_ms: u64,
    pub vad: VadConfig,
    pub pre_ms: u64,
    pub silence_ms: u64,
    pub min_tail_ms: u64,
    pub phrase_min: usize,
    pub phrase_stable_ms: u64,
    pub emit_partials: bool,
    pub mode: String,
    pub model: String,
    pub prompt: String,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            base: String::new(),
            api_key: String::new(),
            route: Route::default(),
            live: true,
            rate: 16_000,
            chunk_ms: 120,
            vad: VadConfig::default(),
            pre_ms: 450,
            silence_ms: 800,
            min_tail_ms: 300,
            phrase_min: 3,
            phrase_stable_ms: 350,
            emit_partials: true,
            mode: "auto".to_string(),
            model: String::new(),
            prompt: String::new(),
        }
    }
}

impl AsrConfig {
    pub fn from_record(rec: &NodeRecord) -> Self {
        let d = Self::default();
        Self {
            base: rec.str_field("base"),
            api_key: rec.str_field("apiKey"),
            route: Route {
                use_relay: rec.bool_field("useRelay", false),
                relay: rec.str_field("relay"),
            },
            live: rec.bool_field("live", d.live),
            rate: rec.u64_field("rate", d.rate as u64) as u32,
            chunk_ms: rec.u64_field("chunkMs", d.chunk_ms),
            vad: VadConfig {
                rms_threshold: rec.f64_field("rms", d.vad.rms_threshold as f64) as f32,
                ema_ms: rec.f64_field("emaMs", d.vad.ema_ms),
                hold_ms: rec.u64_field("holdMs", d.vad.hold_ms),
            },
            pre_ms: rec.u64_field("preMs", d.pre_ms),
            silence_ms: rec.u64_field("silenceMs", d.silence_ms),
            min_tail_ms: rec.u64_field("minTailMs", d.min_tail_ms),
            phrase_min: rec.u64_field("phraseMin", d.phrase_min as u64) as usize,
            phrase_stable_ms: rec.u64_field("phraseStableMs", d.phrase_stable_ms),
            emit_partials: rec.bool_field("emitPartials", d.emit_partials),
            mode: rec.str_field("mode"),
            model: rec.str_field("model"),
            prompt: rec.str_field("prompt"),
        }
    }

    fn api_key_opt(&self) -> Option<&str> {
        if self.api_key.trim().is_empty() {
            None
        } else {
            Some(self.api_key.as_str())
        }
    }

    fn tail(&self) -> Duration {
        Duration::from_millis(self.silence_ms.max(self.min_tail_ms))
    }
}

/// Accumulates partial-text growth into phrase candidates.
///
/// A phrase is released once it reaches `min_tokens` whitespace-split
/// tokens and either ends with sentence punctuation or has been stable
/// for the configured window.
pub struct PhraseDetector {
    min_tokens: usize,
    stable: Duration,
    last: String,
    pend: String,
    last_growth: Option<Instant>,
}

impl PhraseDetector {
    pub fn new(min_tokens: usize, stable_ms: u64) -> Self {
        Self {
            min_tokens,
            stable: Duration::from_millis(stable_ms),
            last: String::new(),
            pend: String::new(),
            last_growth: None,
        }
    }

    /// Feed the latest partial text. Returns a phrase when one completes.
    pub fn feed(&mut self, text: &str, now: Instant) -> Option<String> {
        if text == self.last {
            return None;
        }
        if !self.last.is_empty() && text.starts_with(self.last.as_str()) {
            self.pend.push_str(&text[self.last.len()..]);
        } else {
            // Rewritten partial: restart the accumulator.
            self.pend = text.to_string();
        }
        self.last = text.to_string();
        self.last_growth = Some(now);
        if self.token_count() >= self.min_tokens && self.ends_with_punct() {
            return self.take();
        }
        None
    }

    /// Stability check, called on the audio tick.
    pub fn tick(&mut self, now: Instant) -> Option<String> {
        if self.token_count() >= self.min_tokens {
            if let Some(at) = self.last_growth {
                if now.duration_since(at) >= self.stable {
                    return self.take();
                }
            }
        }
        None
    }

    /// Hand back whatever is pending (a final supersedes it).
    pub fn flush(&mut self) -> Option<String> {
        self.take()
    }

    pub fn reset(&mut self) {
        self.last.clear();
        self.pend.clear();
        self.last_growth = None;
    }

    fn token_count(&self) -> usize {
        self.pend.split_whitespace().count()
    }

    fn ends_with_punct(&self) -> bool {
        self.pend
            .trim_end()
            .chars()
            .last()
            .map(|c| matches!(c, '.' | '!' | '?' | ';' | ':' | ','))
            .unwrap_or(false)
    }

    fn take(&mut self) -> Option<String> {
        let phrase = self.pend.trim().to_string();
        self.pend.clear();
        self.last_growth = None;
        if phrase.is_empty() {
            None
        } else {
            Some(phrase)
        }
    }
}

/// Pull the text payload out of a recognition event.
fn event_text(event: &Value) -> Option<String> {
    ["text", "partial", "transcript"]
        .iter()
        .find_map(|k| event.get(*k).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
}

/// Work items produced under the state lock, executed outside it.
enum Action {
    OpenSession,
    Finalize(String),
    Batch(Vec<f32>),
    Phrase(String),
}

struct SessionState {
    vad: Vad,
    pre_roll: VecDeque<f32>,
    uplink: VecDeque<f32>,
    uplink_open: bool,
    finalizing: bool,
    session_running: bool,
    sid: Option<String>,
    tail_deadline: Option<Instant>,
    last_post_at: Option<Instant>,
    last_partial_at: Option<Instant>,
    speech_seen: bool,
    last_partial_text: String,
    phrase: PhraseDetector,
    last_final: Option<(String, Instant)>,
    finals: Vec<String>,
    batch: Vec<f32>,
    voice_ended_at: Option<Instant>,
}

pub(crate) struct AsrInner {
    node_id: String,
    cfg: AsrConfig,
    mux: Arc<TransportMux>,
    router: Arc<Router>,
    log: Arc<NodeLog>,
    active: AtomicBool,
    /// Bumped on session reset; stale tasks observe and exit
    epoch: AtomicU64,
    inflight: AtomicUsize,
    state: Mutex<SessionState>,
}

/// Handle to one ASR node's controller.
#[derive(Clone)]
pub struct AsrController {
    inner: Arc<AsrInner>,
}

impl AsrController {
    pub fn new(
        node_id: impl Into<String>,
        cfg: AsrConfig,
        mux: Arc<TransportMux>,
        router: Arc<Router>,
    ) -> Self {
        let vad = Vad::new(cfg.vad);
        let phrase = PhraseDetector::new(cfg.phrase_min, cfg.phrase_stable_ms);
        Self {
            inner: Arc::new(AsrInner {
                node_id: node_id.into(),
                cfg,
                mux,
                router,
                log: Arc::new(NodeLog::new()),
                active: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                inflight: AtomicUsize::new(0),
                state: Mutex::new(SessionState {
                    vad,
                    pre_roll: VecDeque::new(),
                    uplink: VecDeque::new(),
                    uplink_open: false,
                    finalizing: false,
                    session_running: false,
                    sid: None,
                    tail_deadline: None,
                    last_post_at: None,
                    last_partial_at: None,
                    speech_seen: false,
                    last_partial_text: String::new(),
                    phrase,
                    last_final: None,
                    finals: Vec::new(),
                    batch: Vec::new(),
                    voice_ended_at: None,
                }),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn log(&self) -> Arc<NodeLog> {
        Arc::clone(&self.inner.log)
    }

    /// Begin accepting audio.
    pub fn activate(&self) {
        self.inner.active.store(true, Ordering::SeqCst);
        self.inner.log.info("Capture started");
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Stop capture; an open session drains and ends cleanly.
    pub fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.log.info("Capture stopped");
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let finalize = {
            let mut st = self.inner.state.lock().unwrap();
            st.uplink_open = false;
            if st.session_running && !st.finalizing {
                if let Some(sid) = st.sid.clone() {
                    st.finalizing = true;
                    Some(sid)
                } else {
                    None
                }
            } else {
                None
            }
        };
        match finalize {
            Some(sid) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { inner.drain_and_end(epoch, sid).await });
            }
            None => self.inner.reset_session(),
        }
    }

    /// Feed captured mono audio at the stated source rate.
    pub fn push_audio(&self, samples: &[f32], source_rate: u32) {
        if !self.inner.active.load(Ordering::SeqCst) {
            return;
        }
        let actions = self.inner.ingest(samples, source_rate);
        for action in actions {
            match action {
                Action::OpenSession => {
                    let inner = Arc::clone(&self.inner);
                    let epoch = self.inner.epoch.load(Ordering::SeqCst);
                    tokio::spawn(async move { inner.run_session(epoch).await });
                }
                Action::Finalize(sid) => {
                    let inner = Arc::clone(&self.inner);
                    let epoch = self.inner.epoch.load(Ordering::SeqCst);
                    tokio::spawn(async move { inner.drain_and_end(epoch, sid).await });
                }
                Action::Batch(buffer) => {
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move { inner.recognize_batch(buffer).await });
                }
                Action::Phrase(text) => self.inner.route("phrase", &text),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<AsrInner> {
        &self.inner
    }
}

impl AsrInner {
    /// VAD tick + buffer management. Returns follow-up work to run
    /// outside the state lock.
    fn ingest(&self, samples: &[f32], source_rate: u32) -> Vec<Action> {
        let samples = resample_linear(samples, source_rate, self.cfg.rate);
        if samples.is_empty() {
            return Vec::new();
        }
        let level = rms(&samples);
        let dt = Duration::from_secs_f64(samples.len() as f64 / self.cfg.rate as f64);
        let now = Instant::now();
        let mut actions = Vec::new();
        let pre_cap = (self.cfg.rate as u64 * self.cfg.pre_ms / 1000) as usize;

        let mut st = self.state.lock().unwrap();
        let transition = st.vad.tick(level, dt, now);
        match transition {
            VadTransition::SpeechStart => {
                debug!("VAD: speech start (node {})", self.node_id);
                st.voice_ended_at = None;
                let pre: Vec<f32> = st.pre_roll.drain(..).collect();
                if self.cfg.live {
                    st.uplink.extend(pre);
                    st.uplink.extend(samples.iter().copied());
                    st.uplink_open = true;
                    st.tail_deadline = Some(now + self.cfg.tail());
                } else {
                    st.batch.extend(pre);
                    st.batch.extend(samples.iter().copied());
                }
            }
            VadTransition::SpeechEnd => {
                debug!("VAD: speech end (node {})", self.node_id);
                st.voice_ended_at = Some(now);
                if self.cfg.live {
                    if st.uplink_open {
                        st.uplink.extend(samples.iter().copied());
                    }
                } else {
                    st.batch.extend(samples.iter().copied());
                }
            }
            VadTransition::None => match st.vad.state() {
                crate::asr::vad::VadState::Voice => {
                    if self.cfg.live {
                        st.uplink.extend(samples.iter().copied());
                        st.uplink_open = true;
                        if st.vad.above_off() {
                            st.tail_deadline = Some(now + self.cfg.tail());
                        }
                    } else {
                        st.batch.extend(samples.iter().copied());
                    }
                }
                crate::asr::vad::VadState::Silence => {
                    if self.cfg.live && st.uplink_open {
                        // Tail audio still rides the uplink.
                        st.uplink.extend(samples.iter().copied());
                        if st.tail_deadline.map(|d| now > d).unwrap_or(false) {
                            st.uplink_open = false;
                            if st.session_running && !st.finalizing {
                                if let Some(sid) = st.sid.clone() {
                                    st.finalizing = true;
                                    actions.push(Action::Finalize(sid));
                                }
                            }
                        }
                    } else {
                        st.pre_roll.extend(samples.iter().copied());
                        while st.pre_roll.len() > pre_cap {
                            st.pre_roll.pop_front();
                        }
                        if !self.cfg.live && !st.batch.is_empty() {
                            let quiet = st
                                .voice_ended_at
                                .map(|t| now.duration_since(t).as_millis() as u64)
                                .unwrap_or(0);
                            if quiet >= self.cfg.silence_ms {
                                actions.push(Action::Batch(std::mem::take(&mut st.batch)));
                                st.voice_ended_at = None;
                            }
                        }
                    }
                }
            },
        }

        // Live session creation is lazy: first voiced audio opens it.
        if self.cfg.live && st.uplink_open && !st.session_running && !st.finalizing {
            st.session_running = true;
            actions.push(Action::OpenSession);
        }

        if let Some(phrase) = st.phrase.tick(now) {
            actions.push(Action::Phrase(phrase));
        }
        actions
    }

    async fn run_session(self: Arc<Self>, epoch: u64) {
        match self.open_session().await {
            Ok(sid) => {
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    debug!("Session {} opened after reset, abandoning", sid);
                    return;
                }
                info!("ASR session {} open (node {})", sid, self.node_id);
                self.log.info(format!("Session {} open", sid));
                self.state.lock().unwrap().sid = Some(sid.clone());
                let pump = Arc::clone(&self);
                let pump_sid = sid.clone();
                tokio::spawn(async move { pump.pump_loop(epoch, pump_sid).await });
                let events = Arc::clone(&self);
                tokio::spawn(async move { events.events_loop(epoch, sid).await });
            }
            Err(e) => {
                warn!("Failed to open ASR session: {:#}", e);
                self.log.error(format!("Session open failed: {}", e));
                let mut st = self.state.lock().unwrap();
                st.session_running = false;
                st.uplink_open = false;
                st.uplink.clear();
            }
        }
    }

    async fn open_session(&self) -> Result<String> {
        let mut body = json!({
            "mode": if self.cfg.mode.is_empty() { "auto" } else { self.cfg.mode.as_str() },
            "temperature": 0.0,
            "condition_on_previous_text": false,
            "no_speech_threshold": 0.6,
            "logprob_threshold": -1.0,
        });
        if !self.cfg.prompt.trim().is_empty() {
            body["prompt"] = json!(self.cfg.prompt);
        }
        if !self.cfg.model.trim().is_empty() {
            body["model"] = json!(self.cfg.model);
        }
        let resp = self
            .mux
            .post_json(
                &self.cfg.base,
                "/recognize/stream/start",
                body,
                self.cfg.api_key_opt(),
                &self.cfg.route,
                Duration::from_secs(15),
            )
            .await?;
        ["sid", "id", "session"]
            .iter()
            .find_map(|k| resp.get(*k).and_then(|v| v.as_str()))
            .map(|s| s.to_string())
            .context("Session start response had no sid")
    }

    /// Pace PCM16LE frames to the server, capped at four outstanding
    /// requests.
    async fn pump_loop(self: Arc<Self>, epoch: u64, sid: String) {
        let chunk_samples = (self.cfg.rate as u64 * self.cfg.chunk_ms / 1000) as usize;
        let pause = Duration::from_millis((self.cfg.chunk_ms / 2).max(10));
        let url = format!(
            "{}/recognize/stream/{}/audio?format=pcm16&sr={}",
            self.cfg.base.trim_end_matches('/'),
            sid,
            self.cfg.rate
        );
        loop {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                break;
            }
            let frame: Option<Vec<f32>> = {
                let mut st = self.state.lock().unwrap();
                if self.inflight.load(Ordering::SeqCst) >= INFLIGHT_CAP {
                    None
                } else if st.uplink.len() >= chunk_samples {
                    Some(st.uplink.drain(..chunk_samples).collect())
                } else if !st.uplink_open && !st.uplink.is_empty() {
                    Some(st.uplink.drain(..).collect())
                } else {
                    None
                }
            };
            if let Some(frame) = frame {
                let bytes = encode_pcm16(&frame);
                self.inflight.fetch_add(1, Ordering::SeqCst);
                let this = Arc::clone(&self);
                let url = url.clone();
                tokio::spawn(async move {
                    let result = this
                        .mux
                        .post_bytes(
                            &url,
                            bytes,
                            "application/octet-stream",
                            this.cfg.api_key_opt(),
                            &this.cfg.route,
                            AUDIO_POST_TIMEOUT,
                        )
                        .await;
                    this.inflight.fetch_sub(1, Ordering::SeqCst);
                    this.state.lock().unwrap().last_post_at = Some(Instant::now());
                    if let Err(e) = result {
                        warn!("Audio frame post failed: {:#}", e);
                        this.log.warn(format!("Frame post failed: {}", e));
                    }
                });
            }
            tokio::time::sleep(pause).await;
        }
        debug!("Pump loop for session {} exited", sid);
    }

    /// Subscribe to the session's event stream and ingest events.
    async fn events_loop(self: Arc<Self>, epoch: u64, sid: String) {
        let url = format!(
            "{}/recognize/stream/{}/events",
            self.cfg.base.trim_end_matches('/'),
            sid
        );
        let chunk_this = Arc::clone(&self);
        let chunk_sid = sid.clone();
        let reorder = Mutex::new(ReorderBuffer::<Vec<u8>>::new());
        let sse = Mutex::new(SseParser::new());
        let line_this = Arc::clone(&self);
        let line_sid = sid.clone();
        let line_reorder = Mutex::new(ReorderBuffer::<String>::new());
        let handlers = StreamHandlers::new()
            .chunks(move |bytes, seq| {
                let ready = reorder.lock().unwrap().push(seq, bytes.to_vec());
                for chunk in ready {
                    let events = sse.lock().unwrap().push(&chunk);
                    for event in events {
                        chunk_this.handle_event(epoch, &chunk_sid, event);
                    }
                }
            })
            .lines(move |frames| {
                let mut buf = line_reorder.lock().unwrap();
                for frame in frames {
                    for line in buf.push(frame.seq, frame.line) {
                        if let Ok(event) = serde_json::from_str::<Value>(&line) {
                            line_this.handle_event(epoch, &line_sid, event);
                        }
                    }
                }
            });
        let result = self
            .mux
            .get_stream(
                &url,
                self.cfg.api_key_opt(),
                &self.cfg.route,
                handlers,
                EVENTS_TIMEOUT,
            )
            .await;
        if let Err(e) = result {
            if self.epoch.load(Ordering::SeqCst) == epoch {
                warn!("Event stream for {} failed: {:#}", sid, e);
                self.log.warn(format!("Event stream failed: {}", e));
            }
        }
    }

    fn handle_event(&self, epoch: u64, sid: &str, event: Value) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        // Only the current session's events are honored.
        if let Some(event_sid) = event.get("sid").and_then(|v| v.as_str()) {
            if event_sid != sid {
                return;
            }
        }
        let etype = event
            .get("type")
            .or_else(|| event.get("event"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_lowercase();
        match etype.rsplit('.').next().unwrap_or("") {
            "partial" => self.on_partial(&event),
            "detected" => self.on_detected(&event),
            "final" => self.on_final(&event),
            other => debug!("Ignoring event type {:?}", other),
        }
    }

    fn on_partial(&self, event: &Value) {
        let text = match event_text(event) {
            Some(t) => t,
            None => return,
        };
        let phrase = {
            let mut st = self.state.lock().unwrap();
            if st.finalizing || !st.uplink_open || st.vad.is_silent() || !self.cfg.emit_partials {
                return;
            }
            let now = Instant::now();
            st.speech_seen = true;
            st.last_partial_at = Some(now);
            let phrase = st.phrase.feed(&text, now);
            st.last_partial_text = text.clone();
            phrase
        };
        self.route("partial", &text);
        if let Some(p) = phrase {
            self.route("phrase", &p);
        }
    }

    fn on_detected(&self, event: &Value) {
        let text = match event_text(event) {
            Some(t) => t,
            None => return,
        };
        if self.is_hallucination(&text, event) {
            self.log.info(format!("Dropped hallucinated phrase: {:?}", text));
            return;
        }
        self.route("phrase", &text);
    }

    fn on_final(&self, event: &Value) {
        let text = match event_text(event) {
            Some(t) => t,
            None => return,
        };
        self.emit_final(&text, FinalMetadata::from_event(event));
    }

    fn is_hallucination(&self, text: &str, event: &Value) -> bool {
        let st = self.state.lock().unwrap();
        let ctx = GuardContext {
            speech_seen: st.speech_seen,
            vad_silent: st.vad.is_silent(),
            metadata: FinalMetadata::from_event(event),
        };
        should_drop(text, &ctx)
    }

    /// Shared final path: hallucination guard, dedup window, routing.
    fn emit_final(&self, text: &str, metadata: FinalMetadata) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let flushed = {
            let mut st = self.state.lock().unwrap();
            let ctx = GuardContext {
                speech_seen: st.speech_seen,
                vad_silent: st.vad.is_silent(),
                metadata,
            };
            if should_drop(text, &ctx) {
                self.log.info(format!("Dropped hallucinated final: {:?}", text));
                return;
            }
            let now = Instant::now();
            if let Some((prev, at)) = &st.last_final {
                if prev == text
                    && now.duration_since(*at) < Duration::from_millis(DEDUP_WINDOW_MS)
                {
                    debug!("Duplicate final within window, dropped: {:?}", text);
                    return;
                }
            }
            st.last_final = Some((text.to_string(), now));
            st.finals.push(text.to_string());
            st.last_partial_text.clear();
            st.phrase.flush()
        };
        self.route("final", text);
        if let Some(p) = flushed {
            self.route("phrase", &p);
        }
    }

    /// Await quiescence, end the server session, emit leftover text.
    async fn drain_and_end(self: Arc<Self>, epoch: u64, sid: String) {
        let started = Instant::now();
        loop {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let quiet = {
                let st = self.state.lock().unwrap();
                let idle = self.inflight.load(Ordering::SeqCst) == 0 && st.uplink.is_empty();
                let linger = Duration::from_millis(LINGER_MS);
                let posts_quiet = st
                    .last_post_at
                    .map(|t| t.elapsed() >= linger)
                    .unwrap_or(true);
                let partials_quiet = st
                    .last_partial_at
                    .map(|t| t.elapsed() >= linger)
                    .unwrap_or(true);
                idle && (posts_quiet && partials_quiet
                    || started.elapsed() >= Duration::from_millis(FORCE_QUIET_MAX_MS))
            };
            if quiet {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let path = format!("/recognize/stream/{}/end", sid);
        let result = self
            .mux
            .post_json(
                &self.cfg.base,
                &path,
                json!({}),
                self.cfg.api_key_opt(),
                &self.cfg.route,
                END_TIMEOUT,
            )
            .await;
        if let Err(e) = result {
            warn!("Session end failed for {}: {:#}", sid, e);
            self.log.error(format!("Session end failed: {}", e));
        } else {
            info!("ASR session {} ended", sid);
        }
        let leftover = {
            let mut st = self.state.lock().unwrap();
            let text = st.last_partial_text.trim().to_string();
            st.last_partial_text.clear();
            if text.is_empty() || st.finals.iter().any(|f| f == &text) {
                None
            } else {
                Some(text)
            }
        };
        if let Some(text) = leftover {
            self.emit_final(&text, FinalMetadata::default());
        }
        self.reset_session();
    }

    /// One-shot recognition of a whole buffered utterance.
    async fn recognize_batch(self: Arc<Self>, buffer: Vec<f32>) {
        let wav = match encode_wav_pcm16(&buffer, self.cfg.rate) {
            Ok(w) => w,
            Err(e) => {
                warn!("WAV encode failed: {:#}", e);
                self.log.error(format!("WAV encode failed: {}", e));
                return;
            }
        };
        let mut body = json!({
            "audio_b64": base64::engine::general_purpose::STANDARD.encode(&wav),
            "format": "wav",
            "rate": self.cfg.rate,
        });
        if !self.cfg.model.trim().is_empty() {
            body["model"] = json!(self.cfg.model);
        }
        let result = self
            .mux
            .post_json(
                &self.cfg.base,
                "/recognize",
                body,
                self.cfg.api_key_opt(),
                &self.cfg.route,
                Duration::from_secs(45),
            )
            .await;
        match result {
            Ok(resp) => {
                let text = resp
                    .get("text")
                    .or_else(|| resp.get("transcript"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                if !text.trim().is_empty() {
                    self.emit_final(&text, FinalMetadata::default());
                }
            }
            Err(e) => {
                warn!("Batch recognition failed: {:#}", e);
                self.log.error(format!("Recognition failed: {}", e));
            }
        }
    }

    fn route(&self, port: &str, text: &str) {
        self.router
            .send_from(&self.node_id, port, &text_message(&self.node_id, text));
    }

    fn reset_session(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock().unwrap();
        st.sid = None;
        st.session_running = false;
        st.uplink_open = false;
        st.finalizing = false;
        st.uplink.clear();
        st.speech_seen = false;
        st.last_partial_text.clear();
        st.last_partial_at = None;
        st.last_post_at = None;
        st.tail_deadline = None;
        st.finals.clear();
        st.phrase.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::kv::MemoryKv;
    use crate::graph::store::{NodeStore, default_config};
    use crate::transport::relay::RelayFactory;
    use crate::types::{NodeKind, PortAddress};
    use std::sync::atomic::AtomicUsize;

    fn controller() -> (AsrController, Arc<Router>) {
        let kv = Arc::new(MemoryKv::new());
        let factory: RelayFactory = Arc::new(|_| anyhow::bail!("no relay in tests"));
        let mux = TransportMux::new(kv, factory);
        let router = Arc::new(Router::new());
        let ctl = AsrController::new("asr1", AsrConfig::default(), mux, Arc::clone(&router));
        (ctl, router)
    }

    #[test]
    fn test_phrase_detector_punct_release() {
        let mut det = PhraseDetector::new(3, 350);
        let t0 = Instant::now();
        assert!(det.feed("hello", t0).is_none());
        assert!(det.feed("hello there", t0).is_none());
        let got = det.feed("hello there friend,", t0);
        assert_eq!(got.unwrap(), "hello there friend,");
    }

    #[test]
    fn test_phrase_detector_stability_release() {
        let mut det = PhraseDetector::new(3, 350);
        let t0 = Instant::now();
        det.feed("one two three", t0);
        assert!(det.tick(t0 + Duration::from_millis(100)).is_none());
        let got = det.tick(t0 + Duration::from_millis(400));
        assert_eq!(got.unwrap(), "one two three");
    }

    #[test]
    fn test_phrase_detector_rewrite_resets() {
        let mut det = PhraseDetector::new(3, 350);
        let t0 = Instant::now();
        det.feed("alpha beta", t0);
        det.feed("completely different text", t0);
        let got = det.tick(t0 + Duration::from_millis(400));
        assert_eq!(got.unwrap(), "completely different text");
    }

    #[test]
    fn test_final_dedup_window() {
        // Scenario 5: identical finals 800 ms apart → one routed;
        // 2000 ms apart → both routed.
        let (ctl, router) = controller();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            router.register(PortAddress::input("sink", "t"), move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        router
            .add_wire(
                PortAddress::output("asr1", "final"),
                PortAddress::input("sink", "t"),
            )
            .unwrap();

        let inner = ctl.inner();
        inner.emit_final("Hello there", FinalMetadata::default());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Within the window: dropped.
        inner.emit_final("Hello there", FinalMetadata::default());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Simulate 2 s elapsed by backdating the recorded final.
        {
            let mut st = inner.state.lock().unwrap();
            let (text, _) = st.last_final.take().unwrap();
            st.last_final = Some((text, Instant::now() - Duration::from_millis(2000)));
        }
        inner.emit_final("Hello there", FinalMetadata::default());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hallucinated_final_dropped_before_speech() {
        let (ctl, router) = controller();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            router.register(PortAddress::input("sink", "t"), move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        router
            .add_wire(
                PortAddress::output("asr1", "final"),
                PortAddress::input("sink", "t"),
            )
            .unwrap();
        // No speech seen, VAD silent: classic hallucination conditions.
        ctl.inner().emit_final("Thanks for watching!", FinalMetadata::default());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        ctl.inner().emit_final("Turn on the lights", FinalMetadata::default());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_partial_dropped_when_uplink_closed() {
        let (ctl, router) = controller();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            router.register(PortAddress::input("sink", "t"), move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        router
            .add_wire(
                PortAddress::output("asr1", "partial"),
                PortAddress::input("sink", "t"),
            )
            .unwrap();
        // uplink_open is false by default: partial must be suppressed.
        ctl.inner()
            .on_partial(&json!({"type": "partial", "text": "hi"}));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_event_sid_mismatch_ignored() {
        let (ctl, router) = controller();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            router.register(PortAddress::input("sink", "t"), move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        router
            .add_wire(
                PortAddress::output("asr1", "final"),
                PortAddress::input("sink", "t"),
            )
            .unwrap();
        let epoch = ctl.inner().epoch.load(Ordering::SeqCst);
        ctl.inner().handle_event(
            epoch,
            "session-a",
            json!({"type": "asr.final", "sid": "session-b", "text": "stale"}),
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_config_from_record_defaults() {
        let store = NodeStore::new(Arc::new(MemoryKv::new()));
        let rec = store.ensure("a", NodeKind::Asr);
        let cfg = AsrConfig::from_record(&rec);
        assert_eq!(cfg.rate, 16_000);
        assert_eq!(cfg.chunk_ms, 120);
        assert!(cfg.live);
        assert_eq!(cfg.phrase_min, 3);
        // The typed defaults cover every knob the controller reads.
        let defaults = default_config(NodeKind::Asr);
        for key in ["rate", "chunkMs", "holdMs", "preMs", "silenceMs", "phraseMin"] {
            assert!(defaults.contains_key(key), "missing default {}", key);
        }
    }
}
