//! TTS controller: serialized speech requests into a contiguous stream
//!
//! Each TTS node owns a FIFO task queue; text requests synthesize and
//! play to completion in arrival order, and a failing request yields to
//! the next. Stream mode decodes raw PCM16 at the service rate into the
//! node's audio sink; file mode fetches an encoded blob and hands it to
//! the attached player.

pub mod sanitize;

pub use sanitize::sanitize;

use crate::audio::{resample_linear, AudioSink, Blob, BlobPlayer, Pcm16Decoder, TTS_STREAM_RATE};
use crate::graph::log::NodeLog;
use crate::graph::router::Router;
use crate::graph::store::NodeRecord;
use crate::stream::ReorderBuffer;
use crate::transport::relay::StreamHandlers;
use crate::transport::{join_url, Route, TransportMux, DEFAULT_STREAM_TIMEOUT};
use crate::types::PortAddress;
use anyhow::{bail, Context, Result};
use base64::Engine;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Silence preroll enqueued before each utterance (~40 ms)
const PREROLL_MS: u64 = 40;
/// Silence spacer enqueued after each utterance (~30 ms)
const SPACER_MS: u64 = 30;

/// TTS node configuration, decoded from the durable record.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub base: String,
    pub api_key: String,
    pub route: Route,
    /// `stream` (raw PCM) or `file` (encoded blob)
    pub mode: String,
    pub model: String,
    pub voice: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base: String::new(),
            api_key: String::new(),
            route: Route::default(),
            mode: "stream".to_string(),
            model: String::new(),
            voice: String::new(),
        }
    }
}

impl TtsConfig {
    pub fn from_record(rec: &NodeRecord) -> Self {
        let mode = rec.str_field("mode");
        Self {
            base: rec.str_field("base"),
            api_key: rec.str_field("apiKey"),
            route: Route {
                use_relay: rec.bool_field("useRelay", false),
                relay: rec.str_field("relay"),
            },
            mode: if mode.is_empty() {
                "stream".to_string()
            } else {
                mode
            },
            model: rec.str_field("model"),
            voice: rec.str_field("voice"),
        }
    }

    fn api_key_opt(&self) -> Option<&str> {
        if self.api_key.trim().is_empty() {
            None
        } else {
            Some(self.api_key.as_str())
        }
    }
}

struct TtsInner {
    node_id: String,
    cfg: Mutex<TtsConfig>,
    mux: Arc<TransportMux>,
    router: Arc<Router>,
    log: Arc<NodeLog>,
    sink: Arc<dyn AudioSink>,
    player: Option<Arc<dyn BlobPlayer>>,
    queue: mpsc::UnboundedSender<String>,
}

/// Handle to one TTS node's controller.
#[derive(Clone)]
pub struct TtsController {
    inner: Arc<TtsInner>,
}

impl TtsController {
    pub fn new(
        node_id: impl Into<String>,
        cfg: TtsConfig,
        mux: Arc<TransportMux>,
        router: Arc<Router>,
        sink: Arc<dyn AudioSink>,
        player: Option<Arc<dyn BlobPlayer>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(TtsInner {
            node_id: node_id.into(),
            cfg: Mutex::new(cfg),
            mux,
            router,
            log: Arc::new(NodeLog::new()),
            sink,
            player,
            queue: tx,
        });
        let worker = Arc::clone(&inner);
        tokio::spawn(async move { worker.run_queue(rx).await });
        Self { inner }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn log(&self) -> Arc<NodeLog> {
        Arc::clone(&self.inner.log)
    }

    /// Register the `text` input handler.
    pub fn attach(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.router.register(
            PortAddress::input(self.inner.node_id.clone(), "text"),
            move |payload| {
                let text = crate::types::normalize_payload(payload).text;
                inner.enqueue_text(text);
            },
        );
    }

    /// Queue a speech request directly.
    pub fn speak(&self, text: impl Into<String>) {
        self.inner.enqueue_text(text.into());
    }

    /// Enumerate available voices/models.
    pub async fn list_models(&self) -> Result<Value> {
        let cfg = self.inner.cfg.lock().unwrap().clone();
        self.inner
            .mux
            .get_json(&cfg.base, "/models", cfg.api_key_opt(), &cfg.route)
            .await
    }
}

impl TtsInner {
    fn enqueue_text(&self, text: String) {
        if self.queue.send(text).is_err() {
            warn!("TTS queue for {} is gone", self.node_id);
        }
    }

    /// FIFO worker: one utterance at a time, failures yield to the next.
    async fn run_queue(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = rx.recv().await {
            if let Err(e) = self.speak_one(&text).await {
                warn!("Speech task failed: {:#}", e);
                self.log.error(format!("Speech failed: {}", e));
            }
        }
        debug!("TTS queue for {} closed", self.node_id);
    }

    async fn speak_one(&self, text: &str) -> Result<()> {
        let clean = sanitize(text);
        if clean.is_empty() {
            self.log.warn("missing-text: nothing to speak after sanitization");
            return Ok(());
        }
        let cfg = self.cfg.lock().unwrap().clone();
        if cfg.base.trim().is_empty() {
            bail!("No base URL configured");
        }
        debug!("Speaking {:?} ({} mode)", clean, cfg.mode);
        if cfg.mode == "file" {
            self.speak_file(&cfg, &clean).await
        } else {
            self.speak_stream(&cfg, &clean).await
        }
    }

    /// Raw PCM16 stream at the service rate, resampled into the sink.
    async fn speak_stream(&self, cfg: &TtsConfig, text: &str) -> Result<()> {
        self.sink.resume();
        let sink_rate = self.sink.rate();
        self.enqueue_silence(PREROLL_MS);

        let sink = Arc::clone(&self.sink);
        let decoder = Mutex::new(Pcm16Decoder::new());
        let reorder = Mutex::new(ReorderBuffer::<Vec<u8>>::new());
        let handlers = StreamHandlers::new().chunks(move |bytes, seq| {
            let ready = reorder.lock().unwrap().push(seq, bytes.to_vec());
            for chunk in ready {
                let samples = decoder.lock().unwrap().decode(&chunk);
                if samples.is_empty() {
                    continue;
                }
                if sink_rate != TTS_STREAM_RATE {
                    sink.enqueue(&resample_linear(&samples, TTS_STREAM_RATE, sink_rate));
                } else {
                    sink.enqueue(&samples);
                }
            }
        });

        let mut body = json!({
            "text": text,
            "mode": "stream",
            "format": "raw",
        });
        if !cfg.model.trim().is_empty() {
            body["model"] = json!(cfg.model);
        }
        if !cfg.voice.trim().is_empty() {
            body["voice"] = json!(cfg.voice);
        }
        self.mux
            .post_stream(
                &cfg.base,
                "/speak",
                body,
                cfg.api_key_opt(),
                &cfg.route,
                handlers,
                DEFAULT_STREAM_TIMEOUT,
            )
            .await
            .context("Speech stream failed")?;

        self.enqueue_silence(SPACER_MS);
        let underruns = self.sink.underruns();
        if underruns > 0 {
            debug!("Sink reports {} underruns", underruns);
        }
        Ok(())
    }

    /// Encoded file mode: fetch (or decode) the blob and play it through
    /// the attached player, resolving when playback ends.
    async fn speak_file(&self, cfg: &TtsConfig, text: &str) -> Result<()> {
        let mut body = json!({
            "text": text,
            "mode": "file",
            "format": "ogg",
        });
        if !cfg.model.trim().is_empty() {
            body["model"] = json!(cfg.model);
        }
        if !cfg.voice.trim().is_empty() {
            body["voice"] = json!(cfg.voice);
        }
        let resp = self
            .mux
            .post_json(
                &cfg.base,
                "/speak",
                body,
                cfg.api_key_opt(),
                &cfg.route,
                Duration::from_secs(60),
            )
            .await
            .context("Speech request failed")?;

        let blob = if let Some(url) = resp
            .pointer("/files/0/url")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
        {
            let full = if url.starts_with("http") {
                url.to_string()
            } else {
                join_url(&cfg.base, url)
            };
            self.mux
                .fetch_blob(&full, &cfg.route, cfg.api_key_opt())
                .await?
        } else if let Some(b64) = resp.get("audio_b64").and_then(|v| v.as_str()) {
            Blob {
                content_type: "audio/ogg".to_string(),
                bytes: base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .context("Malformed audio_b64")?,
            }
        } else {
            bail!("Speech response had neither file URL nor audio_b64");
        };

        match &self.player {
            Some(player) => {
                info!("Playing {} byte blob ({})", blob.bytes.len(), blob.content_type);
                player.play(blob).await
            }
            None => {
                self.log.warn("No player attached for file-mode playback");
                Ok(())
            }
        }
    }

    fn enqueue_silence(&self, ms: u64) {
        let n = (self.sink.rate() as u64 * ms / 1000) as usize;
        self.sink.enqueue(&vec![0.0; n]);
    }
}
