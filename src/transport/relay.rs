//! Datagram relay client abstraction and response dispatcher
//!
//! The relay carries application envelopes `{event, id, ...}` between
//! peers. A single logical HTTP request becomes one outbound
//! `http.request` frame; the response comes back either whole
//! (`relay.response`) or as an ordered stream
//! (`relay.response.begin|chunk|lines|end`) correlated by `id`.
//!
//! The concrete client is injected through [`RelayClient`]; tests use a
//! fake, production wires in the embedder's datagram stack.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// KV key holding the persisted relay seed
pub const RELAY_SEED_KEY: &str = "graph.nkn.seed";

/// Linger after `end` before the stream resolves, letting late
/// datagrams drain (bounded; never resurrects a timed-out stream)
pub const DEFAULT_LINGER_END_MS: u64 = 150;

/// Hold hint attached to request frames so the relay buffers the
/// response while the sender is between reconnects
pub const REQUEST_HOLD_MS: u64 = 120_000;

/// One inbound datagram from the relay.
#[derive(Debug, Clone)]
pub struct RelayInbound {
    pub from: String,
    pub payload: Vec<u8>,
}

/// Delivery options for an outbound datagram.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Fire-and-forget; the response arrives on the message channel.
    pub no_reply: bool,
    /// Ask the relay to hold undeliverable frames this long.
    pub hold_ms: Option<u64>,
}

/// Minimal surface the runtime needs from a datagram relay client.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Stable address other peers send to.
    fn address(&self) -> String;
    /// Key seed to persist so the address survives restarts.
    fn seed(&self) -> Option<Value>;
    /// Send one datagram.
    async fn send(&self, dest: &str, payload: Vec<u8>, opts: SendOptions) -> Result<()>;
    /// Take the inbound message channel. Yields `Some` exactly once.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<RelayInbound>>;
}

/// Builds a relay client, optionally from a persisted seed.
pub type RelayFactory =
    Arc<dyn Fn(Option<&Value>) -> Result<Arc<dyn RelayClient>> + Send + Sync>;

/// One pre-split NDJSON line from a `relay.response.lines` frame.
#[derive(Debug, Clone)]
pub struct LineFrame {
    pub line: String,
    pub seq: u64,
    pub ts: Option<f64>,
}

/// Callbacks for one logical response stream.
#[derive(Default)]
pub struct StreamHandlers {
    pub on_begin: Option<Box<dyn FnMut(&Value) + Send>>,
    pub on_chunk: Option<Box<dyn FnMut(&[u8], u64) + Send>>,
    pub on_lines: Option<Box<dyn FnMut(Vec<LineFrame>) + Send>>,
    pub on_end: Option<Box<dyn FnMut(&Value) + Send>>,
}

impl StreamHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(mut self, f: impl FnMut(&Value) + Send + 'static) -> Self {
        self.on_begin = Some(Box::new(f));
        self
    }

    pub fn chunks(mut self, f: impl FnMut(&[u8], u64) + Send + 'static) -> Self {
        self.on_chunk = Some(Box::new(f));
        self
    }

    pub fn lines(mut self, f: impl FnMut(Vec<LineFrame>) + Send + 'static) -> Self {
        self.on_lines = Some(Box::new(f));
        self
    }

    pub fn end(mut self, f: impl FnMut(&Value) + Send + 'static) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }
}

struct StreamSlot {
    handlers: Mutex<StreamHandlers>,
    done: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

/// Relay client plus the single dispatcher that fans envelopes out to
/// pending requests, live streams, and DM subscribers.
pub struct RelayHub {
    client: Arc<dyn RelayClient>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    streams: Mutex<HashMap<String, Arc<StreamSlot>>>,
    dm_handlers: Mutex<Vec<Arc<dyn Fn(&RelayInbound) + Send + Sync>>>,
    linger_end: Duration,
}

impl RelayHub {
    /// Wrap a client and start the dispatcher task.
    pub fn start(client: Arc<dyn RelayClient>) -> Arc<Self> {
        Self::start_with_linger(client, Duration::from_millis(DEFAULT_LINGER_END_MS))
    }

    pub fn start_with_linger(client: Arc<dyn RelayClient>, linger_end: Duration) -> Arc<Self> {
        let hub = Arc::new(Self {
            client: Arc::clone(&client),
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            dm_handlers: Mutex::new(Vec::new()),
            linger_end,
        });
        if let Some(mut rx) = client.take_incoming() {
            let hub2 = Arc::clone(&hub);
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    Self::dispatch(&hub2, &msg);
                }
                debug!("Relay message channel closed");
            });
        }
        hub
    }

    pub fn address(&self) -> String {
        self.client.address()
    }

    pub fn client(&self) -> Arc<dyn RelayClient> {
        Arc::clone(&self.client)
    }

    /// Subscribe to frames that are not responses to our requests
    /// (peer DMs, debug traffic).
    pub fn on_message(&self, handler: impl Fn(&RelayInbound) + Send + Sync + 'static) {
        self.dm_handlers.lock().unwrap().push(Arc::new(handler));
    }

    /// Send a request frame and await the single matching
    /// `relay.response` envelope.
    pub async fn request(&self, dest: &str, mut frame: Value, timeout: Duration) -> Result<Value> {
        let id = uuid::Uuid::new_v4().to_string();
        frame["id"] = Value::String(id.clone());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);
        let result = self.send_frame(dest, &frame).await;
        if let Err(e) = result {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => {
                anyhow::bail!("relay dispatcher dropped request {}", id)
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                anyhow::bail!("relay request timed out after {:?}", timeout)
            }
        }
    }

    /// Send a request frame and stream the chunked response through
    /// `handlers` until `end` (plus linger) or `timeout`.
    pub async fn stream(
        &self,
        dest: &str,
        mut frame: Value,
        handlers: StreamHandlers,
        timeout: Duration,
    ) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        frame["id"] = Value::String(id.clone());
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(StreamSlot {
            handlers: Mutex::new(handlers),
            done: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        self.streams.lock().unwrap().insert(id.clone(), slot);
        if let Err(e) = self.send_frame(dest, &frame).await {
            self.streams.lock().unwrap().remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => Ok(()),
            Err(_) => {
                // Drop the slot so a late linger cannot resurrect it.
                self.streams.lock().unwrap().remove(&id);
                anyhow::bail!("relay stream timed out after {:?}", timeout)
            }
        }
    }

    /// Fire a raw frame (peer DMs use this directly).
    pub async fn send_frame(&self, dest: &str, frame: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(frame)?;
        self.client
            .send(
                dest,
                bytes,
                SendOptions {
                    no_reply: true,
                    hold_ms: Some(REQUEST_HOLD_MS),
                },
            )
            .await
    }

    fn dispatch(hub: &Arc<Self>, msg: &RelayInbound) {
        let value: Value = match serde_json::from_slice(&msg.payload) {
            Ok(v) => v,
            Err(_) => {
                hub.forward_dm(msg);
                return;
            }
        };
        let event = value.get("event").and_then(|v| v.as_str()).unwrap_or("");
        let id = value.get("id").and_then(|v| v.as_str()).unwrap_or("");
        match event {
            "relay.response" => {
                if let Some(tx) = hub.pending.lock().unwrap().remove(id) {
                    let _ = tx.send(value.clone());
                } else {
                    trace!("Orphan relay.response id={}", id);
                }
            }
            "relay.response.begin" => {
                if let Some(slot) = hub.slot(id) {
                    if !slot.closed.load(Ordering::SeqCst) {
                        if let Some(f) = slot.handlers.lock().unwrap().on_begin.as_mut() {
                            f(&value);
                        }
                    }
                }
            }
            "relay.response.chunk" => {
                if let Some(slot) = hub.slot(id) {
                    if !slot.closed.load(Ordering::SeqCst) {
                        let seq = value.get("seq").and_then(|v| v.as_u64()).unwrap_or(0);
                        if let Some(bytes) = decode_chunk_body(&value) {
                            if let Some(f) = slot.handlers.lock().unwrap().on_chunk.as_mut() {
                                f(&bytes, seq);
                            }
                        }
                    }
                }
            }
            "relay.response.lines" => {
                if let Some(slot) = hub.slot(id) {
                    if !slot.closed.load(Ordering::SeqCst) {
                        let frames = parse_line_frames(&value);
                        if !frames.is_empty() {
                            if let Some(f) = slot.handlers.lock().unwrap().on_lines.as_mut() {
                                f(frames);
                            }
                        }
                    }
                }
            }
            "relay.response.end" => {
                if let Some(slot) = hub.slot(id) {
                    slot.closed.store(true, Ordering::SeqCst);
                    let hub = Arc::clone(hub);
                    let id = id.to_string();
                    let meta = value.clone();
                    let linger = hub.linger_end;
                    tokio::spawn(async move {
                        tokio::time::sleep(linger).await;
                        let slot = hub.streams.lock().unwrap().remove(&id);
                        if let Some(slot) = slot {
                            if let Some(f) = slot.handlers.lock().unwrap().on_end.as_mut() {
                                f(&meta);
                            }
                            if let Some(tx) = slot.done.lock().unwrap().take() {
                                let _ = tx.send(());
                            }
                        }
                    });
                }
            }
            _ => hub.forward_dm(msg),
        }
    }

    fn slot(&self, id: &str) -> Option<Arc<StreamSlot>> {
        self.streams.lock().unwrap().get(id).cloned()
    }

    fn forward_dm(&self, msg: &RelayInbound) {
        let handlers = self.dm_handlers.lock().unwrap().clone();
        if handlers.is_empty() {
            trace!("Unhandled relay frame from {}", msg.from);
        }
        for h in handlers {
            h(msg);
        }
    }
}

/// Chunk bodies arrive base64-encoded (`b64`/`payload_b64`) or as a
/// UTF-8 `data` string.
fn decode_chunk_body(value: &Value) -> Option<Vec<u8>> {
    for key in ["b64", "payload_b64", "body_b64"] {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(s) {
                return Some(bytes);
            }
        }
    }
    if let Some(s) = value.get("data").and_then(|v| v.as_str()) {
        return Some(s.as_bytes().to_vec());
    }
    warn!("Chunk frame without body");
    None
}

fn parse_line_frames(value: &Value) -> Vec<LineFrame> {
    value
        .get("lines")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| {
                    let line = item.get("line").and_then(|v| v.as_str())?;
                    Some(LineFrame {
                        line: line.to_string(),
                        seq: item.get("seq").and_then(|v| v.as_u64()).unwrap_or(0),
                        ts: item.get("ts").and_then(|v| v.as_f64()),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
