//! LLM controller: prompt turns, token streaming, memory window
//!
//! A `prompt` message starts a turn: the controller builds the chat
//! message list (optional system message plus the sliding memory
//! window), streams NDJSON tokens from the service, muxes deltas into
//! whole sentences on the `delta`/`final` ports, and rebuilds the
//! memory window after the turn.

use crate::graph::log::NodeLog;
use crate::graph::router::Router;
use crate::graph::store::{NodeRecord, NodeStore};
use crate::stream::{NdjsonPump, ReorderBuffer, SentenceMux};
use crate::transport::relay::StreamHandlers;
use crate::transport::{Route, TransportMux, DEFAULT_STREAM_TIMEOUT};
use crate::types::{text_message, PortAddress};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// One chat message on the wire and in the memory window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// LLM node configuration, decoded from the durable record.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base: String,
    pub api_key: String,
    pub route: Route,
    pub model: String,
    pub stream: bool,
    pub system: String,
    pub use_system: bool,
    pub memory_on: bool,
    pub max_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base: String::new(),
            api_key: String::new(),
            route: Route::default(),
            model: String::new(),
            stream: true,
            system: String::new(),
            use_system: false,
            memory_on: true,
            max_turns: 8,
        }
    }
}

impl LlmConfig {
    pub fn from_record(rec: &NodeRecord) -> Self {
        let d = Self::default();
        Self {
            base: rec.str_field("base"),
            api_key: rec.str_field("apiKey"),
            route: Route {
                use_relay: rec.bool_field("useRelay", false),
                relay: rec.str_field("relay"),
            },
            model: rec.str_field("model"),
            stream: rec.bool_field("stream", d.stream),
            system: rec.str_field("system"),
            use_system: rec.bool_field("useSystem", d.use_system),
            memory_on: rec.bool_field("memoryOn", d.memory_on),
            max_turns: rec.u64_field("maxTurns", d.max_turns as u64) as usize,
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

/// Extract the next token delta from one parsed NDJSON line.
///
/// Precedence is `message.content`, then `response`, then `delta` —
/// first non-empty wins. Changing this order changes which text is
/// spoken when a provider populates several fields.
pub fn extract_delta(line: &Value) -> Option<String> {
    [
        line.pointer("/message/content"),
        line.get("response"),
        line.get("delta"),
    ]
    .into_iter()
    .flatten()
    .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
    .map(|s| s.to_string())
}

/// True when the line marks the end of the stream.
pub fn is_terminal(line: &Value) -> bool {
    line.get("done")
        .or_else(|| line.get("complete"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Terminal lines may carry a last chunk under `final` or
/// `message.content`.
pub fn terminal_text(line: &Value) -> Option<String> {
    line.get("final")
        .or_else(|| line.pointer("/message/content"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Remove model terminator tokens by literal substring removal.
pub fn strip_terminators(text: &str) -> String {
    text.replace("</s>", "").replace("<|eot_id|>", "")
}

/// Build the outgoing message list for one turn.
pub fn build_messages(
    cfg: &LlmConfig,
    memory: &[ChatMessage],
    user_text: &str,
) -> Vec<ChatMessage> {
    let mut msgs: Vec<ChatMessage> = Vec::new();
    if cfg.use_system && !cfg.system.trim().is_empty() {
        msgs.push(ChatMessage::system(cfg.system.clone()));
    }
    if cfg.memory_on {
        for (i, m) in memory.iter().enumerate() {
            if m.role == "system" {
                // Keep a remembered system message only when none was set.
                if i == 0 && msgs.is_empty() {
                    msgs.push(m.clone());
                }
                continue;
            }
            msgs.push(m.clone());
        }
    }
    msgs.push(ChatMessage::user(user_text));
    if cfg.memory_on {
        prune_turns(&mut msgs, cfg.max_turns);
    }
    msgs
}

/// Drop the oldest user turn (and its trailing assistant reply) until
/// at most `max_turns` user messages remain. System messages survive.
pub fn prune_turns(msgs: &mut Vec<ChatMessage>, max_turns: usize) {
    loop {
        let users = msgs.iter().filter(|m| m.role == "user").count();
        if users <= max_turns {
            return;
        }
        let idx = match msgs.iter().position(|m| m.role == "user") {
            Some(i) => i,
            None => return,
        };
        msgs.remove(idx);
        while idx < msgs.len() && msgs[idx].role == "assistant" {
            msgs.remove(idx);
        }
    }
}

/// Rebuild the memory window after a completed turn.
pub fn update_memory(
    memory: &mut Vec<ChatMessage>,
    user_text: &str,
    assistant_text: Option<&str>,
    max_turns: usize,
) {
    memory.push(ChatMessage::user(user_text));
    if let Some(a) = assistant_text.filter(|a| !a.trim().is_empty()) {
        memory.push(ChatMessage::assistant(a));
    }
    prune_turns(memory, max_turns);
}

struct LlmInner {
    node_id: String,
    cfg: Mutex<LlmConfig>,
    memory: Mutex<Vec<ChatMessage>>,
    mux: Arc<TransportMux>,
    router: Arc<Router>,
    store: Arc<NodeStore>,
    log: Arc<NodeLog>,
    /// Serializes turns so the memory window stays coherent
    turn_lock: tokio::sync::Mutex<()>,
}

/// Handle to one LLM node's controller.
#[derive(Clone)]
pub struct LlmController {
    inner: Arc<LlmInner>,
}

impl LlmController {
    pub fn new(
        node_id: impl Into<String>,
        cfg: LlmConfig,
        mux: Arc<TransportMux>,
        router: Arc<Router>,
        store: Arc<NodeStore>,
    ) -> Self {
        let node_id = node_id.into();
        let memory = store
            .load(&node_id)
            .and_then(|rec| {
                rec.config
                    .get("memory")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
            })
            .unwrap_or_default();
        Self {
            inner: Arc::new(LlmInner {
                node_id,
                cfg: Mutex::new(cfg),
                memory: Mutex::new(memory),
                mux,
                router,
                store,
                log: Arc::new(NodeLog::new()),
                turn_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn log(&self) -> Arc<NodeLog> {
        Arc::clone(&self.inner.log)
    }

    /// Register the `prompt` and `system` input handlers.
    pub fn attach(&self) {
        let prompt_inner = Arc::clone(&self.inner);
        self.inner.router.register(
            PortAddress::input(self.inner.node_id.clone(), "prompt"),
            move |payload| {
                let text = crate::types::normalize_payload(payload).text;
                if text.trim().is_empty() {
                    return;
                }
                let inner = Arc::clone(&prompt_inner);
                tokio::spawn(async move { inner.run_turn(text).await });
            },
        );
        let system_inner = Arc::clone(&self.inner);
        self.inner.router.register(
            PortAddress::input(self.inner.node_id.clone(), "system"),
            move |payload| {
                let text = crate::types::normalize_payload(payload).text;
                system_inner.set_system(&text);
            },
        );
    }

    /// Enumerate models, trying the known listing endpoints in order.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let cfg = self.inner.cfg.lock().unwrap().clone();
        for path in ["/api/tags", "/v1/models", "/models"] {
            match self
                .inner
                .mux
                .get_json(&cfg.base, path, cfg.api_key_opt(), &cfg.route)
                .await
            {
                Ok(v) => {
                    let names = parse_model_list(&v);
                    if !names.is_empty() {
                        return Ok(names);
                    }
                }
                Err(e) => debug!("Model listing {} failed: {}", path, e),
            }
        }
        anyhow::bail!("No model listing endpoint answered")
    }

    pub fn memory_snapshot(&self) -> Vec<ChatMessage> {
        self.inner.memory.lock().unwrap().clone()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<LlmInner> {
        &self.inner
    }
}

impl LlmInner {
    fn set_system(&self, text: &str) {
        {
            let mut cfg = self.cfg.lock().unwrap();
            cfg.system = text.to_string();
            cfg.use_system = true;
        }
        self.store.update(
            &self.node_id,
            json!({"system": text, "useSystem": true}),
        );
        self.log.info("System message updated");
    }

    async fn run_turn(self: Arc<Self>, user_text: String) {
        let _turn = self.turn_lock.lock().await;
        let cfg = self.cfg.lock().unwrap().clone();
        if cfg.base.trim().is_empty() {
            self.log.error("No base URL configured");
            return;
        }
        let memory = self.memory.lock().unwrap().clone();
        let messages = build_messages(&cfg, &memory, &user_text);
        debug!(
            "LLM turn: {} messages, stream={} (node {})",
            messages.len(),
            cfg.stream,
            self.node_id
        );

        let assistant = if cfg.stream {
            self.run_streaming(&cfg, &messages).await
        } else {
            self.run_oneshot(&cfg, &messages).await
        };

        let assistant = match assistant {
            Ok(text) => text,
            Err(e) => {
                warn!("LLM turn failed: {:#}", e);
                self.log.error(format!("Turn failed: {}", e));
                return;
            }
        };

        // Rebuild the memory window and persist it.
        let size = {
            let mut memory = self.memory.lock().unwrap();
            update_memory(
                &mut memory,
                &user_text,
                Some(assistant.as_str()),
                cfg.max_turns,
            );
            memory.len()
        };
        if cfg.memory_on {
            let snapshot = self.memory.lock().unwrap().clone();
            self.store.update(
                &self.node_id,
                json!({"memory": serde_json::to_value(&snapshot).unwrap_or_default()}),
            );
        }
        self.router.send_from(
            &self.node_id,
            "memory",
            &json!({"nodeId": self.node_id, "type": "updated", "size": size}),
        );
        info!("LLM turn complete ({} chars)", assistant.len());
    }

    async fn run_streaming(&self, cfg: &LlmConfig, messages: &[ChatMessage]) -> Result<String> {
        let accumulated: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let sentences = Arc::new(self.sentence_mux());

        // One line handler shared by the raw-chunk and pre-split paths.
        let acc = Arc::clone(&accumulated);
        let line_sentences = Arc::clone(&sentences);
        let handle_line: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(move |line: &str| {
            let parsed: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(_) => return, // malformed frame: skip, stream continues
            };
            let delta = if is_terminal(&parsed) {
                extract_delta(&parsed).or_else(|| terminal_text(&parsed))
            } else {
                extract_delta(&parsed)
            };
            if let Some(delta) = delta {
                let clean = strip_terminators(&delta);
                if !clean.is_empty() {
                    acc.lock().unwrap().push_str(&clean);
                    line_sentences.push(&clean);
                }
            }
        });

        let pump_line = Arc::clone(&handle_line);
        let pump = Arc::new(Mutex::new(NdjsonPump::new(move |line| pump_line(line))));
        let chunk_pump = Arc::clone(&pump);
        let chunk_reorder = Mutex::new(ReorderBuffer::<Vec<u8>>::new());
        let line_reorder = Mutex::new(ReorderBuffer::<String>::new());
        let lines_handler = Arc::clone(&handle_line);
        let handlers = StreamHandlers::new()
            .chunks(move |bytes, seq| {
                let ready = chunk_reorder.lock().unwrap().push(seq, bytes.to_vec());
                let mut pump = chunk_pump.lock().unwrap();
                for chunk in ready {
                    pump.push(&chunk);
                }
            })
            .lines(move |frames| {
                let mut buf = line_reorder.lock().unwrap();
                for frame in frames {
                    for line in buf.push(frame.seq, frame.line) {
                        lines_handler(&line);
                    }
                }
            });

        let body = json!({
            "model": cfg.model,
            "messages": messages,
            "stream": true,
        });
        self.mux
            .post_stream(
                &cfg.base,
                "/api/chat",
                body,
                cfg.api_key_opt(),
                &cfg.route,
                handlers,
                DEFAULT_STREAM_TIMEOUT,
            )
            .await
            .context("Chat stream failed")?;

        pump.lock().unwrap().flush();
        sentences.flush();
        let text = accumulated.lock().unwrap().clone();
        Ok(text)
    }

    async fn run_oneshot(&self, cfg: &LlmConfig, messages: &[ChatMessage]) -> Result<String> {
        let body = json!({
            "model": cfg.model,
            "messages": messages,
            "stream": false,
        });
        let resp = self
            .mux
            .post_json(
                &cfg.base,
                "/api/chat",
                body,
                cfg.api_key_opt(),
                &cfg.route,
                DEFAULT_STREAM_TIMEOUT,
            )
            .await
            .context("Chat request failed")?;
        let text = resp
            .pointer("/message/content")
            .or_else(|| resp.get("response"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let clean = strip_terminators(&text);
        let sentences = self.sentence_mux();
        sentences.push(&clean);
        sentences.flush();
        Ok(clean)
    }

    /// Sentence mux whose emissions route on both `delta` and `final`.
    fn sentence_mux(&self) -> SentenceMux {
        let router = Arc::clone(&self.router);
        let node_id = self.node_id.clone();
        SentenceMux::new(move |sentence| {
            let msg = text_message(&node_id, sentence);
            router.send_from(&node_id, "delta", &msg);
            router.send_from(&node_id, "final", &msg);
        })
    }
}

fn parse_model_list(v: &Value) -> Vec<String> {
    // Ollama: {models:[{name}]}; OpenAI: {data:[{id}]}; plain arrays too.
    let candidates = v
        .get("models")
        .or_else(|| v.get("data"))
        .or(Some(v))
        .and_then(|x| x.as_array());
    candidates
        .map(|arr| {
            arr.iter()
                .filter_map(|item| {
                    item.as_str()
                        .map(|s| s.to_string())
                        .or_else(|| {
                            item.get("name")
                                .or_else(|| item.get("id"))
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string())
                        })
                })
                .collect()
        })
        .unwrap_or_default()
}
