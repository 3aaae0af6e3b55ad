//! Request/stream multiplexer over direct HTTP and the datagram relay
//!
//! Controllers talk to remote services through this one surface; the
//! graph-level transport selection (or a per-node override) decides
//! whether a call goes straight over HTTP or rides the relay as an
//! `http.request` envelope answered by ordered response frames.

pub mod relay;

use crate::audio::Blob;
use crate::graph::kv::KvStore;
use anyhow::{bail, Context, Result};
use base64::Engine;
use futures_util::StreamExt;
use relay::{RelayFactory, RelayHub, StreamHandlers, RELAY_SEED_KEY};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default timeout for a single JSON request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(45);
/// Default timeout for a response stream
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Transport-level failure taxonomy
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{status} {status_text}")]
    Http { status: u16, status_text: String },
    #[error("relay send failed: {0}")]
    RelaySend(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("no relay address configured")]
    NoRelay,
}

/// Per-call transport selection.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub use_relay: bool,
    /// Relay address of the HTTP bridge peer.
    pub relay: String,
}

impl Route {
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn relay(addr: impl Into<String>) -> Self {
        Self {
            use_relay: true,
            relay: addr.into(),
        }
    }
}

/// Clone `headers` with auth and content shaping applied.
///
/// `Content-Type: application/json` is added if absent; an api key
/// beginning with `Bearer ` becomes `Authorization`, anything else
/// becomes `X-API-Key`.
pub fn auth_headers(
    headers: &HashMap<String, String>,
    api_key: Option<&str>,
) -> HashMap<String, String> {
    let mut out = headers.clone();
    if !out.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
        out.insert("Content-Type".to_string(), "application/json".to_string());
    }
    if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
        if key.starts_with("Bearer ") {
            out.insert("Authorization".to_string(), key.to_string());
        } else {
            out.insert("X-API-Key".to_string(), key.to_string());
        }
    }
    out
}

/// GET-shaped variant: no body, so no `Content-Type`; expect JSON back.
fn get_headers(api_key: Option<&str>) -> HashMap<String, String> {
    let mut headers = auth_headers(&HashMap::new(), api_key);
    headers.retain(|k, _| !k.eq_ignore_ascii_case("content-type"));
    headers.insert("Accept".to_string(), "application/json".to_string());
    headers
}

/// Join a base URL and path without doubling the slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// The transport multiplexer. One per process; the relay client is
/// brought up lazily and its seed persisted so the address is stable
/// across restarts.
pub struct TransportMux {
    http: reqwest::Client,
    kv: Arc<dyn KvStore>,
    factory: RelayFactory,
    hub: tokio::sync::Mutex<Option<Arc<RelayHub>>>,
}

impl TransportMux {
    pub fn new(kv: Arc<dyn KvStore>, factory: RelayFactory) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            kv,
            factory,
            hub: tokio::sync::Mutex::new(None),
        })
    }

    /// Idempotently bring up the relay client, reusing the persisted
    /// seed when one exists. A seed the factory rejects is deleted and
    /// creation retried fresh.
    pub async fn ensure_relay(&self) -> Result<Arc<RelayHub>> {
        let mut guard = self.hub.lock().await;
        if let Some(hub) = guard.as_ref() {
            return Ok(Arc::clone(hub));
        }
        let persisted = self.kv.get(RELAY_SEED_KEY);
        let client = match (self.factory)(persisted.as_ref()) {
            Ok(c) => c,
            Err(e) if persisted.is_some() => {
                warn!("Persisted relay seed rejected ({}), retrying fresh", e);
                self.kv.remove(RELAY_SEED_KEY);
                (self.factory)(None)?
            }
            Err(e) => return Err(e),
        };
        if let Some(seed) = client.seed() {
            self.kv.set(RELAY_SEED_KEY, seed);
        }
        info!("Relay client up at {}", client.address());
        let hub = RelayHub::start(client);
        *guard = Some(Arc::clone(&hub));
        Ok(hub)
    }

    /// The relay hub if one is already up (peer DM subscription).
    pub async fn relay_hub(&self) -> Option<Arc<RelayHub>> {
        self.hub.lock().await.clone()
    }

    /// GET `base/path`, returning parsed JSON.
    pub async fn get_json(
        &self,
        base: &str,
        path: &str,
        api_key: Option<&str>,
        route: &Route,
    ) -> Result<Value> {
        if base.trim().is_empty() {
            bail!("Empty base URL");
        }
        let url = join_url(base, path);
        if route.use_relay {
            let req = json!({
                "url": url,
                "method": "GET",
                "headers": get_headers(api_key),
                "timeout_ms": DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            });
            let envelope = self
                .send_request(req, route, DEFAULT_REQUEST_TIMEOUT)
                .await?;
            return envelope_json(&envelope);
        }
        let mut builder = self.http.get(&url);
        for (k, v) in get_headers(api_key) {
            builder = builder.header(k, v);
        }
        let resp = builder
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        check_status(&resp)?;
        Ok(resp.json().await.context("Failed to parse JSON response")?)
    }

    /// POST `base/path` with a JSON body, returning parsed JSON.
    pub async fn post_json(
        &self,
        base: &str,
        path: &str,
        body: Value,
        api_key: Option<&str>,
        route: &Route,
        timeout: Duration,
    ) -> Result<Value> {
        if base.trim().is_empty() {
            bail!("Empty base URL");
        }
        let url = join_url(base, path);
        if route.use_relay {
            let req = json!({
                "url": url,
                "method": "POST",
                "headers": auth_headers(&HashMap::new(), api_key),
                "timeout_ms": timeout.as_millis() as u64,
                "json": body,
            });
            let envelope = self.send_request(req, route, timeout).await?;
            return envelope_json(&envelope);
        }
        let mut builder = self.http.post(&url).json(&body);
        for (k, v) in auth_headers(&HashMap::new(), api_key) {
            builder = builder.header(k, v);
        }
        let resp = builder
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        check_status(&resp)?;
        Ok(resp.json().await.context("Failed to parse JSON response")?)
    }

    /// POST raw bytes (ASR uplink frames).
    pub async fn post_bytes(
        &self,
        full_url: &str,
        body: Vec<u8>,
        content_type: &str,
        api_key: Option<&str>,
        route: &Route,
        timeout: Duration,
    ) -> Result<()> {
        if route.use_relay {
            let mut headers = auth_headers(&HashMap::new(), api_key);
            headers.insert("Content-Type".to_string(), content_type.to_string());
            let req = json!({
                "url": full_url,
                "method": "POST",
                "headers": headers,
                "timeout_ms": timeout.as_millis() as u64,
                "b64": base64::engine::general_purpose::STANDARD.encode(&body),
            });
            self.send_request(req, route, timeout).await?;
            return Ok(());
        }
        let mut builder = self.http.post(full_url).body(body);
        let mut headers = auth_headers(&HashMap::new(), api_key);
        headers.insert("Content-Type".to_string(), content_type.to_string());
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
        let resp = builder
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("POST {} failed", full_url))?;
        check_status(&resp)?;
        Ok(())
    }

    /// Fetch a binary body (file-mode TTS output).
    pub async fn fetch_blob(
        &self,
        full_url: &str,
        route: &Route,
        api_key: Option<&str>,
    ) -> Result<Blob> {
        if route.use_relay {
            let req = json!({
                "url": full_url,
                "method": "GET",
                "headers": auth_headers(&HashMap::new(), api_key),
                "timeout_ms": DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            });
            let envelope = self
                .send_request(req, route, DEFAULT_REQUEST_TIMEOUT)
                .await?;
            let content_type = envelope
                .get("headers")
                .and_then(|h| h.get("content-type"))
                .and_then(|v| v.as_str())
                .unwrap_or("application/octet-stream")
                .to_string();
            let bytes = envelope
                .get("b64")
                .and_then(|v| v.as_str())
                .and_then(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
                .or_else(|| {
                    envelope
                        .get("body")
                        .and_then(|v| v.as_str())
                        .map(|s| s.as_bytes().to_vec())
                })
                .context("Relay blob response had no body")?;
            return Ok(Blob {
                content_type,
                bytes,
            });
        }
        let mut builder = self.http.get(full_url);
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            if key.starts_with("Bearer ") {
                builder = builder.header("Authorization", key);
            } else {
                builder = builder.header("X-API-Key", key);
            }
        }
        let resp = builder
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("GET {} failed", full_url))?;
        check_status(&resp)?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp.bytes().await.context("Failed to read blob body")?;
        Ok(Blob {
            content_type,
            bytes: bytes.to_vec(),
        })
    }

    /// Send one `http.request` envelope over the relay and await the
    /// single `relay.response`.
    pub async fn send_request(&self, req: Value, route: &Route, timeout: Duration) -> Result<Value> {
        if route.relay.trim().is_empty() {
            return Err(TransportError::NoRelay.into());
        }
        let hub = self.ensure_relay().await?;
        let envelope = hub
            .request(&route.relay, json!({"event": "http.request", "req": req}), timeout)
            .await?;
        if let Some(err) = envelope.get("error").and_then(|v| v.as_str()) {
            bail!("Relay request failed: {}", err);
        }
        if let Some(status) = envelope.get("status").and_then(|v| v.as_u64()) {
            if !(200..300).contains(&status) {
                let status_text = envelope
                    .get("statusText")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown")
                    .to_string();
                return Err(TransportError::Http {
                    status: status as u16,
                    status_text,
                }
                .into());
            }
        }
        Ok(envelope)
    }

    /// Send an `http.request` envelope flagged for chunked streaming and
    /// pump the ordered response frames through `handlers`.
    pub async fn send_stream(
        &self,
        mut req: Value,
        route: &Route,
        handlers: StreamHandlers,
        timeout: Duration,
    ) -> Result<()> {
        if route.relay.trim().is_empty() {
            return Err(TransportError::NoRelay.into());
        }
        let hub = self.ensure_relay().await?;
        req["stream"] = json!("chunks");
        if let Some(headers) = req.get_mut("headers").and_then(|h| h.as_object_mut()) {
            headers.insert("X-Relay-Stream".to_string(), json!("chunks"));
        } else {
            req["headers"] = json!({"X-Relay-Stream": "chunks"});
        }
        hub.stream(
            &route.relay,
            json!({"event": "http.request", "req": req}),
            handlers,
            timeout,
        )
        .await
    }

    /// POST and stream the response body, over either transport.
    ///
    /// Direct HTTP feeds `on_chunk` with ascending synthetic sequence
    /// numbers; the relay path delivers the service's `seq` tags and the
    /// consumer applies reorder.
    pub async fn post_stream(
        &self,
        base: &str,
        path: &str,
        body: Value,
        api_key: Option<&str>,
        route: &Route,
        handlers: StreamHandlers,
        timeout: Duration,
    ) -> Result<()> {
        if base.trim().is_empty() {
            bail!("Empty base URL");
        }
        let url = join_url(base, path);
        if route.use_relay {
            let req = json!({
                "url": url,
                "method": "POST",
                "headers": auth_headers(&HashMap::new(), api_key),
                "timeout_ms": timeout.as_millis() as u64,
                "json": body,
            });
            return self.send_stream(req, route, handlers, timeout).await;
        }
        let mut builder = self.http.post(&url).json(&body);
        for (k, v) in auth_headers(&HashMap::new(), api_key) {
            builder = builder.header(k, v);
        }
        self.drive_http_stream(builder, handlers, timeout).await
    }

    /// GET and stream the response body (SSE event feeds).
    pub async fn get_stream(
        &self,
        full_url: &str,
        api_key: Option<&str>,
        route: &Route,
        handlers: StreamHandlers,
        timeout: Duration,
    ) -> Result<()> {
        if route.use_relay {
            let req = json!({
                "url": full_url,
                "method": "GET",
                "headers": get_headers(api_key),
                "timeout_ms": timeout.as_millis() as u64,
            });
            return self.send_stream(req, route, handlers, timeout).await;
        }
        let mut builder = self.http.get(full_url);
        for (k, v) in get_headers(api_key) {
            builder = builder.header(k, v);
        }
        self.drive_http_stream(builder, handlers, timeout).await
    }

    async fn drive_http_stream(
        &self,
        builder: reqwest::RequestBuilder,
        mut handlers: StreamHandlers,
        timeout: Duration,
    ) -> Result<()> {
        let work = async move {
            let resp = builder.send().await.context("Stream request failed")?;
            check_status(&resp)?;
            if let Some(f) = handlers.on_begin.as_mut() {
                let headers: HashMap<String, String> = resp
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| {
                        v.to_str().ok().map(|v| (k.to_string(), v.to_string()))
                    })
                    .collect();
                f(&json!({ "headers": headers }));
            }
            let mut stream = resp.bytes_stream();
            let mut seq = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.context("Failed to read stream chunk")?;
                if let Some(f) = handlers.on_chunk.as_mut() {
                    f(&chunk, seq);
                }
                seq += 1;
            }
            if let Some(f) = handlers.on_end.as_mut() {
                f(&Value::Null);
            }
            Ok::<(), anyhow::Error>(())
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout).into()),
        }
    }
}

fn check_status(resp: &reqwest::Response) -> Result<()> {
    let status = resp.status();
    if !status.is_success() {
        return Err(TransportError::Http {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        }
        .into());
    }
    Ok(())
}

/// Pull the JSON payload out of a `relay.response` envelope.
fn envelope_json(envelope: &Value) -> Result<Value> {
    let status = envelope
        .get("status")
        .and_then(|v| v.as_u64())
        .unwrap_or(200);
    if !(200..300).contains(&status) {
        let status_text = envelope
            .get("statusText")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string();
        return Err(TransportError::Http {
            status: status as u16,
            status_text,
        }
        .into());
    }
    if let Some(j) = envelope.get("json") {
        return Ok(j.clone());
    }
    if let Some(body) = envelope.get("body").and_then(|v| v.as_str()) {
        return serde_json::from_str(body).context("Relay body was not JSON");
    }
    if let Some(b64) = envelope.get("b64").and_then(|v| v.as_str()) {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .context("Malformed base64 body")?;
        return serde_json::from_slice(&bytes).context("Relay body was not JSON");
    }
    debug!("Relay response without body, treating as null");
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::relay::testing::FakeRelay;
    use super::relay::RelayClient;
    use super::*;
    use crate::graph::kv::MemoryKv;

    fn mux_with_fake(kv: Arc<dyn KvStore>) -> (Arc<TransportMux>, Arc<FakeRelay>) {
        let relay = FakeRelay::new("local.addr");
        let relay2 = Arc::clone(&relay);
        let factory: RelayFactory =
            Arc::new(move |_seed| Ok(Arc::clone(&relay2) as Arc<dyn RelayClient>));
        (TransportMux::new(kv, factory), relay)
    }

    #[test]
    fn test_auth_header_shaping() {
        let headers = auth_headers(&HashMap::new(), Some("Bearer tok123"));
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer tok123");
        assert_eq!(headers.get("Content-Type").unwrap(), "application/json");

        let headers = auth_headers(&HashMap::new(), Some("plainkey"));
        assert_eq!(headers.get("X-API-Key").unwrap(), "plainkey");
        assert!(headers.get("Authorization").is_none());

        let mut preset = HashMap::new();
        preset.insert("content-type".to_string(), "audio/pcm".to_string());
        let headers = auth_headers(&preset, None);
        assert_eq!(headers.get("content-type").unwrap(), "audio/pcm");
        assert!(headers.get("Content-Type").is_none());
    }

    #[test]
    fn test_get_headers_drop_content_type() {
        let headers = get_headers(Some("k"));
        assert!(headers.get("Content-Type").is_none());
        assert_eq!(headers.get("Accept").unwrap(), "application/json");
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://h:1/", "/api/chat"), "http://h:1/api/chat");
        assert_eq!(join_url("http://h:1", "api/chat"), "http://h:1/api/chat");
    }

    #[test]
    fn test_envelope_json_variants() {
        let v = envelope_json(&serde_json::json!({"status": 200, "json": {"a": 1}})).unwrap();
        assert_eq!(v["a"], 1);
        let v = envelope_json(&serde_json::json!({"body": "{\"b\":2}"})).unwrap();
        assert_eq!(v["b"], 2);
        let err = envelope_json(&serde_json::json!({"status": 503, "statusText": "Service Unavailable"}))
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_ensure_relay_persists_seed() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (mux, _relay) = mux_with_fake(Arc::clone(&kv));
        mux.ensure_relay().await.unwrap();
        let seed = kv.get(RELAY_SEED_KEY).unwrap();
        assert_eq!(seed, serde_json::json!("seed:local.addr"));
        // Second call reuses the hub (idempotent)
        mux.ensure_relay().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_seed_retried_fresh() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        kv.set(RELAY_SEED_KEY, serde_json::json!("corrupt"));
        let relay = FakeRelay::new("fresh.addr");
        let relay2 = Arc::clone(&relay);
        let factory: RelayFactory = Arc::new(move |seed| {
            if seed.is_some() {
                anyhow::bail!("bad seed");
            }
            Ok(Arc::clone(&relay2) as Arc<dyn RelayClient>)
        });
        let mux = TransportMux::new(Arc::clone(&kv), factory);
        let hub = mux.ensure_relay().await.unwrap();
        assert_eq!(hub.address(), "fresh.addr");
        assert_eq!(kv.get(RELAY_SEED_KEY).unwrap(), serde_json::json!("seed:fresh.addr"));
    }

    #[tokio::test]
    async fn test_send_request_requires_relay_address() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (mux, _relay) = mux_with_fake(kv);
        let err = mux
            .send_request(serde_json::json!({}), &Route::default(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no relay address"));
    }

    #[tokio::test]
    async fn test_relay_post_json_roundtrip() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (mux, relay) = mux_with_fake(kv);
        let route = Route::relay("bridge.x");
        let relay2 = Arc::clone(&relay);
        tokio::spawn(async move {
            loop {
                if let Some((dest, frame)) = relay2.last_sent() {
                    assert_eq!(dest, "bridge.x");
                    assert_eq!(frame["event"], "http.request");
                    assert_eq!(frame["req"]["method"], "POST");
                    let id = frame["id"].as_str().unwrap().to_string();
                    relay2.inject(
                        "bridge.x",
                        serde_json::json!({"event": "relay.response", "id": id, "status": 200, "json": {"reply": "ok"}}),
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let v = mux
            .post_json(
                "http://svc:9000",
                "/api/chat",
                serde_json::json!({"q": 1}),
                None,
                &route,
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(v["reply"], "ok");
    }
}
