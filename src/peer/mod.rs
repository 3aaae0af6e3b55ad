//! Peer DM overlay: handshake, heartbeat, chunked delivery
//!
//! A lightweight application protocol over the datagram relay forming
//! directed, authenticated channels between two graph instances. Nodes
//! walk `idle → pending → accepted|declined`; accepted channels keep a
//! ping/pong heartbeat and ship text as seq-tagged chunk batches.

pub mod chunk;
pub mod envelope;

pub use chunk::{split_into_frames, Inbox, DEFAULT_CHUNK_BYTES, MIN_CHUNK_BYTES};
pub use envelope::{best_text, hydrate, FrameContext};

use crate::graph::log::NodeLog;
use crate::graph::router::Router;
use crate::graph::store::NodeStore;
use crate::transport::relay::{RelayHub, RelayInbound};
use crate::transport::TransportMux;
use crate::types::{NodeKind, PortAddress};
use anyhow::Result;
use base64::Engine;
use envelope::{frame_event, target_graph_id};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_S: u64 = 15;
/// Minimum heartbeat interval
pub const MIN_HEARTBEAT_S: u64 = 5;
/// Missed beats before the indicator turns warning
pub const WARNING_MISSED: u32 = 1;
/// Missed beats before the indicator turns critical
pub const CRITICAL_MISSED: u32 = 5;

/// Handshake progress of one node's channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Pending,
    Accepted,
    Declined,
}

/// Who initiated, and where the exchange landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeDirection {
    Idle,
    Outgoing,
    Incoming,
    Accepted,
    Declined,
}

/// An incoming handshake awaiting user approval.
#[derive(Debug, Clone)]
pub struct Invite {
    pub node_id: String,
    pub peer_address: String,
    pub remote_component_id: String,
}

struct PeerNode {
    handshake: HandshakeState,
    direction: HandshakeDirection,
    peer_address: String,
    remote_component_id: String,
    allowed_peers: Vec<String>,
    auto_accept: bool,
    heartbeat_s: u64,
    chunk_bytes: usize,
    last_seen: Option<Instant>,
    missed_beats: u32,
    disconnected: bool,
    /// Bumped on every state change; stale heartbeat/resend tasks exit
    epoch: u64,
    inbox: Inbox,
    log: Arc<NodeLog>,
}

impl PeerNode {
    fn interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_s.max(MIN_HEARTBEAT_S))
    }
}

struct PeerInner {
    me: Weak<PeerInner>,
    router: Arc<Router>,
    store: Arc<NodeStore>,
    mux: Arc<TransportMux>,
    graph_id: String,
    nodes: Mutex<HashMap<String, PeerNode>>,
    hub: Mutex<Option<Arc<RelayHub>>>,
    on_invite: Mutex<Option<Arc<dyn Fn(Invite) + Send + Sync>>>,
}

/// The peer DM controller, shared by every PeerDM node in the graph.
#[derive(Clone)]
pub struct PeerDmService {
    inner: Arc<PeerInner>,
}

impl PeerDmService {
    pub fn new(
        mux: Arc<TransportMux>,
        router: Arc<Router>,
        store: Arc<NodeStore>,
        graph_id: impl Into<String>,
    ) -> Self {
        let graph_id = graph_id.into();
        let inner = Arc::new_cyclic(|me| PeerInner {
            me: me.clone(),
            router,
            store,
            mux,
            graph_id,
            nodes: Mutex::new(HashMap::new()),
            hub: Mutex::new(None),
            on_invite: Mutex::new(None),
        });
        Self { inner }
    }

    /// Bring up the relay and subscribe to inbound DM frames.
    pub async fn attach(&self) -> Result<String> {
        let hub = self.inner.mux.ensure_relay().await?;
        *self.inner.hub.lock().unwrap() = Some(Arc::clone(&hub));
        let inner = Arc::clone(&self.inner);
        hub.on_message(move |msg| inner.on_inbound(msg));
        Ok(hub.address())
    }

    /// Register a PeerDM node from its durable record and wire its
    /// `text` input. Connects immediately when a peer is configured.
    pub fn add_node(&self, node_id: &str) {
        let rec = self.inner.store.ensure(node_id, NodeKind::PeerDm);
        let peer = rec.str_field("peer");
        let node = PeerNode {
            handshake: HandshakeState::Idle,
            direction: HandshakeDirection::Idle,
            peer_address: String::new(),
            remote_component_id: String::new(),
            allowed_peers: rec
                .config
                .get("allowedPeers")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
            auto_accept: rec.bool_field("autoAccept", false),
            heartbeat_s: rec.u64_field("heartbeatS", DEFAULT_HEARTBEAT_S),
            chunk_bytes: rec.u64_field("chunkBytes", DEFAULT_CHUNK_BYTES as u64) as usize,
            last_seen: None,
            missed_beats: 0,
            disconnected: false,
            epoch: 0,
            inbox: Inbox::new(),
            log: Arc::new(NodeLog::new()),
        };
        self.inner.nodes.lock().unwrap().insert(node_id.to_string(), node);

        let inner = Arc::clone(&self.inner);
        let id = node_id.to_string();
        self.inner.router.register(
            PortAddress::input(node_id.to_string(), "text"),
            move |payload| {
                let text = crate::types::normalize_payload(payload).text;
                inner.send_text(&id, &text);
            },
        );
        if !peer.is_empty() {
            self.connect(node_id, &peer);
        }
    }

    /// User supplied a peer address: initiate the handshake and keep
    /// re-requesting on the heartbeat interval until answered.
    pub fn connect(&self, node_id: &str, peer: &str) {
        let epoch = {
            let mut nodes = self.inner.nodes.lock().unwrap();
            let n = match nodes.get_mut(node_id) {
                Some(n) => n,
                None => return,
            };
            n.peer_address = peer.to_string();
            n.handshake = HandshakeState::Pending;
            n.direction = HandshakeDirection::Outgoing;
            n.disconnected = false;
            n.epoch += 1;
            n.log.info(format!("Handshake requested with {}", peer));
            n.epoch
        };
        self.inner
            .store
            .update(node_id, json!({"peer": peer}));
        self.inner.spawn_request_loop(node_id.to_string(), epoch);
    }

    /// Approve or decline a pending incoming handshake.
    pub fn respond_invite(&self, node_id: &str, accept: bool) {
        let action = if accept { "accept" } else { "decline" };
        let reply = {
            let mut nodes = self.inner.nodes.lock().unwrap();
            let n = match nodes.get_mut(node_id) {
                Some(n) => n,
                None => return,
            };
            if n.handshake != HandshakeState::Pending
                || n.direction != HandshakeDirection::Incoming
            {
                return;
            }
            if accept {
                n.handshake = HandshakeState::Accepted;
                n.direction = HandshakeDirection::Accepted;
                n.last_seen = Some(Instant::now());
                n.missed_beats = 0;
            } else {
                n.handshake = HandshakeState::Declined;
                n.direction = HandshakeDirection::Declined;
            }
            n.epoch += 1;
            n.log.info(format!("Invite {}", action));
            (
                n.peer_address.clone(),
                n.remote_component_id.clone(),
                n.epoch,
            )
        };
        let (peer, remote, epoch) = reply;
        let ctx = self.inner.frame_ctx(node_id);
        self.inner.spawn_send(
            peer,
            ctx.handshake(action, Some(&remote), self.inner.heartbeat_of(node_id)),
        );
        if accept {
            self.inner.spawn_heartbeat(node_id.to_string(), epoch);
            self.inner.route_status(node_id, "info", "accepted", &self.inner.peer_of(node_id));
        } else {
            self.inner.route_status(node_id, "warn", "declined", &self.inner.peer_of(node_id));
        }
    }

    /// Tear the channel down entirely.
    pub fn revoke(&self, node_id: &str) {
        let peer = {
            let mut nodes = self.inner.nodes.lock().unwrap();
            let n = match nodes.get_mut(node_id) {
                Some(n) => n,
                None => return,
            };
            n.epoch += 1;
            n.handshake = HandshakeState::Idle;
            n.direction = HandshakeDirection::Idle;
            n.disconnected = false;
            let peer = std::mem::take(&mut n.peer_address);
            n.remote_component_id.clear();
            n.log.info("Channel revoked");
            peer
        };
        self.inner.store.update(node_id, json!({"peer": ""}));
        self.inner.route_status(node_id, "info", "revoked", &peer);
    }

    /// Send text over the node's channel (chunked).
    pub fn send_text(&self, node_id: &str, text: &str) {
        self.inner.send_text(node_id, text);
    }

    /// Install the invite prompt callback.
    pub fn on_invite(&self, cb: impl Fn(Invite) + Send + Sync + 'static) {
        *self.inner.on_invite.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn handshake_state(&self, node_id: &str) -> Option<(HandshakeState, HandshakeDirection)> {
        self.inner
            .nodes
            .lock()
            .unwrap()
            .get(node_id)
            .map(|n| (n.handshake, n.direction))
    }

    pub fn node_log(&self, node_id: &str) -> Option<Arc<NodeLog>> {
        self.inner
            .nodes
            .lock()
            .unwrap()
            .get(node_id)
            .map(|n| Arc::clone(&n.log))
    }

    pub fn remove_node(&self, node_id: &str) {
        self.revoke(node_id);
        self.inner.nodes.lock().unwrap().remove(node_id);
    }

    #[cfg(test)]
    pub(crate) fn inject_inbound(&self, from: &str, frame: Value) {
        self.inner.on_inbound(&RelayInbound {
            from: from.to_string(),
            payload: serde_json::to_vec(&frame).unwrap(),
        });
    }
}

impl PeerInner {
    fn arc(&self) -> Arc<PeerInner> {
        self.me.upgrade().expect("service alive")
    }

    fn component_id(&self, node_id: &str) -> String {
        format!("{}:{}", self.graph_id, node_id)
    }

    fn frame_ctx(&self, node_id: &str) -> FrameContext {
        let from = self
            .hub
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.address())
            .unwrap_or_default();
        FrameContext {
            from,
            component_id: self.component_id(node_id),
            graph_id: self.graph_id.clone(),
        }
    }

    fn peer_of(&self, node_id: &str) -> String {
        self.nodes
            .lock()
            .unwrap()
            .get(node_id)
            .map(|n| n.peer_address.clone())
            .unwrap_or_default()
    }

    fn heartbeat_of(&self, node_id: &str) -> u64 {
        self.nodes
            .lock()
            .unwrap()
            .get(node_id)
            .map(|n| n.heartbeat_s)
            .unwrap_or(DEFAULT_HEARTBEAT_S)
    }

    fn spawn_send(&self, dest: String, frame: Value) {
        if dest.is_empty() {
            warn!("DM send with no peer address");
            return;
        }
        let inner = self.arc();
        tokio::spawn(async move {
            let hub = inner.hub.lock().unwrap().clone();
            match hub {
                Some(hub) => {
                    if let Err(e) = hub.send_frame(&dest, &frame).await {
                        warn!("DM send to {} failed: {:#}", dest, e);
                    }
                }
                None => warn!("DM send with no relay attached"),
            }
        });
    }

    fn route_status(&self, node_id: &str, level: &str, code: &str, peer: &str) {
        self.router.send_from(
            node_id,
            "status",
            &json!({
                "nodeId": node_id,
                "type": "status",
                "level": level,
                "code": code,
                "peer": peer,
            }),
        );
    }

    fn send_text(&self, node_id: &str, text: &str) {
        if text.trim().is_empty() {
            self.route_status(node_id, "warn", "missing-text", "");
            return;
        }
        let prepared = {
            let nodes = self.nodes.lock().unwrap();
            let n = match nodes.get(node_id) {
                Some(n) => n,
                None => return,
            };
            if n.handshake != HandshakeState::Accepted {
                n.log.warn("Dropped outbound text: handshake not accepted");
                None
            } else {
                Some((
                    n.peer_address.clone(),
                    n.remote_component_id.clone(),
                    n.chunk_bytes,
                ))
            }
        };
        let (peer, remote, chunk_bytes) = match prepared {
            Some(p) => p,
            None => {
                self.route_status(node_id, "warn", "handshake-not-accepted", "");
                return;
            }
        };
        let ctx = self.frame_ctx(node_id);
        let batch = Uuid::new_v4().to_string();
        let frames = split_into_frames(&ctx, &batch, text, chunk_bytes, Some(&remote));
        debug!("Sending {} chunk(s) to {}", frames.len(), peer);
        let inner = self.arc();
        tokio::spawn(async move {
            let hub = inner.hub.lock().unwrap().clone();
            let hub = match hub {
                Some(h) => h,
                None => {
                    warn!("DM send with no relay attached");
                    return;
                }
            };
            for frame in frames {
                if let Err(e) = hub.send_frame(&peer, &frame).await {
                    warn!("Chunk send to {} failed: {:#}", peer, e);
                    break;
                }
            }
        });
    }

    /// Resend the handshake request on the heartbeat interval until the
    /// peer answers.
    fn spawn_request_loop(&self, node_id: String, epoch: u64) {
        let inner = self.arc();
        tokio::spawn(async move {
            loop {
                let pending = {
                    let nodes = inner.nodes.lock().unwrap();
                    match nodes.get(&node_id) {
                        Some(n)
                            if n.epoch == epoch
                                && n.handshake == HandshakeState::Pending
                                && n.direction == HandshakeDirection::Outgoing =>
                        {
                            Some((n.peer_address.clone(), n.heartbeat_s, n.interval()))
                        }
                        _ => None,
                    }
                };
                let (peer, heartbeat_s, interval) = match pending {
                    Some(p) => p,
                    None => break,
                };
                let ctx = inner.frame_ctx(&node_id);
                let frame = ctx.handshake("request", None, heartbeat_s);
                let hub = inner.hub.lock().unwrap().clone();
                if let Some(hub) = hub {
                    if let Err(e) = hub.send_frame(&peer, &frame).await {
                        warn!("Handshake request to {} failed: {:#}", peer, e);
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    /// Accepted-channel heartbeat: ping each interval, track missed
    /// beats, surface status transitions, mark timeout at 5 intervals.
    fn spawn_heartbeat(&self, node_id: String, epoch: u64) {
        let inner = self.arc();
        tokio::spawn(async move {
            loop {
                let live = {
                    let nodes = inner.nodes.lock().unwrap();
                    match nodes.get(&node_id) {
                        Some(n)
                            if n.epoch == epoch && n.handshake == HandshakeState::Accepted =>
                        {
                            Some((n.peer_address.clone(), n.remote_component_id.clone(), n.interval()))
                        }
                        _ => None,
                    }
                };
                let (peer, remote, interval) = match live {
                    Some(l) => l,
                    None => break,
                };
                let ctx = inner.frame_ctx(&node_id);
                let frame = ctx.heartbeat("ping", Some(&remote));
                let hub = inner.hub.lock().unwrap().clone();
                if let Some(hub) = hub {
                    if let Err(e) = hub.send_frame(&peer, &frame).await {
                        warn!("Heartbeat ping to {} failed: {:#}", peer, e);
                    }
                }
                tokio::time::sleep(interval).await;

                // Evaluate liveness after the interval elapsed.
                let status = {
                    let mut nodes = inner.nodes.lock().unwrap();
                    match nodes.get_mut(&node_id) {
                        Some(n)
                            if n.epoch == epoch && n.handshake == HandshakeState::Accepted =>
                        {
                            let since = n
                                .last_seen
                                .map(|t| t.elapsed())
                                .unwrap_or(Duration::from_secs(u64::MAX / 2));
                            if since > interval {
                                n.missed_beats += 1;
                            } else {
                                n.missed_beats = 0;
                            }
                            if since > interval * 5 {
                                if !n.disconnected {
                                    n.disconnected = true;
                                    n.log.warn("Peer timed out");
                                    Some(("error", "timeout"))
                                } else {
                                    None
                                }
                            } else if n.missed_beats >= CRITICAL_MISSED {
                                Some(("error", "critical"))
                            } else if n.missed_beats >= WARNING_MISSED {
                                Some(("warn", "warning"))
                            } else {
                                n.disconnected = false;
                                Some(("info", "online"))
                            }
                        }
                        _ => break,
                    }
                };
                if let Some((level, code)) = status {
                    inner.route_status(&node_id, level, code, &peer);
                }
            }
        });
    }

    fn on_inbound(&self, msg: &RelayInbound) {
        let frame = hydrate(&msg.payload);
        match frame_event(&frame) {
            "handshake" => self.on_handshake(&frame, &msg.from),
            "heartbeat" => self.on_heartbeat(&frame, &msg.from),
            "data" => self.on_data(&frame, &msg.from),
            _ => self.on_other(&frame, &msg.from),
        }
    }

    /// Candidate selection, in priority order: targeted component id,
    /// registered peer address, then graph-local open nodes.
    fn find_node(&self, frame: &Value, from: &str) -> Option<String> {
        let nodes = self.nodes.lock().unwrap();
        if let Some(target) = frame.get("targetId").and_then(|v| v.as_str()) {
            for id in nodes.keys() {
                if self.component_id(id) == target {
                    return Some(id.clone());
                }
            }
        }
        for (id, n) in nodes.iter() {
            if !n.peer_address.is_empty() && n.peer_address == from {
                return Some(id.clone());
            }
        }
        let graph_ok = target_graph_id(frame)
            .map(|g| g == self.graph_id)
            .unwrap_or(true);
        if graph_ok {
            for (id, n) in nodes.iter() {
                if n.peer_address.is_empty()
                    || n.auto_accept
                    || n.allowed_peers.iter().any(|p| p == from)
                {
                    return Some(id.clone());
                }
            }
        }
        None
    }

    fn on_handshake(&self, frame: &Value, from: &str) {
        let action = frame.get("action").and_then(|v| v.as_str()).unwrap_or("");
        let node_id = match self.find_node(frame, from) {
            Some(id) => id,
            None => {
                debug!("Handshake {} from {} with no candidate node", action, from);
                return;
            }
        };
        let remote = frame
            .get("componentId")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        match action {
            "request" => self.on_handshake_request(&node_id, from, &remote),
            "accept" => {
                let epoch = {
                    let mut nodes = self.nodes.lock().unwrap();
                    let n = match nodes.get_mut(&node_id) {
                        Some(n) => n,
                        None => return,
                    };
                    n.handshake = HandshakeState::Accepted;
                    n.direction = HandshakeDirection::Accepted;
                    n.peer_address = from.to_string();
                    n.remote_component_id = remote;
                    n.last_seen = Some(Instant::now());
                    n.missed_beats = 0;
                    n.disconnected = false;
                    n.epoch += 1;
                    n.log.info(format!("Handshake accepted by {}", from));
                    n.epoch
                };
                info!("Peer channel accepted ({} ↔ {})", node_id, from);
                self.spawn_heartbeat(node_id.clone(), epoch);
                self.route_status(&node_id, "info", "accepted", from);
            }
            "decline" => {
                {
                    let mut nodes = self.nodes.lock().unwrap();
                    if let Some(n) = nodes.get_mut(&node_id) {
                        n.handshake = HandshakeState::Declined;
                        n.direction = HandshakeDirection::Declined;
                        n.epoch += 1;
                        n.log.warn(format!("Handshake declined by {}", from));
                    }
                }
                self.route_status(&node_id, "warn", "declined", from);
            }
            "sync" => {
                let known = {
                    let mut nodes = self.nodes.lock().unwrap();
                    match nodes.get_mut(&node_id) {
                        Some(n)
                            if n.handshake == HandshakeState::Accepted
                                && n.peer_address == from =>
                        {
                            n.last_seen = Some(Instant::now());
                            n.epoch += 1;
                            Some((n.remote_component_id.clone(), n.heartbeat_s, n.epoch))
                        }
                        _ => None,
                    }
                };
                if let Some((remote, heartbeat_s, epoch)) = known {
                    let ctx = self.frame_ctx(&node_id);
                    self.spawn_send(
                        from.to_string(),
                        ctx.handshake("accept", Some(&remote), heartbeat_s),
                    );
                    self.spawn_heartbeat(node_id, epoch);
                }
            }
            other => debug!("Unknown handshake action {:?}", other),
        }
    }

    fn on_handshake_request(&self, node_id: &str, from: &str, remote: &str) {
        enum Outcome {
            Accept(u64),
            Invite,
        }
        let outcome = {
            let mut nodes = self.nodes.lock().unwrap();
            let n = match nodes.get_mut(node_id) {
                Some(n) => n,
                None => return,
            };
            let reassert = n.handshake == HandshakeState::Accepted && n.peer_address == from;
            let crossing = n.direction == HandshakeDirection::Outgoing && n.peer_address == from;
            let auto = n.auto_accept || n.allowed_peers.iter().any(|p| p == from);
            if reassert || crossing || auto {
                n.handshake = HandshakeState::Accepted;
                n.direction = HandshakeDirection::Accepted;
                n.peer_address = from.to_string();
                n.remote_component_id = remote.to_string();
                n.last_seen = Some(Instant::now());
                n.missed_beats = 0;
                n.disconnected = false;
                n.epoch += 1;
                n.log.info(format!("Handshake request from {} accepted", from));
                Outcome::Accept(n.epoch)
            } else {
                n.handshake = HandshakeState::Pending;
                n.direction = HandshakeDirection::Incoming;
                n.peer_address = from.to_string();
                n.remote_component_id = remote.to_string();
                n.log.info(format!("Handshake invite from {}", from));
                Outcome::Invite
            }
        };
        match outcome {
            Outcome::Accept(epoch) => {
                let ctx = self.frame_ctx(node_id);
                self.spawn_send(
                    from.to_string(),
                    ctx.handshake("accept", Some(remote), self.heartbeat_of(node_id)),
                );
                self.spawn_heartbeat(node_id.to_string(), epoch);
                self.route_status(node_id, "info", "accepted", from);
            }
            Outcome::Invite => {
                self.route_status(node_id, "info", "invite", from);
                let cb = self.on_invite.lock().unwrap().clone();
                if let Some(cb) = cb {
                    cb(Invite {
                        node_id: node_id.to_string(),
                        peer_address: from.to_string(),
                        remote_component_id: remote.to_string(),
                    });
                }
            }
        }
    }

    fn on_heartbeat(&self, frame: &Value, from: &str) {
        let action = frame.get("action").and_then(|v| v.as_str()).unwrap_or("");
        let node_id = match self.find_node(frame, from) {
            Some(id) => id,
            None => return,
        };
        let reply = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(&node_id) {
                Some(n) if n.handshake == HandshakeState::Accepted => {
                    n.last_seen = Some(Instant::now());
                    n.missed_beats = 0;
                    n.disconnected = false;
                    if action == "ping" {
                        Some(n.remote_component_id.clone())
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(remote) = reply {
            let ctx = self.frame_ctx(&node_id);
            self.spawn_send(from.to_string(), ctx.heartbeat("pong", Some(&remote)));
        }
    }

    fn on_data(&self, frame: &Value, from: &str) {
        let node_id = match self.find_node(frame, from) {
            Some(id) => id,
            None => {
                warn!("DM data from {} with no candidate node", from);
                // Best-effort UX: surface the miss on open nodes.
                let hinted: Vec<String> = {
                    let nodes = self.nodes.lock().unwrap();
                    nodes
                        .iter()
                        .filter(|(_, n)| n.peer_address.is_empty() || n.auto_accept)
                        .map(|(id, _)| id.clone())
                        .collect()
                };
                for id in hinted {
                    self.route_status(&id, "warn", "no-candidate", from);
                }
                return;
            }
        };
        let accepted = {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .get(&node_id)
                .map(|n| n.handshake == HandshakeState::Accepted)
                .unwrap_or(false)
        };
        if !accepted {
            debug!("Data from {} before handshake, dropped", from);
            self.route_status(&node_id, "warn", "handshake-not-accepted", from);
            return;
        }
        let id = frame.get("id").and_then(|v| v.as_str()).unwrap_or("");
        let seq = frame.get("seq").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let total = frame.get("total").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        let text = frame
            .get("text")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| decode_b64_text(frame));
        let text = match text {
            Some(t) => t,
            None => {
                self.route_status(&node_id, "warn", "missing-text", from);
                return;
            }
        };
        let assembled = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(&node_id) {
                Some(n) => {
                    n.last_seen = Some(Instant::now());
                    n.missed_beats = 0;
                    n.inbox.accept(id, seq, total, text)
                }
                None => None,
            }
        };
        if let Some(text) = assembled {
            let remote = frame
                .get("componentId")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            debug!("Assembled {} chars from {}", text.len(), from);
            self.router.send_from(
                &node_id,
                "incoming",
                &json!({
                    "nodeId": node_id,
                    "type": "text",
                    "text": text,
                    "from": from,
                    "componentId": remote,
                    "ts": frame.get("ts").cloned().unwrap_or(Value::Null),
                }),
            );
        }
    }

    /// Unrecognized DMs surface pretty-printed on the `raw` port.
    fn on_other(&self, frame: &Value, from: &str) {
        let pretty = best_text(frame);
        let targets: Vec<String> = match self.find_node(frame, from) {
            Some(id) => vec![id],
            None => self.nodes.lock().unwrap().keys().cloned().collect(),
        };
        for id in targets {
            self.router.send_from(
                &id,
                "raw",
                &json!({"nodeId": id, "type": "raw", "text": pretty, "from": from}),
            );
        }
    }
}

fn decode_b64_text(frame: &Value) -> Option<String> {
    for key in ["b64", "payload_b64", "body_b64"] {
        if let Some(s) = frame.get(key).and_then(|v| v.as_str()) {
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(s) {
                return Some(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::kv::MemoryKv;
    use crate::transport::relay::RelayFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> (PeerDmService, Arc<Router>) {
        let kv = Arc::new(MemoryKv::new());
        let factory: RelayFactory = Arc::new(|_| anyhow::bail!("no relay in unit tests"));
        let mux = TransportMux::new(
            Arc::clone(&kv) as Arc<dyn crate::graph::kv::KvStore>,
            factory,
        );
        let router = Arc::new(Router::new());
        let store = Arc::new(NodeStore::new(kv));
        let svc = PeerDmService::new(mux, Arc::clone(&router), store, "g1");
        (svc, router)
    }

    #[tokio::test]
    async fn test_outgoing_handshake_walk() {
        // P7: idle → pending/outgoing → accepted only after accept.
        let (svc, _router) = service();
        svc.add_node("dm1");
        assert_eq!(
            svc.handshake_state("dm1").unwrap(),
            (HandshakeState::Idle, HandshakeDirection::Idle)
        );
        svc.connect("dm1", "peer.remote");
        assert_eq!(
            svc.handshake_state("dm1").unwrap(),
            (HandshakeState::Pending, HandshakeDirection::Outgoing)
        );
        svc.inject_inbound(
            "peer.remote",
            json!({"event": "handshake", "action": "accept", "componentId": "g2:dmX"}),
        );
        assert_eq!(
            svc.handshake_state("dm1").unwrap(),
            (HandshakeState::Accepted, HandshakeDirection::Accepted)
        );
    }

    #[tokio::test]
    async fn test_incoming_handshake_invite_then_accept() {
        let (svc, _router) = service();
        svc.add_node("dm1");
        let invites = Arc::new(Mutex::new(Vec::new()));
        {
            let invites = Arc::clone(&invites);
            svc.on_invite(move |inv| invites.lock().unwrap().push(inv));
        }
        svc.inject_inbound(
            "peer.guest",
            json!({"event": "handshake", "action": "request", "componentId": "g2:dmY"}),
        );
        assert_eq!(
            svc.handshake_state("dm1").unwrap(),
            (HandshakeState::Pending, HandshakeDirection::Incoming)
        );
        assert_eq!(invites.lock().unwrap().len(), 1);
        svc.respond_invite("dm1", true);
        assert_eq!(
            svc.handshake_state("dm1").unwrap(),
            (HandshakeState::Accepted, HandshakeDirection::Accepted)
        );
    }

    #[tokio::test]
    async fn test_incoming_decline() {
        let (svc, _router) = service();
        svc.add_node("dm1");
        svc.inject_inbound(
            "peer.guest",
            json!({"event": "handshake", "action": "request", "componentId": "g2:dmY"}),
        );
        svc.respond_invite("dm1", false);
        assert_eq!(
            svc.handshake_state("dm1").unwrap(),
            (HandshakeState::Declined, HandshakeDirection::Declined)
        );
    }

    #[tokio::test]
    async fn test_auto_accept_bypasses_invite() {
        let (svc, _router) = service();
        svc.inner
            .store
            .ensure("dm1", NodeKind::PeerDm);
        svc.inner
            .store
            .update("dm1", json!({"autoAccept": true}));
        svc.add_node("dm1");
        svc.inject_inbound(
            "peer.any",
            json!({"event": "handshake", "action": "request", "componentId": "g2:dmZ"}),
        );
        assert_eq!(
            svc.handshake_state("dm1").unwrap().0,
            HandshakeState::Accepted
        );
    }

    #[tokio::test]
    async fn test_data_before_accept_surfaces_status() {
        let (svc, router) = service();
        svc.add_node("dm1");
        let codes = Arc::new(Mutex::new(Vec::new()));
        {
            let codes = Arc::clone(&codes);
            router.register(PortAddress::input("sink", "s"), move |payload| {
                codes
                    .lock()
                    .unwrap()
                    .push(payload["code"].as_str().unwrap_or("").to_string());
            });
        }
        router
            .add_wire(
                PortAddress::output("dm1", "status"),
                PortAddress::input("sink", "s"),
            )
            .unwrap();
        svc.inject_inbound(
            "peer.stranger",
            json!({"event": "data", "id": "b", "seq": 1, "total": 1, "text": "hi"}),
        );
        assert_eq!(*codes.lock().unwrap(), vec!["handshake-not-accepted"]);
    }

    #[tokio::test]
    async fn test_chunked_data_assembles_to_incoming() {
        let (svc, router) = service();
        svc.add_node("dm1");
        // Establish the channel first.
        svc.connect("dm1", "peer.remote");
        svc.inject_inbound(
            "peer.remote",
            json!({"event": "handshake", "action": "accept", "componentId": "g2:dmX"}),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            router.register(PortAddress::input("sink", "s"), move |payload| {
                seen.lock()
                    .unwrap()
                    .push(payload["text"].as_str().unwrap_or("").to_string());
            });
        }
        router
            .add_wire(
                PortAddress::output("dm1", "incoming"),
                PortAddress::input("sink", "s"),
            )
            .unwrap();
        // Three chunks, delivered out of order.
        for (seq, part) in [(2, "world"), (1, "hello "), (3, "!")] {
            svc.inject_inbound(
                "peer.remote",
                json!({"event": "data", "id": "b1", "seq": seq, "total": 3, "text": part}),
            );
        }
        assert_eq!(*seen.lock().unwrap(), vec!["hello world!"]);
    }

    #[tokio::test]
    async fn test_ping_updates_liveness() {
        let (svc, _router) = service();
        svc.add_node("dm1");
        svc.connect("dm1", "peer.remote");
        svc.inject_inbound(
            "peer.remote",
            json!({"event": "handshake", "action": "accept", "componentId": "g2:dmX"}),
        );
        svc.inject_inbound("peer.remote", json!({"event": "heartbeat", "action": "ping"}));
        let nodes = svc.inner.nodes.lock().unwrap();
        let n = nodes.get("dm1").unwrap();
        assert!(n.last_seen.is_some());
        assert_eq!(n.missed_beats, 0);
    }

    #[tokio::test]
    async fn test_no_candidate_data_warns_open_nodes() {
        let (svc, router) = service();
        svc.inner.store.ensure("dm1", NodeKind::PeerDm);
        svc.add_node("dm1");
        // Bind dm1 to a different peer so the stranger has no candidate.
        svc.connect("dm1", "peer.known");
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            router.register(PortAddress::input("sink", "s"), move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        router
            .add_wire(
                PortAddress::output("dm1", "status"),
                PortAddress::input("sink", "s"),
            )
            .unwrap();
        svc.inject_inbound(
            "peer.stranger",
            json!({"event": "data", "id": "b", "seq": 1, "total": 1, "text": "lost", "targetId": "gX:other"}),
        );
        // dm1 is bound (not open), so it gets no hint; the drop is logged only.
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_raw_port_for_unknown_frames() {
        let (svc, router) = service();
        svc.add_node("dm1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            router.register(PortAddress::input("sink", "s"), move |payload| {
                seen.lock()
                    .unwrap()
                    .push(payload["text"].as_str().unwrap_or("").to_string());
            });
        }
        router
            .add_wire(
                PortAddress::output("dm1", "raw"),
                PortAddress::input("sink", "s"),
            )
            .unwrap();
        svc.inject_inbound(
            "peer.dbg",
            json!({"event": "debug", "action": "trace", "note": "hello debugger"}),
        );
        assert_eq!(*seen.lock().unwrap(), vec!["hello debugger"]);
    }
}
