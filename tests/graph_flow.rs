//! End-to-end graph flows over an in-process relay pair
//!
//! Two graph instances (A and B) share a loopback datagram transport:
//! everything instance A sends to B's address lands on B's inbound
//! channel and vice versa. No network, no real services.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voicegraph::transport::relay::RELAY_SEED_KEY;
use voicegraph::{
    KvStore, MemoryKv, NodeKind, NodeStore, PeerDmService, PortAddress, RelayClient, RelayFactory,
    RelayInbound, Router, SendOptions, TemplateNode, TextInputNode, TransportMux,
};

/// One side of a loopback relay pair.
struct LoopRelay {
    address: String,
    peer_tx: Mutex<Option<mpsc::UnboundedSender<RelayInbound>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayInbound>>>,
}

impl LoopRelay {
    fn pair(addr_a: &str, addr_b: &str) -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            address: addr_a.to_string(),
            peer_tx: Mutex::new(Some(tx_b)),
            inbound_rx: Mutex::new(Some(rx_a)),
        });
        let b = Arc::new(Self {
            address: addr_b.to_string(),
            peer_tx: Mutex::new(Some(tx_a)),
            inbound_rx: Mutex::new(Some(rx_b)),
        });
        (a, b)
    }
}

#[async_trait]
impl RelayClient for LoopRelay {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn seed(&self) -> Option<Value> {
        Some(json!(format!("seed:{}", self.address)))
    }

    async fn send(&self, _dest: &str, payload: Vec<u8>, _opts: SendOptions) -> Result<()> {
        let tx = self.peer_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(RelayInbound {
                from: self.address.clone(),
                payload,
            });
        }
        Ok(())
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<RelayInbound>> {
        self.inbound_rx.lock().unwrap().take()
    }
}

struct Instance {
    kv: Arc<dyn KvStore>,
    router: Arc<Router>,
    store: Arc<NodeStore>,
    mux: Arc<TransportMux>,
}

fn instance(relay: Arc<LoopRelay>) -> Instance {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let factory: RelayFactory = Arc::new(move |_seed| Ok(Arc::clone(&relay) as Arc<dyn RelayClient>));
    let mux = TransportMux::new(Arc::clone(&kv), factory);
    let router = Arc::new(Router::new());
    let store = Arc::new(NodeStore::new(Arc::clone(&kv)));
    Instance {
        kv,
        router,
        store,
        mux,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_peer_dm_handshake_and_chunked_text() {
    let (relay_a, relay_b) = LoopRelay::pair("addr.a", "addr.b");
    let a = instance(relay_a);
    let b = instance(relay_b);

    let svc_a = PeerDmService::new(
        Arc::clone(&a.mux),
        Arc::clone(&a.router),
        Arc::clone(&a.store),
        "graph-a",
    );
    let svc_b = PeerDmService::new(
        Arc::clone(&b.mux),
        Arc::clone(&b.router),
        Arc::clone(&b.store),
        "graph-b",
    );
    svc_a.attach().await.unwrap();
    svc_b.attach().await.unwrap();

    // B auto-accepts incoming handshakes.
    b.store.ensure("dm-b", NodeKind::PeerDm);
    b.store.update("dm-b", json!({"autoAccept": true}));
    svc_b.add_node("dm-b");

    // Collect whatever lands on B's incoming port.
    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        b.router.register(PortAddress::input("sink", "s"), move |payload| {
            received
                .lock()
                .unwrap()
                .push(payload["text"].as_str().unwrap_or("").to_string());
        });
    }
    b.router
        .add_wire(
            PortAddress::output("dm-b", "incoming"),
            PortAddress::input("sink", "s"),
        )
        .unwrap();

    // A initiates toward B's relay address.
    svc_a.add_node("dm-a");
    svc_a.connect("dm-a", "addr.b");

    wait_until(|| {
        matches!(
            svc_a.handshake_state("dm-a"),
            Some((voicegraph::peer::HandshakeState::Accepted, _))
        )
    })
    .await;

    // A 6000-char message must chunk, travel, and reassemble intact.
    let text: String = (0..6000)
        .map(|i| ((b'a' + (i % 26) as u8) as char))
        .collect();
    svc_a.send_text("dm-a", &text);

    let expected = text.clone();
    let received2 = Arc::clone(&received);
    wait_until(move || received2.lock().unwrap().first() == Some(&expected)).await;
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_relay_seed_persisted_on_attach() {
    let (relay_a, _relay_b) = LoopRelay::pair("addr.a", "addr.b");
    let a = instance(relay_a);
    let svc = PeerDmService::new(
        Arc::clone(&a.mux),
        Arc::clone(&a.router),
        Arc::clone(&a.store),
        "graph-a",
    );
    let addr = svc.attach().await.unwrap();
    assert_eq!(addr, "addr.a");
    assert_eq!(a.kv.get(RELAY_SEED_KEY).unwrap(), json!("seed:addr.a"));
}

#[tokio::test]
async fn test_text_input_through_template_chain() {
    let (relay_a, _relay_b) = LoopRelay::pair("addr.a", "addr.b");
    let a = instance(relay_a);

    a.store.ensure("tpl", NodeKind::Template);
    let template = TemplateNode::new(
        "tpl",
        "User said: {{speech}}",
        Arc::clone(&a.router),
        Arc::clone(&a.store),
    );
    template.attach();
    let input = TextInputNode::new("in", Arc::clone(&a.router));

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        a.router.register(PortAddress::input("sink", "s"), move |payload| {
            seen.lock()
                .unwrap()
                .push(payload["text"].as_str().unwrap_or("").to_string());
        });
    }
    a.router
        .add_wire(
            PortAddress::output("in", "text"),
            PortAddress::input("tpl", "speech"),
        )
        .unwrap();
    a.router
        .add_wire(
            PortAddress::output("in", "text"),
            PortAddress::input("tpl", "trigger"),
        )
        .unwrap();
    a.router
        .add_wire(
            PortAddress::output("tpl", "text"),
            PortAddress::input("sink", "s"),
        )
        .unwrap();

    input.submit("turn on the lights");
    assert_eq!(*seen.lock().unwrap(), vec!["User said: turn on the lights"]);
}

#[tokio::test]
async fn test_workspace_restore_rebuilds_wires() {
    let (relay_a, _relay_b) = LoopRelay::pair("addr.a", "addr.b");
    let a = instance(relay_a);
    a.store.ensure("in", NodeKind::TextInput);
    a.store.ensure("tts", NodeKind::Tts);
    a.kv.set(
        "graph.workspace",
        json!({
            "nodes": ["in", "tts"],
            "links": [{"from": "in:out:text", "to": "tts:in:text"}],
            "nodeConfigs": {"tts": {"voice": "tenor"}}
        }),
    );
    let applied = a.store.restore_workspace(&a.router).unwrap();
    assert_eq!(applied, 1);
    assert_eq!(a.router.list_wires().len(), 1);
    assert_eq!(a.store.load("tts").unwrap().str_field("voice"), "tenor");
}
