//! Typed port/wire router
//!
//! Publish/subscribe of messages keyed by port addresses. Wires fan out
//! from output ports; input ports are exclusive. Delivery is synchronous
//! against a snapshot of the wire table, so concurrent wire edits never
//! cause missed or duplicated delivery within one send.

use crate::types::{Direction, PortAddress, Wire};
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;
type WireListener = Arc<dyn Fn(&WireEvent) + Send + Sync>;

/// Wire table mutation notifications
#[derive(Debug, Clone)]
pub enum WireEvent {
    Added(Wire),
    Removed(Wire),
}

struct RouterInner {
    handlers: HashMap<PortAddress, Handler>,
    wires: Vec<Wire>,
}

/// Message router over the user-edited wire set.
pub struct Router {
    inner: Mutex<RouterInner>,
    listeners: Mutex<Vec<WireListener>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner {
                handlers: HashMap::new(),
                wires: Vec::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Attach a handler to a port address, replacing any prior handler.
    pub fn register(&self, addr: PortAddress, handler: impl Fn(&Value) + Send + Sync + 'static) {
        let mut inner = self.inner.lock().unwrap();
        inner.handlers.insert(addr, Arc::new(handler));
    }

    pub fn unregister(&self, addr: &PortAddress) {
        let mut inner = self.inner.lock().unwrap();
        inner.handlers.remove(addr);
    }

    /// Remove every handler and wire touching `node_id` (node teardown).
    pub fn remove_node(&self, node_id: &str) {
        let removed: Vec<Wire> = {
            let mut inner = self.inner.lock().unwrap();
            inner.handlers.retain(|addr, _| addr.node != node_id);
            let (gone, kept): (Vec<Wire>, Vec<Wire>) = inner
                .wires
                .drain(..)
                .partition(|w| w.from.node == node_id || w.to.node == node_id);
            inner.wires = kept;
            gone
        };
        for wire in removed {
            self.notify(WireEvent::Removed(wire));
        }
    }

    /// Deliver `payload` from `node_id`'s output port to every wired input.
    ///
    /// Handlers run synchronously in wire insertion order; a handler that
    /// panics is contained and later subscribers still receive the message.
    /// Delivery to an input with no registered handler is a silent no-op.
    pub fn send_from(&self, node_id: &str, port: &str, payload: &Value) {
        let from = PortAddress::output(node_id, port);
        let targets: Vec<(PortAddress, Option<Handler>)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .wires
                .iter()
                .filter(|w| w.from == from)
                .map(|w| (w.to.clone(), inner.handlers.get(&w.to).cloned()))
                .collect()
        };
        for (to, handler) in targets {
            match handler {
                Some(h) => {
                    if catch_unwind(AssertUnwindSafe(|| h(payload))).is_err() {
                        warn!("Handler for {} panicked; delivery continues", to);
                    }
                }
                // Node may be concurrently torn down.
                None => debug!("No handler at {}, dropping", to),
            }
        }
    }

    /// Add a wire. Idempotent; a second wire into an occupied input
    /// replaces the prior wire and fires a removal event for it.
    pub fn add_wire(&self, from: PortAddress, to: PortAddress) -> Result<()> {
        if from.direction != Direction::Out || to.direction != Direction::In {
            bail!("Wire must run out → in: {} → {}", from, to);
        }
        if from.node == to.node {
            bail!("Self-loop rejected: {} → {}", from, to);
        }
        let wire = Wire::new(from, to);
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.wires.contains(&wire) {
                return Ok(());
            }
            if let Some(idx) = inner.wires.iter().position(|w| w.to == wire.to) {
                let prior = inner.wires.remove(idx);
                events.push(WireEvent::Removed(prior));
            }
            inner.wires.push(wire.clone());
            events.push(WireEvent::Added(wire));
        }
        for ev in events {
            self.notify(ev);
        }
        Ok(())
    }

    pub fn remove_wire(&self, from: &PortAddress, to: &PortAddress) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let idx = inner.wires.iter().position(|w| &w.from == from && &w.to == to);
            idx.map(|i| inner.wires.remove(i))
        };
        if let Some(wire) = removed {
            self.notify(WireEvent::Removed(wire));
        }
    }

    pub fn list_wires(&self) -> Vec<Wire> {
        self.inner.lock().unwrap().wires.clone()
    }

    /// Observe wire table mutations (editor sync, durable wire set).
    pub fn on_wire_event(&self, listener: impl Fn(&WireEvent) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Arc::new(listener));
    }

    fn notify(&self, event: WireEvent) {
        let listeners = self.listeners.lock().unwrap().clone();
        for l in listeners {
            l(&event);
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wire(from: &str, to: &str) -> (PortAddress, PortAddress) {
        (from.parse().unwrap(), to.parse().unwrap())
    }

    #[test]
    fn test_fan_out_in_insertion_order() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for id in ["b", "c"] {
            let seen = Arc::clone(&seen);
            let id = id.to_string();
            router.register(PortAddress::input(id.clone(), "x"), move |_| {
                seen.lock().unwrap().push(id.clone());
            });
        }
        let (f, t) = wire("a:out:x", "b:in:x");
        router.add_wire(f, t).unwrap();
        let (f, t) = wire("a:out:x", "c:in:x");
        router.add_wire(f, t).unwrap();
        router.send_from("a", "x", &json!({"text": "hi"}));
        assert_eq!(*seen.lock().unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn test_input_exclusive_replacement() {
        // Scenario 4: second producer into the same input takes over.
        let router = Router::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            router.register(PortAddress::input("B", "y"), move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        let removed = Arc::new(Mutex::new(Vec::new()));
        {
            let removed = Arc::clone(&removed);
            router.on_wire_event(move |ev| {
                if let WireEvent::Removed(w) = ev {
                    removed.lock().unwrap().push(w.from.node.clone());
                }
            });
        }
        let (f, t) = wire("A:out:x", "B:in:y");
        router.add_wire(f, t).unwrap();
        let (f, t) = wire("A2:out:x", "B:in:y");
        router.add_wire(f, t).unwrap();

        router.send_from("A", "x", &json!("ignored"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        router.send_from("A2", "x", &json!("delivered"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*removed.lock().unwrap(), vec!["A"]);
    }

    #[test]
    fn test_add_wire_idempotent() {
        let router = Router::new();
        let (f, t) = wire("a:out:x", "b:in:y");
        router.add_wire(f.clone(), t.clone()).unwrap();
        router.add_wire(f, t).unwrap();
        assert_eq!(router.list_wires().len(), 1);
    }

    #[test]
    fn test_self_loop_rejected() {
        let router = Router::new();
        let (f, t) = wire("a:out:x", "a:in:y");
        assert!(router.add_wire(f, t).is_err());
    }

    #[test]
    fn test_missing_handler_is_noop() {
        let router = Router::new();
        let (f, t) = wire("a:out:x", "ghost:in:y");
        router.add_wire(f, t).unwrap();
        router.send_from("a", "x", &json!(1)); // must not panic
    }

    #[test]
    fn test_snapshot_delivery_under_mutation() {
        // P4: wire removal inside a handler does not affect the current send.
        let router = Arc::new(Router::new());
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let router2 = Arc::clone(&router);
            let hits = Arc::clone(&hits);
            router.register(PortAddress::input("b", "y"), move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                // Tear down the other wire mid-delivery.
                router2.remove_wire(
                    &"a:out:x".parse().unwrap(),
                    &"c:in:y".parse().unwrap(),
                );
            });
        }
        {
            let hits = Arc::clone(&hits);
            router.register(PortAddress::input("c", "y"), move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        let (f, t) = wire("a:out:x", "b:in:y");
        router.add_wire(f, t).unwrap();
        let (f, t) = wire("a:out:x", "c:in:y");
        router.add_wire(f, t).unwrap();
        router.send_from("a", "x", &json!(1));
        // Both subscribers of the entry snapshot were invoked.
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        // The mutation took effect for the next send.
        router.send_from("a", "x", &json!(2));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_handler_contained() {
        let router = Router::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.register(PortAddress::input("b", "y"), |_| panic!("boom"));
        {
            let hits = Arc::clone(&hits);
            router.register(PortAddress::input("c", "y"), move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        let (f, t) = wire("a:out:x", "b:in:y");
        router.add_wire(f, t).unwrap();
        let (f, t) = wire("a:out:x", "c:in:y");
        router.add_wire(f, t).unwrap();
        router.send_from("a", "x", &json!(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_node_tears_down_wires() {
        let router = Router::new();
        let (f, t) = wire("a:out:x", "b:in:y");
        router.add_wire(f, t).unwrap();
        router.remove_node("b");
        assert!(router.list_wires().is_empty());
    }
}
