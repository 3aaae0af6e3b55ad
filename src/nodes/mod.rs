//! Producer nodes: user text input and variable templates
//!
//! `TextInput` is the trivial producer the editor binds to a text box.
//! `Template` renders a `{{var}}` template from its dynamically created
//! variable in-ports whenever `trigger` fires.

use crate::graph::router::Router;
use crate::graph::store::NodeStore;
use crate::types::{text_message, PortAddress};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

static TEMPLATE_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("template pattern"));

/// User text entry node: `submit` routes on the `text` out-port.
pub struct TextInputNode {
    node_id: String,
    router: Arc<Router>,
}

impl TextInputNode {
    pub fn new(node_id: impl Into<String>, router: Arc<Router>) -> Self {
        Self {
            node_id: node_id.into(),
            router,
        }
    }

    pub fn submit(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.router
            .send_from(&self.node_id, "text", &text_message(&self.node_id, text));
    }
}

/// Names of the `{{var}}` placeholders in a template, in first-use order.
pub fn template_variables(template: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in TEMPLATE_VAR.captures_iter(template) {
        let name = caps[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Substitute `{{var}}` placeholders; unset variables render empty.
pub fn render_template(template: &str, values: &HashMap<String, String>) -> String {
    TEMPLATE_VAR
        .replace_all(template, |caps: &regex::Captures| {
            values.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

struct TemplateInner {
    node_id: String,
    router: Arc<Router>,
    store: Arc<NodeStore>,
    template: Mutex<String>,
    values: Mutex<HashMap<String, String>>,
}

/// Template node: one in-port per variable plus `trigger`.
#[derive(Clone)]
pub struct TemplateNode {
    inner: Arc<TemplateInner>,
}

impl TemplateNode {
    pub fn new(
        node_id: impl Into<String>,
        template: impl Into<String>,
        router: Arc<Router>,
        store: Arc<NodeStore>,
    ) -> Self {
        Self {
            inner: Arc::new(TemplateInner {
                node_id: node_id.into(),
                router,
                store,
                template: Mutex::new(template.into()),
                values: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register `trigger` and the per-variable in-ports.
    pub fn attach(&self) {
        let template = self.inner.template.lock().unwrap().clone();
        for var in template_variables(&template) {
            self.register_variable(&var);
        }
        let inner = Arc::clone(&self.inner);
        self.inner.router.register(
            PortAddress::input(self.inner.node_id.clone(), "trigger"),
            move |_payload| inner.fire(),
        );
    }

    /// Swap the template, re-registering variable ports.
    pub fn set_template(&self, template: &str) {
        let old = {
            let mut t = self.inner.template.lock().unwrap();
            std::mem::replace(&mut *t, template.to_string())
        };
        for var in template_variables(&old) {
            self.inner
                .router
                .unregister(&PortAddress::input(self.inner.node_id.clone(), var));
        }
        for var in template_variables(template) {
            self.register_variable(&var);
        }
        self.inner
            .store
            .update(&self.inner.node_id, json!({"template": template}));
    }

    pub fn variables(&self) -> Vec<String> {
        template_variables(&self.inner.template.lock().unwrap())
    }

    fn register_variable(&self, var: &str) {
        let inner = Arc::clone(&self.inner);
        let name = var.to_string();
        self.inner.router.register(
            PortAddress::input(self.inner.node_id.clone(), var.to_string()),
            move |payload| {
                let text = crate::types::normalize_payload(payload).text;
                inner.values.lock().unwrap().insert(name.clone(), text);
            },
        );
    }
}

impl TemplateInner {
    fn fire(&self) {
        let template = self.template.lock().unwrap().clone();
        let values = self.values.lock().unwrap().clone();
        let rendered = render_template(&template, &values);
        if rendered.trim().is_empty() {
            debug!("Template {} rendered empty, not routing", self.node_id);
            return;
        }
        self.router
            .send_from(&self.node_id, "text", &text_message(&self.node_id, &rendered));
    }
}
