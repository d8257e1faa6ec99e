//! Background page: `runtime.onConnect` ports as the channel the background
//! handlers serve, and the relay of store changes to the content scripts.
//!
//! Ports live in a thread-local table; peers only keep its key, which keeps
//! them `Send + Sync` like the other hosts.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;

use bmc_api_types::Message;
use bmc_compat::{CompatError, CompatibilityLayer, HostCallback, HostPrimitive, HostPromise};
use bmc_engine::STORE_CHANGES;
use bmc_messaging::{ChannelEvent, ChannelHost, ConnectionId, Inbox, MessagingError, PeerSink};
use serde_json::Value;
use wasm_bindgen::prelude::*;

use crate::host::{bridge, call, completion, host_failure, lookup, namespace, to_js, to_json};
use crate::runtime::runtime;

thread_local! {
    static PORTS: RefCell<HashMap<u64, JsValue>> = RefCell::new(HashMap::new());
    static NEXT_PORT: Cell<u64> = const { Cell::new(0) };
}

/// `scheme://host` of `url`; extension page URLs carry a path.
fn origin_of(url: &str) -> &str {
    let Some(scheme_end) = url.find("://") else {
        return url;
    };
    let host_start = scheme_end + 3;
    match url[host_start..].find('/') {
        Some(path) => &url[..host_start + path],
        None => url,
    }
}

/// Notifications the content script of the sender's tab re-resolves on.
fn is_store_change(data: &Value) -> bool {
    Message::from_value(data.clone()).is_ok_and(|message| {
        message
            .as_notification()
            .is_some_and(|note| STORE_CHANGES.iter().any(|operation| note.is_operation(operation)))
    })
}

fn tabs() -> Result<JsValue, CompatError> {
    namespace()
        .and_then(|namespace| lookup(&namespace, &["tabs"]))
        .ok_or_else(|| host_failure("tabs API is unavailable"))
}

/// `tabs.sendMessage(tab, data)`.
struct TabMessage;

impl HostPrimitive for TabMessage {
    type Args = (i32, Value);

    fn call_with_callback(&self, (tab, data): (i32, Value), done: HostCallback) -> Result<(), CompatError> {
        call(&tabs()?, "sendMessage", &[JsValue::from(tab), to_js(&data)?, completion(done)]).map(drop)
    }

    fn call_with_promise(&self, (tab, data): (i32, Value)) -> Result<HostPromise, CompatError> {
        bridge(call(&tabs()?, "sendMessage", &[JsValue::from(tab), to_js(&data)?])?)
    }
}

fn relay(compat: CompatibilityLayer, tab: i32, data: Value) {
    wasm_bindgen_futures::spawn_local(async move {
        // Tabs showing no reader have no content script to answer.
        if let Err(err) = compat.invoke(&TabMessage, (tab, data)).await {
            gloo_console::debug!(format!("tab {tab} not reached: {err}"));
        }
    });
}

/// One connected sidebar or options page.
struct ExtensionPort {
    key: u64,
    /// Tab hosting the sender; the sidebar frame shares it with the reader.
    tab: Option<i32>,
    compat: CompatibilityLayer,
}

impl PeerSink for ExtensionPort {
    fn post(&self, data: Value) -> Result<(), MessagingError> {
        let port = PORTS
            .with(|ports| ports.borrow().get(&self.key).cloned())
            .ok_or_else(|| MessagingError::Closed(format!("port {} disconnected", self.key)))?;
        if let Some(tab) = self.tab
            && is_store_change(&data)
        {
            relay(self.compat, tab, data.clone());
        }
        call(&port, "postMessage", &[to_js(&data)?])?;
        Ok(())
    }
}

/// `runtime.onConnect` of the background page.
pub struct ExtensionPorts {
    compat: CompatibilityLayer,
}

impl ExtensionPorts {
    pub fn new(compat: CompatibilityLayer) -> Self {
        Self { compat }
    }
}

fn accept(port: JsValue, compat: CompatibilityLayer, inbox: &Inbox<ChannelEvent>) -> Result<(), CompatError> {
    let id = ConnectionId::new();
    let key = NEXT_PORT.with(|next| {
        let key = next.get();
        next.set(key.wrapping_add(1));
        key
    });
    let label = lookup(&port, &["name"])
        .and_then(|name| name.as_string())
        .unwrap_or_default();
    let sender = lookup(&port, &["sender"]);
    let origin = sender
        .as_ref()
        .and_then(|sender| lookup(sender, &["origin"]).or_else(|| lookup(sender, &["url"])))
        .and_then(|origin| origin.as_string())
        .map(|origin| origin_of(&origin).to_owned());
    let tab = sender
        .as_ref()
        .and_then(|sender| lookup(sender, &["tab", "id"]))
        .and_then(|id| id.as_f64())
        .map(|id| id as i32);

    let on_message = lookup(&port, &["onMessage"]).ok_or_else(|| host_failure("port.onMessage is unavailable"))?;
    let on_disconnect =
        lookup(&port, &["onDisconnect"]).ok_or_else(|| host_failure("port.onDisconnect is unavailable"))?;

    let messages = inbox.clone();
    let listener = Closure::<dyn FnMut(JsValue)>::new(move |data: JsValue| {
        let _ = messages.send(ChannelEvent::Message { id, data: to_json(data) });
    });
    call(&on_message, "addListener", &[listener.into_js_value()])?;

    let disconnects = inbox.clone();
    let listener = Closure::<dyn FnMut(JsValue)>::new(move |_: JsValue| {
        PORTS.with(|ports| ports.borrow_mut().remove(&key));
        let _ = disconnects.send(ChannelEvent::Disconnect { id });
    });
    call(&on_disconnect, "addListener", &[listener.into_js_value()])?;

    PORTS.with(|ports| ports.borrow_mut().insert(key, port));
    let sink = Arc::new(ExtensionPort { key, tab, compat });
    let _ = inbox.send(ChannelEvent::Connect {
        id,
        label,
        origin,
        sink,
    });
    Ok(())
}

impl ChannelHost for ExtensionPorts {
    fn listen(&self, inbox: Inbox<ChannelEvent>) -> Result<(), MessagingError> {
        let on_connect =
            lookup(&runtime()?, &["onConnect"]).ok_or_else(|| host_failure("runtime.onConnect is unavailable"))?;
        let compat = self.compat;
        let listener = Closure::<dyn FnMut(JsValue)>::new(move |port: JsValue| {
            if let Err(err) = accept(port, compat, &inbox) {
                gloo_console::warn!(format!("port not accepted: {err}"));
            }
        });
        call(&on_connect, "addListener", &[listener.into_js_value()])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmc_api_types::Notification;
    use serde_json::json;

    #[test]
    fn port_origins_drop_the_page_path() {
        assert_eq!(origin_of("chrome-extension://abc/sidebar.html?hostOrigin=x"), "chrome-extension://abc");
        assert_eq!(origin_of("moz-extension://4a1c"), "moz-extension://4a1c");
        assert_eq!(origin_of("about:blank"), "about:blank");
    }

    #[test]
    fn only_store_changes_reach_the_tabs() {
        let register = Message::notification(Notification::new("Register Comic")).to_value();
        assert!(is_store_change(&register));
        let export = Message::notification(Notification::new("export")).to_value();
        assert!(!is_store_change(&export));
        assert!(!is_store_change(&json!({"type": "action", "action": "Refresh"})));
    }
}
