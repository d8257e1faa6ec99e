//! `runtime.sendMessage` / `runtime.onMessage`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use bmc_compat::{CompatError, HostCallback, HostPrimitive, HostPromise, Responder};
use bmc_messaging::{Inbox, MessagingError, RuntimeHost, RuntimeRequest};
use js_sys::Function;
use serde_json::Value;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

use crate::host::{bridge, call, completion, host_failure, lookup, namespace, to_js, to_json};

thread_local! {
    // `sendResponse` functions waiting for the dispatcher's answer.
    static PENDING: RefCell<HashMap<u64, Function>> = RefCell::new(HashMap::new());
    static NEXT_REPLY: Cell<u64> = const { Cell::new(0) };
}

/// Parks `send_response` and returns a `Send` responder that finds it again.
fn park(send_response: Function) -> Responder {
    let id = NEXT_REPLY.with(|next| {
        let id = next.get();
        next.set(id.wrapping_add(1));
        id
    });
    PENDING.with(|pending| pending.borrow_mut().insert(id, send_response));
    Box::new(move |value: Value| {
        let Some(send_response) = PENDING.with(|pending| pending.borrow_mut().remove(&id)) else {
            return;
        };
        let answer = to_js(&value).unwrap_or(JsValue::NULL);
        if let Err(err) = send_response.call1(&JsValue::NULL, &answer) {
            gloo_console::warn!("sendResponse failed", err);
        }
    })
}

pub(crate) fn runtime() -> Result<JsValue, CompatError> {
    namespace()
        .and_then(|namespace| lookup(&namespace, &["runtime"]))
        .ok_or_else(|| host_failure("extension runtime is unavailable"))
}

/// Absolute URL of a packaged resource; `""` gives the extension base URL.
pub fn extension_url(path: &str) -> Option<String> {
    call(&runtime().ok()?, "getURL", &[JsValue::from_str(path)]).ok()?.as_string()
}

pub struct ExtensionRuntime;

impl HostPrimitive for ExtensionRuntime {
    type Args = Value;

    fn call_with_callback(&self, args: Value, done: HostCallback) -> Result<(), CompatError> {
        call(&runtime()?, "sendMessage", &[to_js(&args)?, completion(done)]).map(drop)
    }

    fn call_with_promise(&self, args: Value) -> Result<HostPromise, CompatError> {
        bridge(call(&runtime()?, "sendMessage", &[to_js(&args)?])?)
    }
}

impl RuntimeHost for ExtensionRuntime {
    fn listen(&self, inbox: Inbox<RuntimeRequest>) -> Result<(), MessagingError> {
        let on_message = lookup(&runtime()?, &["onMessage"]).ok_or_else(|| host_failure("runtime.onMessage is unavailable"))?;
        let listener = Closure::<dyn FnMut(JsValue, JsValue, JsValue) -> bool>::new(
            move |message: JsValue, sender: JsValue, send_response: JsValue| {
                let mut request = RuntimeRequest::new(to_json(message));
                request.origin = lookup(&sender, &["origin"])
                    .or_else(|| lookup(&sender, &["url"]))
                    .and_then(|origin| origin.as_string());
                if let Ok(send_response) = send_response.dyn_into::<Function>() {
                    request = request.with_responder(park(send_response));
                }
                // Every request is answered later, from the dispatch loop.
                inbox.send(request).is_ok()
            },
        );
        call(&on_message, "addListener", &[listener.into_js_value()])?;
        Ok(())
    }
}
