//! Reaching the extension API from Rust.
//!
//! Nothing JS-side is stored in a host struct: every call looks the global up
//! again, which keeps the host types `Send + Sync`. Promises are driven on the
//! local executor and handed back through a oneshot.

use bmc_compat::{CompatError, HostCallback, HostEnvironment, HostPromise};
use futures::FutureExt;
use js_sys::{Array, Function, Promise, Reflect};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

/// `root.a.b.c`, or `None` as soon as a step is null or undefined.
pub fn lookup(root: &JsValue, path: &[&str]) -> Option<JsValue> {
    path.iter().try_fold(root.clone(), |value, key| {
        let next = Reflect::get(&value, &JsValue::from_str(key)).ok()?;
        (!next.is_undefined() && !next.is_null()).then_some(next)
    })
}

/// The promise-style `browser` namespace when present, else `chrome`.
pub fn namespace() -> Option<JsValue> {
    let global: JsValue = js_sys::global().into();
    lookup(&global, &["browser"]).or_else(|| lookup(&global, &["chrome"]))
}

/// Picks the call style from the namespaces the page exposes.
pub struct BrowserEnv;

impl HostEnvironment for BrowserEnv {
    fn has_promise_namespace(&self) -> bool {
        lookup(&js_sys::global().into(), &["browser"]).is_some()
    }
}

pub fn host_failure(message: impl Into<String>) -> CompatError {
    CompatError::Host(Value::String(message.into()))
}

/// Plain JS objects for maps, never `Map` instances.
pub fn to_js(value: &impl Serialize) -> Result<JsValue, CompatError> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(|err| host_failure(err.to_string()))
}

pub fn to_json(value: JsValue) -> Value {
    if value.is_undefined() || value.is_null() {
        return Value::Null;
    }
    serde_wasm_bindgen::from_value(value).unwrap_or_else(|err| {
        gloo_console::warn!(format!("unreadable host value: {err}"));
        Value::Null
    })
}

/// `Error` instances have no enumerable properties; keep their message.
pub fn error_json(value: JsValue) -> Value {
    match value.dyn_ref::<js_sys::Error>() {
        Some(err) => Value::String(err.message().into()),
        None => to_json(value),
    }
}

/// `chrome.runtime.lastError`, read inside a completion callback.
pub fn last_error() -> Option<Value> {
    let error = lookup(&js_sys::global().into(), &["chrome", "runtime", "lastError"])?;
    Some(match lookup(&error, &["message"]) {
        Some(message) => to_json(message),
        None => to_json(error),
    })
}

/// `target[method](...args)`.
pub fn call(target: &JsValue, method: &str, args: &[JsValue]) -> Result<JsValue, CompatError> {
    let function: Function = Reflect::get(target, &JsValue::from_str(method))
        .ok()
        .and_then(|value| value.dyn_into().ok())
        .ok_or_else(|| host_failure(format!("{method} is not a function")))?;
    let args: Array = args.iter().collect();
    function
        .apply(target, &args)
        .map_err(|err| CompatError::Host(error_json(err)))
}

/// Trailing callback of a callback-style call. Failures surface through
/// `runtime.lastError` rather than through an argument.
pub fn completion(done: HostCallback) -> JsValue {
    Closure::once_into_js(move |data: JsValue| {
        let err = last_error();
        done(err, Some(to_json(data)));
    })
}

/// Drives `promise` locally and exposes its outcome as a `Send` future.
pub fn bridge(promise: JsValue) -> Result<HostPromise, CompatError> {
    let promise: Promise = promise
        .dyn_into()
        .map_err(|_| host_failure("host call did not return a promise"))?;
    let (tx, rx) = oneshot::channel();
    wasm_bindgen_futures::spawn_local(async move {
        let settled = JsFuture::from(promise).await.map(to_json).map_err(error_json);
        // The caller may have given up waiting.
        let _ = tx.send(settled);
    });
    Ok(async move {
        rx.await
            .unwrap_or_else(|_| Err(Value::String("promise was dropped".to_owned())))
    }
    .boxed())
}
