//! BookMyComics browser extension.
//!
//! Binds the host traits of the messaging, storage and engine crates to the
//! `chrome.*` / `browser.*` extension APIs. The background page runs the
//! store handlers, the content script runs the page engine; both open the
//! same storage areas.

pub mod background;
pub mod host;
pub mod page;
pub mod runtime;
pub mod storage;

use std::sync::Arc;

use bmc_background::{Background, sources};
use bmc_compat::CompatibilityLayer;
use bmc_datamodel::DataApi;
use bmc_engine::{Engine, PanelLink};
use bmc_messaging::{
    BackgroundContext, ChannelTransport, ContentContext, OriginPolicy, RuntimeTransport, WindowTransport,
};
use wasm_bindgen::prelude::*;

use crate::background::ExtensionPorts;
use crate::host::BrowserEnv;
use crate::page::{PageWindow, ReaderPage};
use crate::runtime::ExtensionRuntime;

#[wasm_bindgen(start)]
pub fn start() {
    console_error_panic_hook::set_once();
}

fn extension_origin() -> Result<String, JsValue> {
    runtime::extension_url("").ok_or_else(|| JsValue::from_str("extension runtime unavailable"))
}

/// Background page entry point: serves the sidebar and options ports.
#[wasm_bindgen]
pub async fn init_background() -> Result<(), JsValue> {
    let compat = CompatibilityLayer::detect(&BrowserEnv);
    let channel = ChannelTransport::new(Arc::new(ExtensionPorts::new(compat)))
        .with_policy(OriginPolicy::new(extension_origin()?, None));
    let context = Arc::new(BackgroundContext::new(channel));
    let background = Background::open(context.clone(), storage::areas(), compat, sources(), false)
        .await
        .map_err(|err| JsValue::from_str(&err.message()))?;
    let background = Arc::new(background);
    background
        .install()
        .map_err(|err| JsValue::from_str(&err.to_string()))?;

    gloo_console::log!(format!("BookMyComics background ready, storage engine {}", background.engine()));
    wasm_bindgen_futures::spawn_local(async move {
        context.run().await;
        background.uninstall();
    });
    Ok(())
}

/// Content script entry point, run in every frame the script is injected in.
#[wasm_bindgen]
pub async fn init_content() -> Result<(), JsValue> {
    // Only the top reader page hosts the engine.
    if page::is_nested_frame() {
        return Ok(());
    }

    let compat = CompatibilityLayer::detect(&BrowserEnv);
    let (_settings, engine_kind, storage) = storage::areas()
        .open(compat)
        .await
        .map_err(|err| JsValue::from_str(&err.message()))?;

    let self_origin = extension_origin()?;
    let host_origin = page::origin();
    let content = Arc::new(ContentContext::new(
        WindowTransport::new(
            Arc::new(PageWindow),
            OriginPolicy::new(self_origin, host_origin.clone()),
        ),
        RuntimeTransport::new(Arc::new(ExtensionRuntime), compat),
    ));

    let panel: Arc<dyn PanelLink> = content.clone();
    let engine = Arc::new(Engine::new(
        DataApi::new(storage.clone()),
        sources(),
        Arc::new(ReaderPage),
        panel,
        storage,
    ));
    engine
        .install(&content)
        .map_err(|err| JsValue::from_str(&err.to_string()))?;
    engine.refresh_from_page();

    let on_navigation = engine.clone();
    page::on_hash_change(move || {
        let engine = on_navigation.clone();
        wasm_bindgen_futures::spawn_local(async move {
            if let Err(err) = engine.on_location_change().await {
                gloo_console::warn!(format!("tracking after navigation failed: {err}"));
            }
        });
    })?;

    let panel_url = runtime::extension_url("sidebar.html").ok_or_else(|| JsValue::from_str("sidebar.html missing"))?;
    let host_origin: String = js_sys::encode_uri_component(host_origin.as_deref().unwrap_or_default()).into();
    page::inject_side_panel(&format!("{panel_url}?hostOrigin={host_origin}"))?;

    gloo_console::log!(format!("BookMyComics ready, storage engine {engine_kind}"));
    wasm_bindgen_futures::spawn_local(async move { content.run().await });
    Ok(())
}
