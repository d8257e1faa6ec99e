//! The reader page: its window messages, its location and the side-panel
//! iframe.

use bmc_compat::CompatError;
use bmc_engine::PageHost;
use bmc_messaging::{Frame, Inbox, MessagingError, WindowEvent, WindowHost};
use serde_json::Value;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{HtmlIFrameElement, MessageEvent, Window};

use crate::host::{error_json, to_js, to_json};

pub const SIDE_PANEL_ID: &str = "BmcSidePanel";

fn window() -> Option<Window> {
    web_sys::window()
}

fn side_panel() -> Option<HtmlIFrameElement> {
    window()?
        .document()?
        .get_element_by_id(SIDE_PANEL_ID)?
        .dyn_into()
        .ok()
}

fn host_error(err: JsValue) -> MessagingError {
    MessagingError::Host(CompatError::Host(error_json(err)))
}

/// Origin of the reader page, trusted next to the extension's own.
pub fn origin() -> Option<String> {
    window()?.location().origin().ok()
}

/// Whether this script runs inside a nested frame of the page.
pub fn is_nested_frame() -> bool {
    let Some(window) = window() else {
        return false;
    };
    match window.top() {
        Ok(Some(top)) => !js_sys::Object::is(&top, &window),
        _ => false,
    }
}

/// Runs `on_change` on every `hashchange` of the page.
pub fn on_hash_change(mut on_change: impl FnMut() + 'static) -> Result<(), JsValue> {
    let window = window().ok_or_else(|| JsValue::from_str("no window"))?;
    let listener = Closure::<dyn FnMut(web_sys::Event)>::new(move |_: web_sys::Event| on_change());
    window.add_event_listener_with_callback("hashchange", listener.as_ref().unchecked_ref())?;
    listener.forget();
    Ok(())
}

/// Appends the collapsed side-panel iframe to the page body.
pub fn inject_side_panel(src: &str) -> Result<(), JsValue> {
    if side_panel().is_some() {
        return Ok(());
    }
    let document = window()
        .and_then(|window| window.document())
        .ok_or_else(|| JsValue::from_str("no document"))?;
    let body = document.body().ok_or_else(|| JsValue::from_str("no body"))?;
    let iframe: HtmlIFrameElement = document.create_element("iframe")?.dyn_into()?;
    iframe.set_id(SIDE_PANEL_ID);
    iframe.set_src(src);
    let style = iframe.style();
    for (property, value) in [
        ("width", "206px"),
        ("height", "58px"),
        ("position", "fixed"),
        ("top", "70px"),
        ("left", "0"),
        ("z-index", "1000000"),
        ("border", "none"),
    ] {
        style.set_property(property, value)?;
    }
    body.append_child(&iframe)?;
    Ok(())
}

/// Window messaging of the top reader page.
pub struct PageWindow;

impl WindowHost for PageWindow {
    fn listen(&self, inbox: Inbox<WindowEvent>) -> Result<(), MessagingError> {
        let window = window().ok_or_else(|| MessagingError::UnknownFrame(Frame::Top.to_string()))?;
        let listener = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            let event = WindowEvent {
                kind: event.type_(),
                origin: event.origin(),
                data: to_json(event.data()),
                error: None,
            };
            if inbox.send(event).is_err() {
                gloo_console::warn!("window message arrived after shutdown");
            }
        });
        window
            .add_event_listener_with_callback("message", listener.as_ref().unchecked_ref())
            .map_err(host_error)?;
        listener.forget();
        Ok(())
    }

    fn post(&self, frame: &Frame, data: Value) -> Result<(), MessagingError> {
        let target = match frame {
            Frame::Top => window().and_then(|window| window.top().ok().flatten()),
            Frame::SidePanel => side_panel().and_then(|iframe| iframe.content_window()),
        };
        let target = target.ok_or_else(|| MessagingError::UnknownFrame(frame.to_string()))?;
        target.post_message(&to_js(&data)?, "*").map_err(host_error)
    }
}

/// Location and panel sizing of the reader page.
pub struct ReaderPage;

impl PageHost for ReaderPage {
    fn host(&self) -> String {
        window()
            .and_then(|window| window.location().host().ok())
            .unwrap_or_default()
    }

    fn url(&self) -> String {
        let Some(location) = window().map(|window| window.location()) else {
            return String::new();
        };
        [location.pathname(), location.search(), location.hash()]
            .into_iter()
            .map(|part| part.unwrap_or_default())
            .collect()
    }

    fn navigate(&self, url: &str) {
        if let Some(window) = window()
            && let Err(err) = window.location().set_href(url)
        {
            gloo_console::error!("navigation failed", err);
        }
    }

    fn resize_panel(&self, full_size: bool) {
        let Some(iframe) = side_panel() else {
            gloo_console::warn!("side panel missing, cannot resize");
            return;
        };
        let (height, top) = if full_size { ("100vh", "0") } else { ("58px", "70px") };
        let style = iframe.style();
        if let Err(err) = style
            .set_property("height", height)
            .and_then(|()| style.set_property("top", top))
        {
            gloo_console::warn!("panel resize failed", err);
        }
    }
}
