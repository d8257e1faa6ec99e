//! Window messages the content script answers for the engine and the side
//! panel.

use std::sync::Arc;

use bmc_api_types::{Action, Message};
use bmc_compat::Reply;
use bmc_datamodel::ComicStore;
use bmc_messaging::ContentContext;
use serde_json::Value;
use tracing::{info, warn};

use crate::{Engine, EngineError};

pub const ENGINE_TAG: &str = "BookMyComics::Engine";
pub const PANEL_TAG: &str = "BookMyComics::SidePanel";

/// Data-store key remembering whether the panel was left open.
pub const SIDEBAR_DISPLAYED: &str = "sidebar-displayed";

/// Notifications of a change to the comic store made outside the page.
pub const STORE_CHANGES: [&str; 4] = ["Register Comic", "Alias Comic", "Delete Comic", "Delete Comic Source"];

/// A successful store change; failed ones left the store as it was.
fn is_store_change(message: &Message) -> bool {
    message.as_notification().is_some_and(|note| {
        note.error.is_none() && STORE_CHANGES.iter().any(|operation| note.is_operation(operation))
    })
}

fn is_action(message: &Message, pick: impl Fn(&Action) -> bool) -> bool {
    message.as_action().is_some_and(pick)
}

fn log_failure<T>(what: &str, outcome: Result<T, EngineError>) -> Value {
    if let Err(err) = outcome {
        warn!(%err, "{what} failed");
    }
    Value::Null
}

impl<S> Engine<S>
where
    S: ComicStore + 'static,
{
    /// Registers the engine's window handlers on `content`.
    pub fn install(self: &Arc<Self>, content: &ContentContext) -> Result<(), EngineError> {
        let engine = self.clone();
        content.add_window_handler(
            ENGINE_TAG,
            |message| is_action(message, |action| matches!(action, Action::UrlOpen { .. })),
            move |envelope| {
                if let Some(Action::UrlOpen { url }) = envelope.message.as_action() {
                    info!(%url, "opening");
                    engine.page.navigate(url);
                }
                Reply::none()
            },
        )?;

        let engine = self.clone();
        content.add_window_handler(ENGINE_TAG, Message::is_comic_information_query, move |_| {
            log_failure("comic information", engine.send_comic_info(Some("Comic Information"), None));
            Reply::none()
        })?;

        // The panel relays store changes over the window, the background
        // over the runtime.
        let engine = self.clone();
        content.add_window_handler(ENGINE_TAG, is_store_change, move |_| engine.resync())?;
        let engine = self.clone();
        content.add_extension_handler(ENGINE_TAG, is_store_change, move |_| engine.resync())?;

        self.install_panel_handlers(content)
    }

    fn resync(self: &Arc<Self>) -> Reply {
        let engine = self.clone();
        Reply::later(async move { log_failure("store resync", engine.on_store_changed().await) })
    }

    fn install_panel_handlers(self: &Arc<Self>, content: &ContentContext) -> Result<(), EngineError> {
        for shown in [false, true] {
            let engine = self.clone();
            content.add_window_handler(
                PANEL_TAG,
                move |message| {
                    is_action(message, |action| match action {
                        Action::ShowSidePanel => shown,
                        Action::HideSidePanel => !shown,
                        _ => false,
                    })
                },
                move |_| {
                    let engine = engine.clone();
                    Reply::later(async move { log_failure("panel display", engine.display_side_panel(shown).await) })
                },
            )?;
        }

        let engine = self.clone();
        content.add_window_handler(
            PANEL_TAG,
            |message| is_action(message, |action| matches!(action, Action::IFrameResize { .. })),
            move |envelope| {
                if let Some(Action::IFrameResize { full_size }) = envelope.message.as_action() {
                    engine.page.resize_panel(full_size.is_set());
                }
                Reply::none()
            },
        )?;

        let engine = self.clone();
        content.add_window_handler(
            PANEL_TAG,
            |message| is_action(message, |action| matches!(action, Action::CheckSidebar)),
            move |_| {
                let engine = engine.clone();
                Reply::later(async move { log_failure("panel check", engine.check_sidebar().await) })
            },
        )?;

        let engine = self.clone();
        content.add_window_handler(
            PANEL_TAG,
            |message| is_action(message, |action| matches!(action, Action::Refresh)),
            move |_| {
                log_failure("panel refresh", engine.refresh_panel());
                Reply::none()
            },
        )?;
        Ok(())
    }
}
