//! Page engine: knows which comic the reader page shows, resolves its id
//! once, and records reading progress.
//!
//! Lookups go `Unresolved -> Resolving -> Resolved | Absent`. Every caller
//! interested in the outcome subscribes to the completion [`Observer`]
//! before asking for a lookup, so a cache hit and a fresh lookup look the
//! same from the outside.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bmc_api_types::{Action, ComicId, ComicInfo, Message, Notification};
use bmc_datamodel::{ComicStore, DataError};
use bmc_messaging::{ContentContext, Frame, MessagingError};
use bmc_sources::SourceRegistry;
use bmc_storage::{StorageError, StorageFacade};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

mod handlers;
pub mod observer;
pub mod view;

pub use handlers::{ENGINE_TAG, PANEL_TAG, SIDEBAR_DISPLAYED, STORE_CHANGES};
pub use observer::{Observer, SubscriptionId};
pub use view::{ComicView, Lookup, Resolution};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("lookup completion was dropped")]
    Abandoned,
}

/// The side-panel frame, as seen from the content script.
pub trait PanelLink: Send + Sync {
    fn post(&self, message: &Message) -> Result<(), MessagingError>;
}

impl PanelLink for ContentContext {
    fn post(&self, message: &Message) -> Result<(), MessagingError> {
        self.send_window(&Frame::SidePanel, message)
    }
}

/// The reader page around the content script.
pub trait PageHost: Send + Sync {
    /// Host name, possibly with a port.
    fn host(&self) -> String;

    /// Path, query and hash of the current location.
    fn url(&self) -> String;

    fn navigate(&self, url: &str);

    /// Grows the side-panel iframe to the full height, or shrinks it back.
    fn resize_panel(&self, full_size: bool);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    /// The page shows no comic.
    NoComic,
    /// Not registered yet; the panel was asked to offer registration.
    RegisterPrompted,
    Tracked(ComicId),
    Failed(String),
}

#[derive(Default)]
struct EngineState {
    view: Option<ComicView>,
    generation: u64,
}

enum Step {
    Pending,
    Hit(Resolution),
    Lookup { generation: u64, reader: String, name: String },
}

pub struct Engine<S> {
    store: S,
    sources: Arc<SourceRegistry>,
    page: Arc<dyn PageHost>,
    panel: Arc<dyn PanelLink>,
    prefs: StorageFacade,
    state: Mutex<EngineState>,
    loads: Observer<Resolution>,
}

impl<S> Engine<S>
where
    S: ComicStore,
{
    pub fn new(
        store: S,
        sources: Arc<SourceRegistry>,
        page: Arc<dyn PageHost>,
        panel: Arc<dyn PanelLink>,
        prefs: StorageFacade,
    ) -> Self {
        Self {
            store,
            sources,
            page,
            panel,
            prefs,
            state: Mutex::new(EngineState::default()),
            loads: Observer::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Completion notifications of id lookups.
    pub fn loads(&self) -> &Observer<Resolution> {
        &self.loads
    }

    pub fn view(&self) -> Option<ComicView> {
        self.state().view.clone()
    }

    /// Replaces what the engine knows about the page. The same comic keeps
    /// its lookup state and only moves to the new position.
    pub fn refresh(&self, reader: &str, info: Option<ComicInfo>) {
        let mut state = self.state();
        let Some(info) = info else {
            if state.view.take().is_some() {
                debug!("page no longer shows a comic");
            }
            return;
        };
        if let Some(view) = state.view.as_mut()
            && view.is_same_comic(reader, &info)
        {
            view.info.common.chapter = info.common.chapter;
            view.info.common.page = info.common.page;
            return;
        }
        state.generation += 1;
        let generation = state.generation;
        info!(%reader, name = %info.common.name, chapter = ?info.common.chapter, page = ?info.common.page, "comic detected");
        state.view = Some(ComicView::new(reader, info, generation));
    }

    /// Asks the source adapters what the current page shows.
    pub fn refresh_from_page(&self) {
        let host = self.page.host();
        let Some(adapter) = self.sources.from_origin(&host) else {
            self.refresh(&host, None);
            return;
        };
        let info = adapter.get_infos(&self.page.url(), None);
        if info.is_none() {
            warn!(%host, "page is not a comic page");
        }
        self.refresh(adapter.reader(), info);
    }

    /// Resolves the comic id unless known, then publishes the outcome.
    /// A lookup already in flight is left to publish for everyone.
    pub async fn memoize(&self) -> Result<(), EngineError> {
        loop {
            let step = {
                let mut state = self.state();
                let Some(view) = state.view.as_mut() else {
                    warn!("no comic to look up");
                    return Ok(());
                };
                match view.lookup {
                    Lookup::Resolving => Step::Pending,
                    Lookup::Resolved(id) => Step::Hit(Resolution::Found(id)),
                    Lookup::Absent => Step::Hit(Resolution::Absent),
                    Lookup::Unresolved => {
                        view.lookup = Lookup::Resolving;
                        Step::Lookup {
                            generation: view.generation,
                            reader: view.reader.clone(),
                            name: view.name().to_owned(),
                        }
                    }
                }
            };
            let (generation, reader, name) = match step {
                Step::Pending => {
                    debug!("lookup already pending");
                    return Ok(());
                }
                Step::Hit(resolution) => {
                    debug!(?resolution, "lookup cache hit");
                    self.loads.publish(&resolution);
                    return Ok(());
                }
                Step::Lookup {
                    generation,
                    reader,
                    name,
                } => (generation, reader, name),
            };

            let found = self.store.find_comic(&reader, &name).await;
            let resolution = {
                let mut state = self.state();
                match state.view.as_mut() {
                    Some(view) if view.generation == generation => {
                        let (lookup, resolution) = match &found {
                            Ok(Some(id)) => (Lookup::Resolved(*id), Resolution::Found(*id)),
                            Ok(None) => (Lookup::Absent, Resolution::Absent),
                            Err(err) => (Lookup::Unresolved, Resolution::Failed(err.message())),
                        };
                        view.lookup = lookup;
                        Some(resolution)
                    }
                    _ => None,
                }
            };
            let Some(resolution) = resolution else {
                debug!(%reader, %name, "page changed during lookup, looking up again");
                continue;
            };

            info!(%reader, %name, ?resolution, "comic lookup done");
            self.loads.publish(&resolution);
            found?;
            return self.send_comic_info(None, None);
        }
    }

    /// Forgets the lookup outcome and looks the comic up again, after any
    /// lookup in flight completed.
    pub async fn force_memoize(&self) -> Result<(), EngineError> {
        let in_flight = {
            let state = self.state();
            match state.view.as_ref() {
                Some(view) if view.lookup == Lookup::Resolving => Some(self.loads.next()),
                _ => None,
            }
        };
        if let Some(in_flight) = in_flight {
            in_flight.await;
        }
        if let Some(view) = self.state().view.as_mut() {
            view.lookup = Lookup::Unresolved;
        }
        self.memoize().await
    }

    /// Records the current page as reading progress, or asks the panel to
    /// offer registration when the comic is unknown.
    pub async fn track(&self) -> Result<TrackOutcome, EngineError> {
        let Some(view) = self.view() else {
            info!("no comic on this page, nothing to track");
            return Ok(TrackOutcome::NoComic);
        };
        info!(name = %view.name(), chapter = ?view.info.common.chapter, page = ?view.info.common.page, "tracking");

        let completion = self.loads.next();
        if let Err(err) = self.memoize().await {
            warn!(%err, "comic lookup failed");
        }
        let resolution = completion.await.ok_or(EngineError::Abandoned)?;

        match resolution {
            Resolution::Absent => {
                self.panel.post(&Message::Action(Action::Setup {
                    operation: "register".to_owned(),
                }))?;
                Ok(TrackOutcome::RegisterPrompted)
            }
            Resolution::Failed(reason) => {
                self.send_comic_info(Some("track"), Some(reason.clone()))?;
                Ok(TrackOutcome::Failed(reason))
            }
            Resolution::Found(id) => {
                let tracking = self.view().map(|view| view.tracking()).unwrap_or(view.tracking());
                let updated = match tracking.chapter {
                    Some(chapter) => self
                        .store
                        .update_comic(id, chapter, tracking.page)
                        .await
                        .map_err(|err| err.message()),
                    None => Err("the page shows no chapter to track".to_owned()),
                };
                if let Err(reason) = &updated {
                    warn!(id, %reason, "progress not recorded");
                }
                self.send_comic_info(Some("track"), updated.as_ref().err().cloned())?;
                Ok(match updated {
                    Ok(()) => TrackOutcome::Tracked(id),
                    Err(reason) => TrackOutcome::Failed(reason),
                })
            }
        }
    }

    /// The store changed elsewhere: drop the lookup outcome, resolve the
    /// page's comic again and record the page.
    pub async fn on_store_changed(&self) -> Result<TrackOutcome, EngineError> {
        if self.view().is_none() {
            return Ok(TrackOutcome::NoComic);
        }
        if let Err(err) = self.force_memoize().await {
            warn!(%err, "lookup after a store change failed");
        }
        self.track().await
    }

    /// Page navigation inside the reader (hash change, AJAX paging).
    pub async fn on_location_change(&self) -> Result<TrackOutcome, EngineError> {
        self.refresh_from_page();
        self.track().await
    }

    /// Posts a notification carrying the current comic to the panel.
    pub fn send_comic_info(&self, operation: Option<&str>, error: Option<String>) -> Result<(), EngineError> {
        let view = self.view();
        let notification = Notification {
            operation: operation.map(str::to_owned),
            ..Notification::default()
        }
        .with_error(error)
        .with_comic(
            view.as_ref().map(ComicView::snapshot),
            view.as_ref().map(ComicView::source),
        );
        self.panel.post(&Message::notification(notification))?;
        Ok(())
    }

    /// Persists whether the panel is open and resizes it accordingly.
    pub async fn display_side_panel(&self, shown: bool) -> Result<(), EngineError> {
        let mut data = bmc_storage::Dataset::new();
        data.insert(SIDEBAR_DISPLAYED.to_owned(), Value::String(shown.to_string()));
        let saved = self.prefs.set(data).await;
        self.page.resize_panel(shown);
        saved?;
        Ok(())
    }

    /// The panel finished loading: restore its open state, then track.
    pub async fn check_sidebar(&self) -> Result<TrackOutcome, EngineError> {
        match self.prefs.get_one(SIDEBAR_DISPLAYED).await {
            Ok(Some(Value::String(shown))) if shown == "true" => {
                self.page.resize_panel(true);
                self.panel.post(&Message::Action(Action::Toggle {
                    module: "sidebar".to_owned(),
                }))?;
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "could not read the panel state"),
        }
        self.track().await
    }

    pub fn refresh_panel(&self) -> Result<(), EngineError> {
        self.panel.post(&Message::Action(Action::RefreshPanel {
            module: "sidebar".to_owned(),
        }))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing;
