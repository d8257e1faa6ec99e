//! Test doubles for the engine's host seams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bmc_api_types::{ComicId, Message};
use bmc_datamodel::{ComicStore, DataApi, DataError};
use bmc_messaging::MessagingError;
use bmc_sources::SourceRegistry;
use bmc_source_localhost::LocalhostReader;
use bmc_storage::StorageFacade;

use crate::{Engine, PageHost, PanelLink};

/// Wraps a real store and counts lookups; lookups yield once so that
/// concurrent callers overlap.
pub struct CountingStore {
    pub inner: DataApi,
    pub lookups: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: DataApi) -> Self {
        Self {
            inner,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComicStore for CountingStore {
    async fn find_comic(&self, reader: &str, name: &str) -> Result<Option<ComicId>, DataError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.inner.find_comic(reader, name).await
    }

    async fn update_comic(&self, id: ComicId, chapter: u32, page: Option<u32>) -> Result<(), DataError> {
        self.inner.update_comic(id, chapter, page).await
    }
}

#[derive(Default)]
pub struct RecordingPage {
    pub location: Mutex<(String, String)>,
    pub navigated: Mutex<Vec<String>>,
    pub sizes: Mutex<Vec<bool>>,
}

impl RecordingPage {
    pub fn at(host: &str, url: &str) -> Arc<Self> {
        let page = Self::default();
        *page.location.lock().unwrap() = (host.to_owned(), url.to_owned());
        Arc::new(page)
    }

    pub fn go(&self, url: &str) {
        self.location.lock().unwrap().1 = url.to_owned();
    }
}

impl PageHost for RecordingPage {
    fn host(&self) -> String {
        self.location.lock().unwrap().0.clone()
    }

    fn url(&self) -> String {
        self.location.lock().unwrap().1.clone()
    }

    fn navigate(&self, url: &str) {
        self.navigated.lock().unwrap().push(url.to_owned());
    }

    fn resize_panel(&self, full_size: bool) {
        self.sizes.lock().unwrap().push(full_size);
    }
}

#[derive(Default)]
pub struct RecordingPanel {
    pub posted: Mutex<Vec<Message>>,
}

impl RecordingPanel {
    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.posted.lock().unwrap())
    }
}

impl PanelLink for RecordingPanel {
    fn post(&self, message: &Message) -> Result<(), MessagingError> {
        self.posted.lock().unwrap().push(message.clone());
        Ok(())
    }
}

pub fn sources() -> Arc<SourceRegistry> {
    let mut registry = SourceRegistry::default();
    LocalhostReader::new(Some("http://localhost:5000".to_owned())).install(&mut registry);
    Arc::new(registry)
}

pub struct Fixture {
    pub engine: Arc<Engine<CountingStore>>,
    pub data: DataApi,
    pub prefs: StorageFacade,
    pub page: Arc<RecordingPage>,
    pub panel: Arc<RecordingPanel>,
}

pub fn fixture(url: &str) -> Fixture {
    let (storage, _area) = bmc_storage::in_memory("LocalStorage");
    let data = DataApi::new(storage.clone());
    let page = RecordingPage::at("localhost:5000", url);
    let panel = Arc::new(RecordingPanel::default());
    let engine = Arc::new(Engine::new(
        CountingStore::new(data.clone()),
        sources(),
        page.clone(),
        panel.clone(),
        storage.clone(),
    ));
    Fixture {
        engine,
        data,
        prefs: storage,
        page,
        panel,
    }
}
