use bmc_api_types::{Comic, ComicInfo, ComicSource};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Read-only view of the page an adapter scrapes.
pub trait PageDocument {
    /// Text of the first element matching `selector`.
    fn text(&self, selector: &str) -> Option<String>;

    /// Attribute of the first element matching `selector`.
    fn attribute(&self, selector: &str, name: &str) -> Option<String>;

    fn exists(&self, selector: &str) -> bool {
        self.text(selector).is_some()
    }
}

/// Knowledge about one reader website. Implementations are pure: they look
/// at a URL or a document and never touch storage or the network.
pub trait SourceAdapter: Send + Sync {
    /// Reader name recorded in every [`ComicSource`] this adapter produces.
    fn reader(&self) -> &str;

    /// What the page at `url` shows, or `None` when it is not a comic page.
    fn get_infos(&self, url: &str, document: Option<&dyn PageDocument>) -> Option<ComicInfo>;

    /// Where to resume `comic` on this reader.
    fn compute_url(&self, comic: &Comic, source: &ComicSource) -> Option<String>;

    fn has_next_page(&self, _document: &dyn PageDocument) -> bool {
        false
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("no adapter for origin {0}")]
    UnknownReader(String),
    #[error("comic {id} has no source on {reader}")]
    NoSource { id: u64, reader: String },
    #[error("{reader} cannot build a URL for comic {id}")]
    NoUrl { id: u64, reader: String },
}

/// Adapters keyed by the host names they serve.
#[derive(Default)]
pub struct SourceRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    /// Registers `adapter` under its own reader name.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.reader().to_owned(), adapter);
    }

    /// Registers `adapter` under an extra host name (e.g. with a port).
    pub fn register_as(&mut self, key: impl Into<String>, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(key.into(), adapter);
    }

    pub fn adapter(&self, reader: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(reader).cloned()
    }

    /// Adapter whose key appears in `origin`; the longest key wins.
    pub fn from_origin(&self, origin: &str) -> Option<Arc<dyn SourceAdapter>> {
        let found = self
            .adapters
            .iter()
            .filter(|(key, _)| origin.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, adapter)| adapter.clone());
        if found.is_none() {
            warn!(%origin, "no reader adapter for origin");
        }
        found
    }

    pub fn readers(&self) -> Vec<&str> {
        let mut readers: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        readers.sort_unstable();
        readers
    }

    pub fn get_infos(&self, origin: &str, url: &str, document: Option<&dyn PageDocument>) -> Option<ComicInfo> {
        self.from_origin(origin)?.get_infos(url, document)
    }

    /// Resume URL of `comic` on the reader serving `origin`.
    pub fn compute_url(&self, origin: &str, comic: &Comic) -> Result<String, SourceError> {
        let adapter = self
            .from_origin(origin)
            .ok_or_else(|| SourceError::UnknownReader(origin.to_owned()))?;
        let reader = adapter.reader();
        let source = comic.source_for(reader).ok_or_else(|| SourceError::NoSource {
            id: comic.id(),
            reader: reader.to_owned(),
        })?;
        adapter.compute_url(comic, source).ok_or_else(|| SourceError::NoUrl {
            id: comic.id(),
            reader: reader.to_owned(),
        })
    }
}
