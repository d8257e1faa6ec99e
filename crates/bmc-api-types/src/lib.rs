use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod message;

pub use message::{
    Action, Computation, ComputationKind, ComputationModule, FlagValue, Message, Notification,
    Query, QueryAction, UrlResource,
};

pub type ComicId = u64;

/// Reader-specific details attached to a source (`id`, `homeUrl`, ...).
/// Opaque to everything except the source adapter that produced it.
pub type ReaderInfo = Map<String, Value>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("source {reader}/{name} is already attached to comic {id}")]
pub struct DuplicateSource {
    pub id: ComicId,
    pub reader: String,
    pub name: String,
}

/// A comic as named by one reader website.
///
/// Equality only considers `reader` and `name`; `info` is carried along but
/// never identifies the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComicSource {
    pub reader: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub info: ReaderInfo,
}

#[derive(Serialize)]
struct SourceKeyRef<'a> {
    reader: &'a str,
    name: &'a str,
}

#[derive(Deserialize)]
struct SourceKey {
    reader: String,
    name: String,
}

impl ComicSource {
    pub fn new(reader: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            reader: reader.into(),
            name: name.into(),
            info: ReaderInfo::new(),
        }
    }

    pub fn with_info(mut self, info: ReaderInfo) -> Self {
        self.info = info;
        self
    }

    /// Canonical map key: `{"reader":...,"name":...}` with a fixed field order.
    pub fn key(&self) -> String {
        let key = SourceKeyRef {
            reader: &self.reader,
            name: &self.name,
        };
        // Two string fields cannot fail to serialize.
        serde_json::to_string(&key).unwrap_or_default()
    }

    pub fn from_key(key: &str, info: ReaderInfo) -> Result<Self, serde_json::Error> {
        let parsed: SourceKey = serde_json::from_str(key)?;
        Ok(Self {
            reader: parsed.reader,
            name: parsed.name,
            info,
        })
    }
}

impl PartialEq for ComicSource {
    fn eq(&self, other: &Self) -> bool {
        self.reader == other.reader && self.name == other.name
    }
}

impl Eq for ComicSource {}

/// Last-read position. `page` is absent for chapter-only readers, `chapter`
/// is absent for comics registered from a home page.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tracking {
    #[serde(default)]
    pub chapter: Option<u32>,
    #[serde(default)]
    pub page: Option<u32>,
}

impl Tracking {
    pub fn new(chapter: u32, page: Option<u32>) -> Self {
        Self {
            chapter: Some(chapter),
            page,
        }
    }

    /// Whether moving to `(chapter, page)` would go strictly backwards.
    pub fn is_ahead_of(&self, chapter: u32, page: Option<u32>) -> bool {
        let Some(current) = self.chapter else {
            return false;
        };
        if chapter != current {
            return chapter < current;
        }
        matches!((self.page, page), (Some(current_page), Some(new_page)) if new_page < current_page)
    }

    pub fn is_at(&self, chapter: u32, page: Option<u32>) -> bool {
        self.chapter == Some(chapter) && self.page == page
    }
}

/// Persisted shape of one tracked comic (`BookMyComics.comics.<id>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComicRecord {
    pub label: String,
    pub id: ComicId,
    #[serde(default)]
    pub tracking: Tracking,
}

/// Snapshot of a comic as carried by messages. The id is `None` while the
/// comic is not (or not yet known to be) registered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComicSnapshot {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub id: Option<ComicId>,
    #[serde(default)]
    pub tracking: Tracking,
}

impl From<&ComicRecord> for ComicSnapshot {
    fn from(record: &ComicRecord) -> Self {
        Self {
            label: Some(record.label.clone()),
            id: Some(record.id),
            tracking: record.tracking,
        }
    }
}

/// A fully hydrated comic: its record joined with every source mapped to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comic {
    #[serde(flatten)]
    pub record: ComicRecord,
    #[serde(default)]
    sources: Vec<ComicSource>,
}

impl Comic {
    pub fn new(record: ComicRecord) -> Self {
        Self {
            record,
            sources: Vec::new(),
        }
    }

    pub fn id(&self) -> ComicId {
        self.record.id
    }

    pub fn label(&self) -> &str {
        &self.record.label
    }

    pub fn tracking(&self) -> Tracking {
        self.record.tracking
    }

    pub fn sources(&self) -> &[ComicSource] {
        &self.sources
    }

    pub fn source_for(&self, reader: &str) -> Option<&ComicSource> {
        self.sources.iter().find(|source| source.reader == reader)
    }

    pub fn add_source(&mut self, source: ComicSource) -> Result<(), DuplicateSource> {
        if self.sources.contains(&source) {
            return Err(DuplicateSource {
                id: self.record.id,
                reader: source.reader,
                name: source.name,
            });
        }
        self.sources.push(source);
        Ok(())
    }

    pub fn snapshot(&self) -> ComicSnapshot {
        ComicSnapshot::from(&self.record)
    }
}

/// The `common` part of what a source adapter scrapes from a page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommonInfo {
    pub name: String,
    #[serde(default)]
    pub chapter: Option<u32>,
    #[serde(default)]
    pub page: Option<u32>,
}

/// Adapter output: `{common: {name, chapter, page}, ...reader specific}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ComicInfo {
    pub common: CommonInfo,
    #[serde(flatten)]
    pub extra: ReaderInfo,
}

impl ComicInfo {
    pub fn new(name: impl Into<String>, chapter: Option<u32>, page: Option<u32>) -> Self {
        Self {
            common: CommonInfo {
                name: name.into(),
                chapter,
                page,
            },
            extra: ReaderInfo::new(),
        }
    }

    pub fn source(&self, reader: &str) -> ComicSource {
        ComicSource::new(reader, self.common.name.clone()).with_info(self.extra.clone())
    }

    pub fn tracking(&self) -> Tracking {
        Tracking {
            chapter: self.common.chapter,
            page: self.common.page,
        }
    }
}
