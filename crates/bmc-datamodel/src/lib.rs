use async_trait::async_trait;
use bmc_api_types::{ComicId, DuplicateSource, Tracking};
use bmc_storage::StorageError;
use thiserror::Error;

mod api;
mod maintenance;
pub mod scheme;

pub use api::DataApi;
pub use maintenance::ReconcileReport;
pub use scheme::{AllocatorState, KeyScheme, MapEntry, SourceMap};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DataError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("comic {id} not found")]
    NotFound { id: ComicId },
    #[error("source {reader}/{name} is not attached to comic {id}")]
    SourceNotFound {
        id: ComicId,
        reader: String,
        name: String,
    },
    #[error("comic {id} is already past {requested:?} (at {current:?})")]
    BackwardProgress {
        id: ComicId,
        current: Tracking,
        requested: Tracking,
    },
    #[error(transparent)]
    DuplicateSource(#[from] DuplicateSource),
    #[error("label {label:?} is already used by comic {id}")]
    DuplicateLabel { label: String, id: ComicId },
    #[error("malformed {key}: {reason}")]
    Decode { key: String, reason: String },
}

impl DataError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::SourceNotFound { .. })
    }

    /// Text for the `error` field of a notification.
    pub fn message(&self) -> String {
        match self {
            Self::Storage(err) => err.message(),
            other => other.to_string(),
        }
    }
}

/// The part of the data API a page engine needs.
#[async_trait]
pub trait ComicStore: Send + Sync {
    async fn find_comic(&self, reader: &str, name: &str) -> Result<Option<ComicId>, DataError>;
    async fn update_comic(&self, id: ComicId, chapter: u32, page: Option<u32>) -> Result<(), DataError>;
}

#[async_trait]
impl ComicStore for DataApi {
    async fn find_comic(&self, reader: &str, name: &str) -> Result<Option<ComicId>, DataError> {
        DataApi::find_comic(self, reader, name).await
    }

    async fn update_comic(&self, id: ComicId, chapter: u32, page: Option<u32>) -> Result<(), DataError> {
        DataApi::update_comic(self, id, chapter, page).await
    }
}
