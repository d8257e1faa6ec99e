use bmc_api_types::{ComicId, ComicInfo, ComicSnapshot, ComicSource, Tracking};

/// Where the id lookup of the current comic stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Unresolved,
    Resolving,
    Resolved(ComicId),
    /// Looked up and not registered.
    Absent,
}

/// Outcome of one lookup, handed to completion listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(ComicId),
    Absent,
    Failed(String),
}

/// The comic shown by the current page, as far as the engine knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct ComicView {
    pub reader: String,
    pub info: ComicInfo,
    pub lookup: Lookup,
    pub(crate) generation: u64,
}

impl ComicView {
    pub(crate) fn new(reader: &str, info: ComicInfo, generation: u64) -> Self {
        Self {
            reader: reader.to_owned(),
            info,
            lookup: Lookup::Unresolved,
            generation,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.common.name
    }

    pub fn tracking(&self) -> Tracking {
        self.info.tracking()
    }

    pub fn id(&self) -> Option<ComicId> {
        match self.lookup {
            Lookup::Resolved(id) => Some(id),
            _ => None,
        }
    }

    pub fn source(&self) -> ComicSource {
        self.info.source(&self.reader)
    }

    pub fn snapshot(&self) -> ComicSnapshot {
        ComicSnapshot {
            label: Some(self.name().to_owned()),
            id: self.id(),
            tracking: self.tracking(),
        }
    }

    /// Same comic on the same reader: only the position moved.
    pub(crate) fn is_same_comic(&self, reader: &str, info: &ComicInfo) -> bool {
        self.reader == reader && self.info.common.name == info.common.name
    }
}
