//! Physical key layout of the comic store.

use std::collections::BTreeMap;

use bmc_api_types::{ComicId, ComicRecord, ComicSource, ReaderInfo};
use bmc_storage::{Dataset, KeyQuery, StorageFacade};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::DataError;

pub const STATE_KEY: &str = "BookMyComics.state";
pub const MAP_KEY: &str = "BookMyComics.map";
pub const COMIC_KEY_PREFIX: &str = "BookMyComics.comics.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorState {
    #[serde(rename = "lastId")]
    pub last_id: i64,
}

impl Default for AllocatorState {
    fn default() -> Self {
        Self { last_id: -1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    pub id: ComicId,
    #[serde(default)]
    pub info: ReaderInfo,
}

/// Serialized source key → `{id, info}`.
pub type SourceMap = BTreeMap<String, MapEntry>;

pub(crate) fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, DataError> {
    serde_json::from_value(value).map_err(|err| DataError::Decode {
        key: key.to_owned(),
        reason: err.to_string(),
    })
}

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value, DataError> {
    serde_json::to_value(value).map_err(|err| DataError::Decode {
        key: key.to_owned(),
        reason: err.to_string(),
    })
}

/// Reads the source map out of an already fetched dataset.
pub(crate) fn map_from(data: &mut Dataset) -> Result<SourceMap, DataError> {
    match data.remove(MAP_KEY) {
        None | Some(Value::Null) => Ok(SourceMap::new()),
        Some(raw) => decode(MAP_KEY, raw),
    }
}

/// Groups the map by comic id, keeping each entry's reader info.
pub(crate) fn invert(map: &SourceMap) -> Result<BTreeMap<ComicId, Vec<ComicSource>>, DataError> {
    let mut inverse: BTreeMap<ComicId, Vec<ComicSource>> = BTreeMap::new();
    for (key, entry) in map {
        let source = ComicSource::from_key(key, entry.info.clone()).map_err(|err| DataError::Decode {
            key: MAP_KEY.to_owned(),
            reason: format!("{key}: {err}"),
        })?;
        inverse.entry(entry.id).or_default().push(source);
    }
    Ok(inverse)
}

/// Comic records among a dataset, ordered by id.
pub(crate) fn records_from(data: &Dataset) -> Result<Vec<ComicRecord>, DataError> {
    let mut records = data
        .iter()
        .filter(|(key, _)| key.starts_with(COMIC_KEY_PREFIX))
        .map(|(key, value)| decode::<ComicRecord>(key, value.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    records.sort_by_key(|record| record.id);
    Ok(records)
}

#[derive(Clone)]
pub struct KeyScheme {
    storage: StorageFacade,
}

impl KeyScheme {
    pub fn new(storage: StorageFacade) -> Self {
        Self { storage }
    }

    pub fn key_from_id(id: ComicId) -> String {
        format!("{COMIC_KEY_PREFIX}{id}")
    }

    pub fn id_from_key(key: &str) -> Option<ComicId> {
        key.strip_prefix(COMIC_KEY_PREFIX)?.parse().ok()
    }

    pub fn map_dataset(map: &SourceMap) -> Result<Dataset, DataError> {
        let mut dataset = Dataset::new();
        dataset.insert(MAP_KEY.to_owned(), encode(MAP_KEY, map)?);
        Ok(dataset)
    }

    pub async fn state(&self) -> Result<AllocatorState, DataError> {
        let mut defaults = Dataset::new();
        defaults.insert(STATE_KEY.to_owned(), encode(STATE_KEY, &AllocatorState::default())?);
        let mut data = self.storage.get(KeyQuery::Defaults(defaults)).await?;
        match data.remove(STATE_KEY) {
            Some(raw) => decode(STATE_KEY, raw),
            None => Ok(AllocatorState::default()),
        }
    }

    pub async fn save_state(&self, state: AllocatorState) -> Result<(), DataError> {
        let mut dataset = Dataset::new();
        dataset.insert(STATE_KEY.to_owned(), encode(STATE_KEY, &state)?);
        self.storage.set(dataset).await?;
        Ok(())
    }

    /// Reads `lastId`, increments it, persists it and returns it.
    /// Two concurrent callers may receive the same id.
    pub async fn next_id(&self) -> Result<ComicId, DataError> {
        let state = self.state().await?;
        let out_of_range = || DataError::Decode {
            key: STATE_KEY.to_owned(),
            reason: format!("lastId {} leaves no id to allocate", state.last_id),
        };
        if state.last_id < -1 {
            return Err(out_of_range());
        }
        let last_id = state.last_id.checked_add(1).ok_or_else(out_of_range)?;
        let id = ComicId::try_from(last_id).map_err(|_| out_of_range())?;
        self.save_state(AllocatorState { last_id }).await?;
        debug!(id, "allocated comic id");
        Ok(id)
    }

    pub async fn get_map(&self) -> Result<SourceMap, DataError> {
        let mut data = self.storage.get(KeyQuery::key(MAP_KEY)).await?;
        map_from(&mut data)
    }

    pub async fn save_map(&self, map: &SourceMap) -> Result<(), DataError> {
        self.storage.set(Self::map_dataset(map)?).await?;
        Ok(())
    }

    pub async fn id_from_source(&self, source: &ComicSource) -> Result<Option<ComicId>, DataError> {
        let map = self.get_map().await?;
        Ok(map.get(&source.key()).map(|entry| entry.id))
    }
}
