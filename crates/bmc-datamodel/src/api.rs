use bmc_api_types::{Comic, ComicId, ComicInfo, ComicRecord, ComicSource, DuplicateSource, Tracking};
use bmc_storage::{KeyQuery, StorageFacade};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::DataError;
use crate::scheme::{
    KeyScheme, MAP_KEY, MapEntry, SourceMap, decode, encode, invert, map_from, records_from,
};

/// Repository over the comic store. Every operation is a sequence of
/// storage round-trips without any locking.
#[derive(Clone)]
pub struct DataApi {
    storage: StorageFacade,
    scheme: KeyScheme,
}

impl DataApi {
    pub fn new(storage: StorageFacade) -> Self {
        Self {
            scheme: KeyScheme::new(storage.clone()),
            storage,
        }
    }

    pub fn storage(&self) -> &StorageFacade {
        &self.storage
    }

    pub fn scheme(&self) -> &KeyScheme {
        &self.scheme
    }

    pub async fn find_comic(&self, reader: &str, name: &str) -> Result<Option<ComicId>, DataError> {
        let id = self
            .scheme
            .id_from_source(&ComicSource::new(reader, name))
            .await?;
        debug!(reader, name, ?id, "find comic");
        Ok(id)
    }

    pub(crate) async fn load_record(&self, id: ComicId) -> Result<Option<ComicRecord>, DataError> {
        let key = KeyScheme::key_from_id(id);
        match self.storage.get_one(&key).await? {
            None | Some(Value::Null) => Ok(None),
            Some(raw) => decode(&key, raw).map(Some),
        }
    }

    async fn remove_record(&self, id: ComicId) -> Result<(), DataError> {
        self.storage.remove(vec![KeyScheme::key_from_id(id)]).await?;
        Ok(())
    }

    /// Allocates an id, then writes the record and the updated map in a
    /// single `set`.
    pub async fn register_comic(
        &self,
        label: &str,
        reader: &str,
        comic: &ComicInfo,
    ) -> Result<ComicId, DataError> {
        let source = comic.source(reader);
        let key = source.key();
        let mut map = self.scheme.get_map().await?;
        if let Some(entry) = map.get(&key) {
            return Err(DuplicateSource {
                id: entry.id,
                reader: source.reader,
                name: source.name,
            }
            .into());
        }

        let id = self.scheme.next_id().await?;
        let record = ComicRecord {
            label: label.to_owned(),
            id,
            tracking: comic.tracking(),
        };
        map.insert(
            key,
            MapEntry {
                id,
                info: source.info.clone(),
            },
        );

        let record_key = KeyScheme::key_from_id(id);
        let mut dataset = KeyScheme::map_dataset(&map)?;
        dataset.insert(record_key.clone(), encode(&record_key, &record)?);
        self.storage.set(dataset).await?;

        info!(id, label, reader, name = %source.name, "comic registered");
        Ok(id)
    }

    /// Points one more source at an existing comic. A source previously
    /// mapped elsewhere is moved; a comic left without sources is deleted.
    pub async fn alias_comic(&self, id: ComicId, reader: &str, comic: &ComicInfo) -> Result<(), DataError> {
        if self.load_record(id).await?.is_none() {
            return Err(DataError::NotFound { id });
        }

        let source = comic.source(reader);
        let key = source.key();
        let mut map = self.scheme.get_map().await?;
        let displaced = match map.get(&key) {
            Some(entry) if entry.id == id => {
                return Err(DuplicateSource {
                    id,
                    reader: source.reader,
                    name: source.name,
                }
                .into());
            }
            Some(entry) => Some(entry.id),
            None => None,
        };

        map.insert(key, MapEntry { id, info: source.info });
        self.scheme.save_map(&map).await?;
        info!(id, reader, name = %source.name, "comic aliased");

        if let Some(previous) = displaced
            && !map.values().any(|entry| entry.id == previous)
        {
            warn!(id = previous, "alias took the last source of a comic, deleting it");
            self.remove_record(previous).await?;
        }
        Ok(())
    }

    /// Strips the map first, then deletes the record; a failure in between
    /// leaves an unreachable record rather than a dangling map entry.
    pub async fn unregister_comic(&self, id: ComicId) -> Result<(), DataError> {
        let mut map = self.scheme.get_map().await?;
        let before = map.len();
        map.retain(|_, entry| entry.id != id);
        self.scheme.save_map(&map).await?;
        self.remove_record(id).await?;
        info!(id, sources = before - map.len(), "comic unregistered");
        Ok(())
    }

    pub async fn unalias_comic(&self, id: ComicId, reader: &str, name: &str) -> Result<(), DataError> {
        let mut map = self.scheme.get_map().await?;
        let key = ComicSource::new(reader, name).key();
        if map.get(&key).map(|entry| entry.id) != Some(id) {
            return Err(DataError::SourceNotFound {
                id,
                reader: reader.to_owned(),
                name: name.to_owned(),
            });
        }

        let sources = map.values().filter(|entry| entry.id == id).count();
        if sources == 1 {
            debug!(id, reader, name, "last source removed, unregistering");
            return self.unregister_comic(id).await;
        }

        map.remove(&key);
        self.scheme.save_map(&map).await?;
        info!(id, reader, name, "comic source removed");
        Ok(())
    }

    /// Moves the tracked position forward. Re-tracking the current position
    /// succeeds without writing.
    pub async fn update_comic(&self, id: ComicId, chapter: u32, page: Option<u32>) -> Result<(), DataError> {
        let Some(mut record) = self.load_record(id).await? else {
            return Err(DataError::NotFound { id });
        };

        if record.tracking.is_ahead_of(chapter, page) {
            warn!(id, chapter, ?page, current = ?record.tracking, "refusing backward progress");
            return Err(DataError::BackwardProgress {
                id,
                current: record.tracking,
                requested: Tracking::new(chapter, page),
            });
        }
        if record.tracking.is_at(chapter, page) {
            tokio::task::yield_now().await;
            return Ok(());
        }

        record.tracking = Tracking::new(chapter, page);
        let key = KeyScheme::key_from_id(id);
        let mut dataset = bmc_storage::Dataset::new();
        dataset.insert(key.clone(), encode(&key, &record)?);
        self.storage.set(dataset).await?;
        info!(id, chapter, ?page, "progress updated");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Comic>, DataError> {
        let mut data = self.storage.get(KeyQuery::All).await?;
        let map = map_from(&mut data)?;
        hydrate(records_from(&data)?, &map)
    }

    pub async fn get_comic(&self, id: ComicId) -> Result<Option<Comic>, DataError> {
        let key = KeyScheme::key_from_id(id);
        let mut data = self
            .storage
            .get(KeyQuery::Keys(vec![key.clone(), MAP_KEY.to_owned()]))
            .await?;
        let map = map_from(&mut data)?;
        let Some(raw) = data.remove(&key) else {
            return Ok(None);
        };
        let record: ComicRecord = decode(&key, raw)?;
        Ok(hydrate(vec![record], &map)?.pop())
    }

    pub async fn find_label(&self, label: &str) -> Result<Option<ComicId>, DataError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|comic| comic.label() == label)
            .map(|comic| comic.id()))
    }

    pub async fn ensure_label_available(&self, label: &str) -> Result<(), DataError> {
        match self.find_label(label).await? {
            Some(id) => Err(DataError::DuplicateLabel {
                label: label.to_owned(),
                id,
            }),
            None => Ok(()),
        }
    }
}

fn hydrate(records: Vec<ComicRecord>, map: &SourceMap) -> Result<Vec<Comic>, DataError> {
    let mut inverse = invert(map)?;
    Ok(records
        .into_iter()
        .map(|record| {
            let sources = inverse.remove(&record.id).unwrap_or_default();
            let mut comic = Comic::new(record);
            for source in sources {
                if let Err(err) = comic.add_source(source) {
                    warn!(%err, "skipping duplicate source");
                }
            }
            comic
        })
        .collect())
}
