//! Whole-store operations: start-up repair, export and import.

use std::collections::BTreeSet;

use bmc_api_types::ComicId;
use bmc_storage::{Dataset, KeyQuery, SETTINGS_KEY};
use serde_json::Value;
use tracing::{info, warn};

use crate::scheme::{AllocatorState, KeyScheme, STATE_KEY, decode, invert, map_from, records_from};
use crate::{DataApi, DataError};

const IMPORT: &str = "import";

/// What [`DataApi::reconcile`] had to repair.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub dropped_entries: Vec<String>,
    pub dropped_records: Vec<ComicId>,
    pub raised_last_id: Option<i64>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.dropped_entries.is_empty() && self.dropped_records.is_empty() && self.raised_last_id.is_none()
    }
}

fn import_error(reason: impl Into<String>) -> DataError {
    DataError::Decode {
        key: IMPORT.to_owned(),
        reason: reason.into(),
    }
}

impl DataApi {
    /// Drops map entries without a record, records no entry reaches, and
    /// raises `lastId` above every stored id.
    pub async fn reconcile(&self) -> Result<ReconcileReport, DataError> {
        let mut data = self.storage().get(KeyQuery::All).await?;
        let mut map = map_from(&mut data)?;
        let ids: BTreeSet<ComicId> = records_from(&data)?.iter().map(|record| record.id).collect();
        let mut report = ReconcileReport::default();

        report.dropped_entries = map
            .iter()
            .filter(|(_, entry)| !ids.contains(&entry.id))
            .map(|(key, _)| key.clone())
            .collect();
        if !report.dropped_entries.is_empty() {
            for key in &report.dropped_entries {
                warn!(source = %key, "dropping map entry without a comic");
                map.remove(key);
            }
            self.scheme().save_map(&map).await?;
        }

        let reached: BTreeSet<ComicId> = map.values().map(|entry| entry.id).collect();
        report.dropped_records = ids.difference(&reached).copied().collect();
        if !report.dropped_records.is_empty() {
            warn!(ids = ?report.dropped_records, "removing unreachable comics");
            let keys = report
                .dropped_records
                .iter()
                .map(|id| KeyScheme::key_from_id(*id))
                .collect();
            self.storage().remove(keys).await?;
        }

        let state: AllocatorState = match data.remove(STATE_KEY) {
            Some(raw) => decode(STATE_KEY, raw)?,
            None => AllocatorState::default(),
        };
        if let Some(highest) = ids.last().and_then(|id| i64::try_from(*id).ok())
            && state.last_id < highest
        {
            warn!(last_id = state.last_id, highest, "allocator behind stored ids");
            self.scheme().save_state(AllocatorState { last_id: highest }).await?;
            report.raised_last_id = Some(highest);
        }

        if report.is_clean() {
            info!(comics = ids.len(), "store consistent");
        }
        Ok(report)
    }

    /// The whole area as a JSON document.
    pub async fn export(&self) -> Result<String, DataError> {
        let data = self.storage().get(KeyQuery::All).await?;
        serde_json::to_string(&Value::Object(data)).map_err(|err| DataError::Decode {
            key: "export".to_owned(),
            reason: err.to_string(),
        })
    }

    /// Replaces the area with a previously exported document. The document
    /// is validated before anything is written; current settings survive
    /// unless the document carries its own.
    pub async fn import(&self, payload: &str) -> Result<(), DataError> {
        let value: Value = serde_json::from_str(payload).map_err(|err| import_error(err.to_string()))?;
        let Value::Object(mut data) = value else {
            return Err(import_error("expected a JSON object"));
        };

        let mut scratch = data.clone();
        let map = map_from(&mut scratch)?;
        invert(&map)?;
        let ids: BTreeSet<ComicId> = records_from(&scratch)?.iter().map(|record| record.id).collect();
        if let Some(raw) = scratch.remove(STATE_KEY) {
            decode::<AllocatorState>(STATE_KEY, raw)?;
        }
        if let Some(missing) = map.values().find(|entry| !ids.contains(&entry.id)) {
            return Err(import_error(format!("map points at missing comic {}", missing.id)));
        }

        if !data.contains_key(SETTINGS_KEY)
            && let Some(settings) = self.storage().get_one(SETTINGS_KEY).await?
        {
            data.insert(SETTINGS_KEY.to_owned(), settings);
        }

        self.storage().clear().await?;
        self.storage().set(data).await?;
        info!(comics = ids.len(), sources = map.len(), "store imported");
        Ok(())
    }

    /// Copies every key of this store into `target`, replacing its content.
    pub async fn copy_into(&self, target: &DataApi) -> Result<usize, DataError> {
        let data: Dataset = self.storage().get(KeyQuery::All).await?;
        let keys = data.len();
        target.storage().clear().await?;
        target.storage().set(data).await?;
        info!(
            from = self.storage().area_name(),
            to = target.storage().area_name(),
            keys,
            "store copied"
        );
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmc_api_types::ComicInfo;
    use bmc_storage::{InMemoryArea, host_error};
    use serde_json::json;
    use std::sync::Arc;

    fn api() -> (DataApi, Arc<InMemoryArea>) {
        let (storage, area) = bmc_storage::in_memory("LocalStorage");
        (DataApi::new(storage), area)
    }

    fn dataset(value: Value) -> Dataset {
        match value {
            Value::Object(map) => map,
            _ => Dataset::new(),
        }
    }

    #[tokio::test]
    async fn reconcile_cleans_up_after_an_interrupted_unregister() -> anyhow::Result<()> {
        let (api, area) = api();
        let id = api
            .register_comic("Naruto", "mangakakalot.com", &ComicInfo::new("naruto", Some(1), None))
            .await?;
        area.fail_nth(2, host_error("remove failed"));
        assert!(api.unregister_comic(id).await.is_err());

        let report = api.reconcile().await?;
        assert_eq!(report.dropped_records, vec![id]);
        assert!(report.dropped_entries.is_empty());
        assert!(api.list().await?.is_empty());
        assert!(api.reconcile().await?.is_clean());
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_drops_dangling_entries_and_raises_last_id() -> anyhow::Result<()> {
        let (api, _area) = api();
        api.storage()
            .set(dataset(json!({
                "BookMyComics.state": {"lastId": 1},
                "BookMyComics.map": {
                    "{\"reader\":\"fanfox.net\",\"name\":\"bleach\"}": {"id": 4, "info": {}},
                    "{\"reader\":\"fanfox.net\",\"name\":\"ghost\"}": {"id": 9, "info": {}}
                },
                "BookMyComics.comics.4": {"label": "Bleach", "id": 4, "tracking": {"chapter": 3}}
            })))
            .await?;

        let report = api.reconcile().await?;
        assert_eq!(report.dropped_entries.len(), 1);
        assert!(report.dropped_entries[0].contains("ghost"));
        assert_eq!(report.raised_last_id, Some(4));
        assert_eq!(api.scheme().next_id().await?, 5);
        assert_eq!(api.find_comic("fanfox.net", "bleach").await?, Some(4));
        Ok(())
    }

    #[tokio::test]
    async fn export_then_import_restores_the_store() -> anyhow::Result<()> {
        let (source, _) = api();
        let id = source
            .register_comic("Naruto", "mangakakalot.com", &ComicInfo::new("naruto", Some(5), Some(3)))
            .await?;
        let dump = source.export().await?;

        let (target, area) = api();
        target
            .storage()
            .set(dataset(json!({"BookMyComics.settings": {"storage-engine": "LocalStorage"}, "stale": 1})))
            .await?;
        target.import(&dump).await?;

        assert_eq!(target.find_comic("mangakakalot.com", "naruto").await?, Some(id));
        let snapshot = area.snapshot();
        assert!(!snapshot.contains_key("stale"));
        assert_eq!(snapshot[SETTINGS_KEY], json!({"storage-engine": "LocalStorage"}));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_imports_leave_the_store_alone() -> anyhow::Result<()> {
        let (api, area) = api();
        api.register_comic("Naruto", "mangakakalot.com", &ComicInfo::new("naruto", Some(1), None))
            .await?;
        let before = area.snapshot();

        assert!(api.import("not json").await.is_err());
        assert!(api.import("[1, 2]").await.is_err());
        let dangling = json!({
            "BookMyComics.map": {"{\"reader\":\"a\",\"name\":\"b\"}": {"id": 3, "info": {}}}
        });
        assert!(api.import(&dangling.to_string()).await.is_err());
        let broken_record = json!({"BookMyComics.comics.1": {"label": 3}});
        assert!(api.import(&broken_record.to_string()).await.is_err());

        assert_eq!(area.snapshot(), before);
        Ok(())
    }

    #[tokio::test]
    async fn copy_into_replaces_the_target() -> anyhow::Result<()> {
        let (local, _) = api();
        local
            .register_comic("Naruto", "mangakakalot.com", &ComicInfo::new("naruto", Some(1), None))
            .await?;
        let (sync, _) = api();
        sync.register_comic("Other", "fanfox.net", &ComicInfo::new("other", Some(1), None))
            .await?;

        assert_eq!(local.copy_into(&sync).await?, 3);
        assert_eq!(sync.find_comic("fanfox.net", "other").await?, None);
        assert_eq!(sync.find_comic("mangakakalot.com", "naruto").await?, Some(0));
        Ok(())
    }
}
