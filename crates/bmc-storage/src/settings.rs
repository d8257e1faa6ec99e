//! Persisted extension settings and storage-area selection.

use std::fmt;
use std::sync::Arc;

use bmc_compat::CompatibilityLayer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{Dataset, StorageArea, StorageError, StorageFacade};

/// Settings always live in the local area, whatever engine holds the data.
pub const SETTINGS_KEY: &str = "BookMyComics.settings";
pub const STORAGE_ENGINE: &str = "storage-engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageEngine {
    #[serde(rename = "SyncStorage")]
    Sync,
    #[serde(rename = "LocalStorage")]
    Local,
}

impl StorageEngine {
    pub const ALL: [StorageEngine; 2] = [StorageEngine::Local, StorageEngine::Sync];

    pub fn name(self) -> &'static str {
        match self {
            Self::Sync => "SyncStorage",
            Self::Local => "LocalStorage",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|engine| engine.name() == name)
    }
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct Settings {
    storage: StorageFacade,
    values: Dataset,
}

impl Settings {
    pub fn new(local: StorageFacade) -> Self {
        Self {
            storage: local,
            values: Dataset::new(),
        }
    }

    /// Reloads the cached values; a missing or malformed entry reads as empty.
    pub async fn refresh(&mut self) -> Result<(), StorageError> {
        self.values = match self.storage.get_one(SETTINGS_KEY).await? {
            Some(Value::Object(values)) => values,
            _ => Dataset::new(),
        };
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub async fn set(&mut self, key: &str, value: Value) -> Result<(), StorageError> {
        self.values.insert(key.to_owned(), value);
        let mut dataset = Dataset::new();
        dataset.insert(SETTINGS_KEY.to_owned(), Value::Object(self.values.clone()));
        self.storage.set(dataset).await
    }

    pub fn storage_engine(&self) -> Option<StorageEngine> {
        let name = self.get(STORAGE_ENGINE)?.as_str()?;
        let engine = StorageEngine::from_name(name);
        if engine.is_none() {
            warn!(name, "ignoring unknown storage engine setting");
        }
        engine
    }

    /// The saved engine, else sync when the host offers it, else local.
    pub fn default_engine(&self, sync_available: bool) -> StorageEngine {
        self.storage_engine().unwrap_or(if sync_available {
            StorageEngine::Sync
        } else {
            StorageEngine::Local
        })
    }
}

/// The areas a host offers. The synchronized one is optional.
#[derive(Clone)]
pub struct AreaSet {
    local: Arc<dyn StorageArea>,
    sync: Option<Arc<dyn StorageArea>>,
}

impl AreaSet {
    pub fn new(local: Arc<dyn StorageArea>, sync: Option<Arc<dyn StorageArea>>) -> Self {
        Self { local, sync }
    }

    pub fn sync_available(&self) -> bool {
        self.sync.is_some()
    }

    pub fn area(&self, engine: StorageEngine) -> Option<Arc<dyn StorageArea>> {
        match engine {
            StorageEngine::Local => Some(self.local.clone()),
            StorageEngine::Sync => self.sync.clone(),
        }
    }

    pub fn facade(&self, compat: CompatibilityLayer, engine: StorageEngine) -> Option<StorageFacade> {
        self.area(engine).map(|area| StorageFacade::new(compat, area))
    }

    pub fn local_facade(&self, compat: CompatibilityLayer) -> StorageFacade {
        StorageFacade::new(compat, self.local.clone())
    }

    /// Loads the settings and opens the configured data area, falling back to
    /// local when the configured one is not offered.
    pub async fn open(
        &self,
        compat: CompatibilityLayer,
    ) -> Result<(Settings, StorageEngine, StorageFacade), StorageError> {
        let mut settings = Settings::new(self.local_facade(compat));
        settings.refresh().await?;

        let wanted = settings.default_engine(self.sync_available());
        let (engine, facade) = match self.facade(compat, wanted) {
            Some(facade) => (wanted, facade),
            None => {
                warn!(%wanted, "configured storage engine unavailable, using local");
                (StorageEngine::Local, self.local_facade(compat))
            }
        };
        info!(%engine, "storage engine selected");
        Ok((settings, engine, facade))
    }
}
