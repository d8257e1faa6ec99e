use bmc_compat::{
    CallMode, CompatError, CompatibilityLayer, HostCallback, HostPrimitive, HostPromise,
};
use futures::FutureExt;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

#[cfg(feature = "rocksdb")]
mod rocks;
pub mod settings;

#[cfg(feature = "rocksdb")]
pub use rocks::RocksDbArea;
pub use settings::{AreaSet, SETTINGS_KEY, Settings, StorageEngine};

pub type Dataset = Map<String, Value>;

/// Which keys a `get` reads.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyQuery {
    All,
    Keys(Vec<String>),
    /// Reads these keys, answering the given default for absent ones.
    Defaults(Dataset),
}

impl KeyQuery {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Keys(vec![key.into()])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageOp {
    Get(KeyQuery),
    Set(Dataset),
    Remove(Vec<String>),
    Clear,
}

/// One host key/value area (synchronized or local).
pub trait StorageArea: HostPrimitive<Args = StorageOp> {
    fn name(&self) -> &str;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error(transparent)]
    Host(#[from] CompatError),
    #[error("storage area answered a non-object: {0}")]
    Malformed(Value),
}

impl StorageError {
    /// The value to put in a notification's `error` field.
    pub fn message(&self) -> String {
        match self {
            Self::Host(CompatError::Host(value)) => value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| value.to_string()),
            other => other.to_string(),
        }
    }
}

/// Typed access to a single area through the compatibility layer.
#[derive(Clone)]
pub struct StorageFacade {
    compat: CompatibilityLayer,
    area: Arc<dyn StorageArea>,
}

impl StorageFacade {
    pub fn new(compat: CompatibilityLayer, area: Arc<dyn StorageArea>) -> Self {
        Self { compat, area }
    }

    pub fn area_name(&self) -> &str {
        self.area.name()
    }

    pub fn compat(&self) -> CompatibilityLayer {
        self.compat
    }

    pub async fn get(&self, query: KeyQuery) -> Result<Dataset, StorageError> {
        let data = self
            .compat
            .invoke(self.area.as_ref(), StorageOp::Get(query))
            .await?;
        match data {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Dataset::new()),
            other => Err(StorageError::Malformed(other)),
        }
    }

    pub async fn get_one(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let mut data = self.get(KeyQuery::key(key)).await?;
        Ok(data.remove(key))
    }

    pub async fn set(&self, dataset: Dataset) -> Result<(), StorageError> {
        debug!(area = self.area.name(), keys = dataset.len(), "storage set");
        self.compat
            .invoke(self.area.as_ref(), StorageOp::Set(dataset))
            .await?;
        Ok(())
    }

    pub async fn remove(&self, keys: Vec<String>) -> Result<(), StorageError> {
        debug!(area = self.area.name(), ?keys, "storage remove");
        self.compat
            .invoke(self.area.as_ref(), StorageOp::Remove(keys))
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        debug!(area = self.area.name(), "storage clear");
        self.compat.invoke(self.area.as_ref(), StorageOp::Clear).await?;
        Ok(())
    }
}

/// Applies `op` to an ordered map; shared by the in-process areas.
pub(crate) fn apply(entries: &mut BTreeMap<String, Value>, op: StorageOp) -> Value {
    match op {
        StorageOp::Get(KeyQuery::All) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        StorageOp::Get(KeyQuery::Keys(keys)) => Value::Object(
            keys.into_iter()
                .filter_map(|key| entries.get(&key).cloned().map(|value| (key, value)))
                .collect(),
        ),
        StorageOp::Get(KeyQuery::Defaults(defaults)) => Value::Object(
            defaults
                .into_iter()
                .map(|(key, default)| {
                    let value = entries.get(&key).cloned().unwrap_or(default);
                    (key, value)
                })
                .collect(),
        ),
        StorageOp::Set(dataset) => {
            entries.extend(dataset);
            Value::Null
        }
        StorageOp::Remove(keys) => {
            for key in keys {
                entries.remove(&key);
            }
            Value::Null
        }
        StorageOp::Clear => {
            entries.clear();
            Value::Null
        }
    }
}

/// Process-local area reachable in both call styles.
#[derive(Default)]
pub struct InMemoryArea {
    name: String,
    entries: Mutex<BTreeMap<String, Value>>,
    pending_failure: Mutex<Option<(usize, Value)>>,
}

impl InMemoryArea {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The next operation is not applied and reports `err` instead.
    pub fn fail_next(&self, err: Value) {
        self.fail_nth(0, err);
    }

    /// Lets `skip` operations through, then fails the following one.
    pub fn fail_nth(&self, skip: usize, err: Value) {
        *self
            .pending_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((skip, err));
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn run(&self, op: StorageOp) -> Result<Value, Value> {
        {
            let mut pending = self
                .pending_failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match pending.take() {
                Some((0, err)) => return Err(err),
                Some((skip, err)) => *pending = Some((skip - 1, err)),
                None => {}
            }
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(apply(&mut entries, op))
    }
}

impl HostPrimitive for InMemoryArea {
    type Args = StorageOp;

    fn call_with_callback(&self, op: StorageOp, done: HostCallback) -> Result<(), CompatError> {
        match self.run(op) {
            Ok(data) => done(None, Some(data)),
            Err(err) => done(Some(err), None),
        }
        Ok(())
    }

    fn call_with_promise(&self, op: StorageOp) -> Result<HostPromise, CompatError> {
        let outcome = self.run(op);
        Ok(async move { outcome }.boxed())
    }
}

impl StorageArea for InMemoryArea {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Facade over a fresh in-memory area, callback style.
pub fn in_memory(name: &str) -> (StorageFacade, Arc<InMemoryArea>) {
    let area = Arc::new(InMemoryArea::new(name));
    let facade = StorageFacade::new(CompatibilityLayer::new(CallMode::Callback), area.clone());
    (facade, area)
}

/// Error value in the shape hosts use (`{message}`).
pub fn host_error(message: impl Into<String>) -> Value {
    json!({ "message": message.into() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(value: Value) -> Dataset {
        match value {
            Value::Object(map) => map,
            _ => Dataset::new(),
        }
    }

    #[tokio::test]
    async fn get_set_remove_clear_round_trip() -> anyhow::Result<()> {
        for mode in [CallMode::Callback, CallMode::Promise] {
            let area = Arc::new(InMemoryArea::new("LocalStorage"));
            let storage = StorageFacade::new(CompatibilityLayer::new(mode), area.clone());

            storage.set(dataset(json!({"a": 1, "b": {"c": true}}))).await?;
            assert_eq!(storage.get_one("a").await?, Some(json!(1)));
            assert_eq!(storage.get(KeyQuery::All).await?.len(), 2);

            storage.remove(vec!["a".to_owned()]).await?;
            assert_eq!(storage.get_one("a").await?, None);

            storage.clear().await?;
            assert!(area.snapshot().is_empty());
        }
        Ok(())
    }

    #[tokio::test]
    async fn defaults_fill_only_absent_keys() -> anyhow::Result<()> {
        let (storage, _area) = in_memory("LocalStorage");
        storage.set(dataset(json!({"present": "stored"}))).await?;

        let data = storage
            .get(KeyQuery::Defaults(dataset(json!({"present": "dflt", "absent": {"lastId": -1}}))))
            .await?;
        assert_eq!(data["present"], json!("stored"));
        assert_eq!(data["absent"], json!({"lastId": -1}));
        Ok(())
    }

    #[tokio::test]
    async fn host_failures_surface_and_empty_errors_do_not() -> anyhow::Result<()> {
        let (storage, area) = in_memory("SyncStorage");

        area.fail_next(host_error("QUOTA_BYTES_PER_ITEM quota exceeded"));
        let err = storage.set(dataset(json!({"k": 1}))).await.unwrap_err();
        assert_eq!(err.message(), "QUOTA_BYTES_PER_ITEM quota exceeded");
        assert!(area.snapshot().is_empty());

        area.fail_next(json!({}));
        assert!(storage.get(KeyQuery::All).await?.is_empty());
        Ok(())
    }
}
