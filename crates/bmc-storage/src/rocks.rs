//! RocksDB-backed area for the native hub. Callback style only, like the
//! chromium storage areas it stands in for.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bmc_compat::{CompatError, HostCallback, HostPrimitive};
use rocksdb::{DB, IteratorMode, Options, WriteBatch};
use serde_json::Value;

use crate::{KeyQuery, StorageArea, StorageOp, host_error};

pub struct RocksDbArea {
    name: String,
    db: Arc<DB>,
}

impl RocksDbArea {
    pub fn open_default(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, rocksdb::Error> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path)?;
        Ok(Self {
            name: name.into(),
            db: Arc::new(db),
        })
    }

    fn load(&self, key: &str) -> Result<Option<Value>, Value> {
        let raw = self.db.get(key.as_bytes()).map_err(backend)?;
        raw.map(|bytes| serde_json::from_slice(&bytes).map_err(|err| host_error(err.to_string())))
            .transpose()
    }

    fn load_all(&self) -> Result<BTreeMap<String, Value>, Value> {
        let mut entries = BTreeMap::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (key, value) = item.map_err(backend)?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let value = serde_json::from_slice(&value).map_err(|err| host_error(err.to_string()))?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    fn run(&self, op: StorageOp) -> Result<Value, Value> {
        match op {
            StorageOp::Get(KeyQuery::All) => Ok(Value::Object(self.load_all()?.into_iter().collect())),
            StorageOp::Get(KeyQuery::Keys(keys)) => {
                let mut found = serde_json::Map::new();
                for key in keys {
                    if let Some(value) = self.load(&key)? {
                        found.insert(key, value);
                    }
                }
                Ok(Value::Object(found))
            }
            StorageOp::Get(KeyQuery::Defaults(defaults)) => {
                let mut found = serde_json::Map::new();
                for (key, default) in defaults {
                    let value = self.load(&key)?.unwrap_or(default);
                    found.insert(key, value);
                }
                Ok(Value::Object(found))
            }
            StorageOp::Set(dataset) => {
                let mut batch = WriteBatch::default();
                for (key, value) in dataset {
                    let bytes = serde_json::to_vec(&value).map_err(|err| host_error(err.to_string()))?;
                    batch.put(key.as_bytes(), bytes);
                }
                self.db.write(batch).map_err(backend)?;
                Ok(Value::Null)
            }
            StorageOp::Remove(keys) => {
                let mut batch = WriteBatch::default();
                for key in keys {
                    batch.delete(key.as_bytes());
                }
                self.db.write(batch).map_err(backend)?;
                Ok(Value::Null)
            }
            StorageOp::Clear => {
                let mut batch = WriteBatch::default();
                for item in self.db.iterator(IteratorMode::Start) {
                    let (key, _) = item.map_err(backend)?;
                    batch.delete(key);
                }
                self.db.write(batch).map_err(backend)?;
                Ok(Value::Null)
            }
        }
    }
}

fn backend(err: rocksdb::Error) -> Value {
    host_error(err.to_string())
}

impl HostPrimitive for RocksDbArea {
    type Args = StorageOp;

    fn call_with_callback(&self, op: StorageOp, done: HostCallback) -> Result<(), CompatError> {
        match self.run(op) {
            Ok(data) => done(None, Some(data)),
            Err(err) => done(Some(err), None),
        }
        Ok(())
    }
}

impl StorageArea for RocksDbArea {
    fn name(&self) -> &str {
        &self.name
    }
}
