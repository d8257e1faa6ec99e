//! `storage.sync` / `storage.local` as [`StorageArea`]s.

use std::sync::Arc;

use bmc_compat::{CompatError, HostCallback, HostPrimitive, HostPromise};
use bmc_storage::{AreaSet, KeyQuery, StorageArea, StorageOp};
use wasm_bindgen::JsValue;

use crate::host::{bridge, call, completion, host_failure, lookup, namespace, to_js};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaKind {
    Sync,
    Local,
}

impl AreaKind {
    fn key(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Local => "local",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Sync => "SyncStorage",
            Self::Local => "LocalStorage",
        }
    }
}

pub struct ExtensionArea {
    kind: AreaKind,
}

impl ExtensionArea {
    pub fn local() -> Self {
        Self { kind: AreaKind::Local }
    }

    pub fn sync() -> Self {
        Self { kind: AreaKind::Sync }
    }

    /// Some hosts ship without `storage.sync`.
    pub fn is_available(&self) -> bool {
        self.area().is_some()
    }

    fn area(&self) -> Option<JsValue> {
        lookup(&namespace()?, &["storage", self.kind.key()])
    }

    fn start(&self, op: StorageOp, trailing: Option<JsValue>) -> Result<JsValue, CompatError> {
        let area = self
            .area()
            .ok_or_else(|| host_failure(format!("storage.{} is unavailable", self.kind.key())))?;
        let (method, mut args) = match op {
            StorageOp::Get(KeyQuery::All) => ("get", vec![JsValue::NULL]),
            StorageOp::Get(KeyQuery::Keys(keys)) => ("get", vec![to_js(&keys)?]),
            StorageOp::Get(KeyQuery::Defaults(defaults)) => ("get", vec![to_js(&defaults)?]),
            StorageOp::Set(dataset) => ("set", vec![to_js(&dataset)?]),
            StorageOp::Remove(keys) => ("remove", vec![to_js(&keys)?]),
            StorageOp::Clear => ("clear", Vec::new()),
        };
        args.extend(trailing);
        call(&area, method, &args)
    }
}

impl HostPrimitive for ExtensionArea {
    type Args = StorageOp;

    fn call_with_callback(&self, args: StorageOp, done: HostCallback) -> Result<(), CompatError> {
        self.start(args, Some(completion(done))).map(drop)
    }

    fn call_with_promise(&self, args: StorageOp) -> Result<HostPromise, CompatError> {
        bridge(self.start(args, None)?)
    }
}

impl StorageArea for ExtensionArea {
    fn name(&self) -> &str {
        self.kind.name()
    }
}

/// `storage.local`, plus `storage.sync` when the host has it.
pub fn areas() -> AreaSet {
    let sync = ExtensionArea::sync();
    let sync: Option<Arc<dyn StorageArea>> = if sync.is_available() {
        Some(Arc::new(sync))
    } else {
        None
    };
    AreaSet::new(Arc::new(ExtensionArea::local()), sync)
}
