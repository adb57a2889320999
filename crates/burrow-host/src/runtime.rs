use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
use burrow_config::{ModuleManifest, RuntimeKind};
use burrow_core::cancel::Cancellation;
use burrow_core::capability::ModuleInstance;
use burrow_core::context::ModuleContext;
use burrow_core::scope::PrivateUnit;

use crate::boundary::Boundary;
use crate::error::InstantiateError;

/// Turns a module's entry unit into a live instance.
pub trait ModuleRuntime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Instantiate `entry` inside `boundary`.
    ///
    /// Anything the runtime acquires that outlives this call and is not owned
    /// by the returned instance must be registered with the boundary.
    fn instantiate(
        &self,
        manifest: &ModuleManifest,
        entry: &Arc<PrivateUnit>,
        boundary: &mut Boundary,
        context: ModuleContext,
        cancel: &Cancellation,
    ) -> Result<Arc<dyn ModuleInstance>, InstantiateError>;
}

/// Factory for a module compiled into the host binary.
pub type EntryFactory =
    Arc<dyn Fn(ModuleContext) -> anyhow::Result<Arc<dyn ModuleInstance>> + Send + Sync>;

/// Runtime for modules linked into the host.
///
/// The entry unit is a text file whose first non-empty line names a symbol
/// in this runtime's catalog.
#[derive(Clone, Default)]
pub struct NativeRuntime {
    entries: BTreeMap<String, EntryFactory>,
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, symbol: impl Into<String>, factory: F) -> Self
    where
        F: Fn(ModuleContext) -> anyhow::Result<Arc<dyn ModuleInstance>> + Send + Sync + 'static,
    {
        self.entries.insert(symbol.into(), Arc::new(factory));
        self
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }
}

impl ModuleRuntime for NativeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Native
    }

    fn instantiate(
        &self,
        _manifest: &ModuleManifest,
        entry: &Arc<PrivateUnit>,
        _boundary: &mut Boundary,
        context: ModuleContext,
        cancel: &Cancellation,
    ) -> Result<Arc<dyn ModuleInstance>, InstantiateError> {
        let symbol = entry_symbol(entry)?;
        let factory = self.entries.get(symbol).ok_or_else(|| {
            InstantiateError::EntryNotFound(format!("no native entry named {symbol:?}"))
        })?;

        if cancel.is_cancelled() {
            return Err(InstantiateError::Cancelled);
        }

        match panic::catch_unwind(AssertUnwindSafe(|| factory(context))) {
            Ok(result) => result.map_err(InstantiateError::Failed),
            Err(payload) => Err(InstantiateError::Failed(anyhow!(
                "entry {symbol:?} panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}

fn entry_symbol(entry: &PrivateUnit) -> Result<&str, InstantiateError> {
    let text = entry.text().ok_or_else(|| {
        InstantiateError::EntryNotFound(format!("entry unit {} is not UTF-8 text", entry.name()))
    })?;
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| {
            InstantiateError::EntryNotFound(format!("entry unit {} names no symbol", entry.name()))
        })
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The runtimes a host can start modules with, one per kind.
#[derive(Clone, Default)]
pub struct RuntimeSet {
    runtimes: BTreeMap<RuntimeKind, Arc<dyn ModuleRuntime>>,
}

impl RuntimeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runtime, replacing any earlier one of the same kind.
    pub fn with(mut self, runtime: Arc<dyn ModuleRuntime>) -> Self {
        self.runtimes.insert(runtime.kind(), runtime);
        self
    }

    pub fn get(&self, kind: RuntimeKind) -> Option<&Arc<dyn ModuleRuntime>> {
        self.runtimes.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = RuntimeKind> + '_ {
        self.runtimes.keys().copied()
    }
}
