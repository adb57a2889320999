use std::collections::BTreeMap;

use anyhow::{bail, Result};
use burrow_config::ModuleKey;

use crate::error::HandleError;
use crate::handle::{DisposeReport, ModuleHandle};

/// The loaded modules of one host, keyed by id and version.
///
/// Two versions of one module id may be loaded side by side; a second handle
/// for the same id and version is refused.
#[derive(Debug, Default)]
pub struct ModuleSet {
    modules: BTreeMap<ModuleKey, ModuleHandle>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: ModuleHandle) -> Result<&ModuleHandle> {
        let key = handle.key();
        if self.modules.contains_key(&key) {
            bail!("module {key} is already loaded");
        }
        Ok(self.modules.entry(key).or_insert(handle))
    }

    pub fn get(&self, key: &ModuleKey) -> Option<&ModuleHandle> {
        self.modules.get(key)
    }

    /// Every loaded version of `id`, oldest first.
    pub fn versions_of(&self, id: &str) -> Vec<&ModuleHandle> {
        self.modules
            .iter()
            .filter(|(key, _)| key.id == id)
            .map(|(_, handle)| handle)
            .collect()
    }

    /// Newest loaded version of `id`.
    pub fn latest(&self, id: &str) -> Option<&ModuleHandle> {
        self.versions_of(id).pop()
    }

    /// Take a handle out of the set. The caller becomes responsible for
    /// disposing it (dropping it also disposes).
    pub fn remove(&mut self, key: &ModuleKey) -> Option<ModuleHandle> {
        self.modules.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ModuleKey> + '_ {
        self.modules.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleHandle> + '_ {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Dispose and drop every module, newest key first. One module failing to
    /// dispose does not stop the others.
    pub fn dispose_all(&mut self) -> Vec<(ModuleKey, Result<DisposeReport, HandleError>)> {
        let modules = std::mem::take(&mut self.modules);
        modules
            .into_iter()
            .rev()
            .map(|(key, handle)| {
                let result = handle.dispose();
                if let Err(err) = &result {
                    tracing::warn!(module = %key, "dispose failed: {err}");
                }
                (key, result)
            })
            .collect()
    }
}
