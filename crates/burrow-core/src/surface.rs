use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use semver::Version;

/// One component the host exposes to every boundary.
///
/// Identity is the identity of the `Arc<SharedComponent>` held by the
/// surface: every boundary that resolves the name receives that same
/// allocation.
pub struct SharedComponent {
    name: String,
    version: Version,
    value: Arc<dyn Any + Send + Sync>,
}

impl SharedComponent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Borrow the component value as `T`, if that is its type.
    pub fn value<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for SharedComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedComponent")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Read-only set of shared components, created once at process start.
///
/// Boundaries hold it weakly and never mutate it, so any number of threads may
/// read it without synchronization.
#[derive(Debug)]
pub struct SharedSurface {
    contract_version: Version,
    components: BTreeMap<String, Arc<SharedComponent>>,
}

impl SharedSurface {
    pub fn builder(contract_version: Version) -> SharedSurfaceBuilder {
        SharedSurfaceBuilder {
            contract_version,
            components: BTreeMap::new(),
        }
    }

    /// Version of the contract this surface implements.
    pub fn contract_version(&self) -> &Version {
        &self.contract_version
    }

    pub fn get(&self, name: &str) -> Option<&Arc<SharedComponent>> {
        self.components.get(name)
    }

    pub fn exports(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    /// Exported component names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.components.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Builder for [`SharedSurface`].
pub struct SharedSurfaceBuilder {
    contract_version: Version,
    components: BTreeMap<String, Arc<SharedComponent>>,
}

impl SharedSurfaceBuilder {
    /// Add a component. A later component with the same name replaces the
    /// earlier one.
    pub fn component<T: Any + Send + Sync>(
        mut self,
        name: impl Into<String>,
        version: Version,
        value: T,
    ) -> Self {
        let name = name.into();
        self.components.insert(
            name.clone(),
            Arc::new(SharedComponent {
                name,
                version,
                value: Arc::new(value),
            }),
        );
        self
    }

    pub fn build(self) -> Arc<SharedSurface> {
        Arc::new(SharedSurface {
            contract_version: self.contract_version,
            components: self.components,
        })
    }
}
