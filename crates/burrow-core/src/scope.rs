use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use semver::Version;

use crate::surface::{SharedComponent, SharedSurface};

/// Process-unique identifier of one isolation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoundaryId(u64);

impl BoundaryId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BoundaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "boundary#{}", self.0)
    }
}

/// A file from a module package, owned by exactly one boundary.
#[derive(Debug)]
pub struct PrivateUnit {
    boundary: BoundaryId,
    name: String,
    path: PathBuf,
    bytes: Vec<u8>,
}

impl PrivateUnit {
    /// Boundary that owns this unit.
    pub fn boundary(&self) -> BoundaryId {
        self.boundary
    }

    /// Package-relative name, `/`-separated.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Contents as UTF-8, if they are.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

/// Result of resolving a name inside a boundary.
#[derive(Debug, Clone)]
pub enum Resolved {
    Shared(Arc<SharedComponent>),
    Private(Arc<PrivateUnit>),
}

impl Resolved {
    pub fn name(&self) -> &str {
        match self {
            Resolved::Shared(component) => component.name(),
            Resolved::Private(unit) => unit.name(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Resolved::Shared(_))
    }
}

/// Resolution failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The boundary has been torn down.
    Closed(BoundaryId),
    NotFound { boundary: BoundaryId, name: String },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(boundary) => write!(f, "{boundary} is closed"),
            Self::NotFound { boundary, name } => {
                write!(f, "{name:?} does not resolve inside {boundary}")
            }
        }
    }
}

impl std::error::Error for ResolveError {}

/// Host-side owner of one boundary's private units.
///
/// Module code never sees the arena; it receives a [`ModuleScope`], which can
/// only resolve. Closing the arena drops every strong reference the arena
/// holds, after which all resolution through any scope fails.
#[derive(Debug)]
pub struct ScopeArena {
    id: BoundaryId,
    module: String,
    surface: Weak<SharedSurface>,
    visible: BTreeSet<String>,
    units: RwLock<Option<BTreeMap<String, Arc<PrivateUnit>>>>,
}

impl ScopeArena {
    /// Open an empty arena that sees `visible` names of `surface`.
    pub fn open(
        module: impl Into<String>,
        surface: &Arc<SharedSurface>,
        visible: impl IntoIterator<Item = String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: BoundaryId::next(),
            module: module.into(),
            surface: Arc::downgrade(surface),
            visible: visible.into_iter().collect(),
            units: RwLock::new(Some(BTreeMap::new())),
        })
    }

    pub fn id(&self) -> BoundaryId {
        self.id
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Add a private unit and return a weak reference for reclamation tracking.
    pub fn insert(
        &self,
        name: impl Into<String>,
        path: PathBuf,
        bytes: Vec<u8>,
    ) -> Result<Weak<PrivateUnit>, ResolveError> {
        let name = name.into();
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        let units = units.as_mut().ok_or(ResolveError::Closed(self.id))?;

        let unit = Arc::new(PrivateUnit {
            boundary: self.id,
            name: name.clone(),
            path,
            bytes,
        });
        let weak = Arc::downgrade(&unit);
        units.insert(name, unit);
        Ok(weak)
    }

    /// Drop the arena's references. Returns how many units it was holding.
    pub fn close(&self) -> usize {
        let mut units = self.units.write().unwrap_or_else(PoisonError::into_inner);
        units.take().map(|units| units.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Shared-surface names this arena resolves.
    pub fn visible(&self) -> impl Iterator<Item = &str> + '_ {
        self.visible.iter().map(String::as_str)
    }

    pub fn scope(self: &Arc<Self>) -> ModuleScope {
        ModuleScope {
            arena: Arc::clone(self),
        }
    }
}

/// Read-only resolution view into one boundary.
///
/// Resolution order is the allowlisted shared surface first, then the
/// module's private units. Nothing else is reachable.
#[derive(Debug, Clone)]
pub struct ModuleScope {
    arena: Arc<ScopeArena>,
}

impl ModuleScope {
    pub fn boundary_id(&self) -> BoundaryId {
        self.arena.id
    }

    /// `id@version` label of the owning module.
    pub fn module(&self) -> &str {
        &self.arena.module
    }

    pub fn resolve(&self, name: &str) -> Result<Resolved, ResolveError> {
        match self.resolve_shared(name) {
            Ok(component) => Ok(Resolved::Shared(component)),
            Err(ResolveError::NotFound { .. }) => self.resolve_private(name).map(Resolved::Private),
            Err(err) => Err(err),
        }
    }

    /// Resolve against the shared surface only.
    pub fn resolve_shared(&self, name: &str) -> Result<Arc<SharedComponent>, ResolveError> {
        self.ensure_open()?;
        let not_found = || ResolveError::NotFound {
            boundary: self.arena.id,
            name: name.to_string(),
        };
        if !self.arena.visible.contains(name) {
            return Err(not_found());
        }
        let surface = self.arena.surface.upgrade().ok_or_else(not_found)?;
        surface.get(name).cloned().ok_or_else(not_found)
    }

    /// Resolve against this module's private units only.
    pub fn resolve_private(&self, name: &str) -> Result<Arc<PrivateUnit>, ResolveError> {
        let units = self
            .arena
            .units
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let units = units.as_ref().ok_or(ResolveError::Closed(self.arena.id))?;
        units
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                boundary: self.arena.id,
                name: name.to_string(),
            })
    }

    /// Contract version of the shared surface, while the host still holds it.
    pub fn contract_version(&self) -> Option<Version> {
        self.arena
            .surface
            .upgrade()
            .map(|surface| surface.contract_version().clone())
    }

    /// Shared-surface names this scope may resolve, sorted.
    pub fn visible_names(&self) -> Vec<String> {
        self.arena.visible.iter().cloned().collect()
    }

    /// Names of the private units, sorted. Empty once closed.
    pub fn private_names(&self) -> Vec<String> {
        self.arena
            .units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|units| units.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<(), ResolveError> {
        if self.arena.is_closed() {
            Err(ResolveError::Closed(self.arena.id))
        } else {
            Ok(())
        }
    }
}
