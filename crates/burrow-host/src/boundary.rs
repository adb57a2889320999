use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use burrow_config::{TeardownConfig, MANIFEST_FILE};
use burrow_core::cancel::Cancellation;
use burrow_core::event::{LifecycleEvent, LifecycleObserver};
use burrow_core::scope::{BoundaryId, ModuleScope, PrivateUnit, ScopeArena};
use burrow_core::surface::SharedSurface;

use crate::error::{LoadError, TeardownError};

/// Something a boundary must see released before it counts as reclaimed,
/// beyond its private units (a child process, a temp directory, ...).
pub trait Reclaimable: Send {
    /// Short description used when reporting what is still outstanding.
    fn label(&self) -> &str;

    /// Make progress on releasing the resource. `Ok(true)` means it is gone.
    /// Called once per reclamation pass until it reports `true`.
    fn try_reclaim(&mut self) -> anyhow::Result<bool>;
}

/// Bounds on the reclamation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self::from_config(&TeardownConfig::default())
    }
}

impl ReclaimPolicy {
    pub fn from_config(config: &TeardownConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Delay before pass `attempt + 1`: doubling from the initial backoff,
    /// capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Result of a completed teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    /// Reclamation passes it took; zero when the boundary was already reclaimed.
    pub passes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    /// Closed to resolution but with references still outstanding.
    Inert,
    Reclaimed,
}

/// The isolated resolution scope of one loaded module.
///
/// Owns every private unit read from the module package (through its
/// [`ScopeArena`]) and every resource registered with it. Borrows the shared
/// surface weakly. Teardown is explicit: [`teardown`](Boundary::teardown)
/// closes the arena and then polls until nothing it owned is still alive, or
/// gives up after a bounded number of passes.
pub struct Boundary {
    arena: Arc<ScopeArena>,
    root: PathBuf,
    manifest: PathBuf,
    tracked: Vec<(String, Weak<PrivateUnit>)>,
    resources: Vec<Box<dyn Reclaimable>>,
    state: State,
    observer: Arc<dyn LifecycleObserver>,
}

impl Boundary {
    /// Open an empty boundary for the package at `root`.
    pub fn open(
        module: impl Into<String>,
        root: impl Into<PathBuf>,
        surface: &Arc<SharedSurface>,
        visible: impl IntoIterator<Item = String>,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Self {
        let module = module.into();
        let arena = ScopeArena::open(module.clone(), surface, visible);
        observer.observe(LifecycleEvent::BoundaryCreated {
            boundary: arena.id(),
            module,
        });

        let root = root.into();
        Self {
            arena,
            manifest: root.join(MANIFEST_FILE),
            root,
            tracked: Vec::new(),
            resources: Vec::new(),
            state: State::Open,
            observer,
        }
    }

    /// Manifest file to leave out of the private units. Defaults to
    /// `module.toml` at the package root.
    pub fn with_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest = path.into();
        self
    }

    pub fn id(&self) -> BoundaryId {
        self.arena.id()
    }

    pub fn module(&self) -> &str {
        self.arena.module()
    }

    /// Package directory the private units were read from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scope(&self) -> ModuleScope {
        self.arena.scope()
    }

    pub fn is_reclaimed(&self) -> bool {
        self.state == State::Reclaimed
    }

    /// Read every file of the package (except its manifest) into the arena.
    ///
    /// Polls `cancel` between files. On error the boundary keeps whatever it
    /// already read; the caller owns tearing it down.
    pub fn load_package(&mut self, cancel: &Cancellation) -> Result<usize, LoadError> {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        let files = package_files(&self.root, &self.manifest)?;
        for (name, path) in files {
            if cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            let bytes = fs::read(&path).map_err(|err| LoadError::PackageUnreadable {
                path: path.clone(),
                message: err.to_string(),
            })?;
            let weak = self
                .arena
                .insert(name.clone(), path, bytes)
                .map_err(|err| LoadError::InvalidRequest(err.to_string()))?;
            self.tracked.push((name, weak));
        }

        tracing::debug!(
            boundary = %self.id(),
            module = self.module(),
            units = self.tracked.len(),
            "boundary populated"
        );
        Ok(self.tracked.len())
    }

    /// True if the package ships `name` as a file or as a directory.
    pub fn ships(&self, name: &str) -> bool {
        let prefix = format!("{name}/");
        self.tracked
            .iter()
            .any(|(unit, _)| unit == name || unit.starts_with(&prefix))
    }

    /// Add a resource that must be released before the boundary is reclaimed.
    pub fn register_resource(&mut self, resource: Box<dyn Reclaimable>) {
        tracing::trace!(boundary = %self.id(), resource = resource.label(), "resource registered");
        self.resources.push(resource);
    }

    /// Close the boundary and wait, in bounded passes, for everything it owned
    /// to be released.
    ///
    /// Calling this on a reclaimed boundary is a no-op. After a timeout or
    /// cancellation the boundary stays closed (inert) and a later call resumes
    /// polling.
    pub fn teardown(
        &mut self,
        policy: &ReclaimPolicy,
        cancel: &Cancellation,
    ) -> Result<TeardownReport, TeardownError> {
        if self.state == State::Reclaimed {
            return Ok(TeardownReport { passes: 0 });
        }

        let boundary = self.id();
        self.observer
            .observe(LifecycleEvent::TeardownRequested { boundary });
        let dropped = self.arena.close();
        self.state = State::Inert;
        tracing::debug!(boundary = %boundary, dropped, "boundary closed");

        let attempts = policy.max_attempts.max(1);
        let mut outstanding = Vec::new();
        for attempt in 1..=attempts {
            outstanding = self.reclaim_pass();
            if outstanding.is_empty() {
                self.state = State::Reclaimed;
                self.observer.observe(LifecycleEvent::BoundaryReclaimed {
                    boundary,
                    passes: attempt,
                });
                return Ok(TeardownReport { passes: attempt });
            }
            if cancel.is_cancelled() {
                return Err(TeardownError::Cancelled {
                    boundary,
                    outstanding,
                });
            }
            if attempt < attempts {
                thread::sleep(policy.backoff(attempt));
            }
        }

        self.observer.observe(LifecycleEvent::TeardownTimedOut {
            boundary,
            attempts,
            outstanding: outstanding.clone(),
        });
        Err(TeardownError::Timeout {
            boundary,
            attempts,
            outstanding,
        })
    }

    /// One reclamation pass. Returns labels of whatever is still alive.
    fn reclaim_pass(&mut self) -> Vec<String> {
        let boundary = self.id();
        self.resources
            .retain_mut(|resource| match resource.try_reclaim() {
                Ok(done) => !done,
                Err(err) => {
                    tracing::warn!(
                        boundary = %boundary,
                        resource = resource.label(),
                        "failed to reclaim resource: {err:#}"
                    );
                    true
                }
            });
        self.tracked.retain(|(_, unit)| unit.strong_count() > 0);

        self.resources
            .iter()
            .map(|resource| resource.label().to_string())
            .chain(self.tracked.iter().map(|(name, _)| format!("unit {name}")))
            .collect()
    }
}

impl Drop for Boundary {
    fn drop(&mut self) {
        if self.state == State::Reclaimed {
            return;
        }
        self.arena.close();
        let outstanding = self.reclaim_pass();
        if !outstanding.is_empty() {
            tracing::warn!(
                boundary = %self.id(),
                module = self.module(),
                outstanding = ?outstanding,
                "boundary dropped before it was reclaimed"
            );
        }
    }
}

/// Package files as (`/`-separated relative name, path), sorted by name.
///
/// Symlinks are followed as long as their target stays inside the package;
/// a link that dangles or escapes the root fails the load. The unit name is
/// always the link's own path.
fn package_files(root: &Path, manifest: &Path) -> Result<Vec<(String, PathBuf)>, LoadError> {
    let unreadable = |path: &Path, err: std::io::Error| LoadError::PackageUnreadable {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    let real_root = fs::canonicalize(root).map_err(|err| unreadable(root, err))?;
    let real_manifest = fs::canonicalize(manifest).ok();

    let mut files = Vec::new();
    let mut stack = vec![(root.to_path_buf(), vec![real_root.clone()])];
    while let Some((dir, ancestors)) = stack.pop() {
        for entry in fs::read_dir(&dir).map_err(|err| unreadable(&dir, err))? {
            let entry = entry.map_err(|err| unreadable(&dir, err))?;
            let path = entry.path();
            let mut file_type = entry.file_type().map_err(|err| unreadable(&path, err))?;
            let mut real = path.clone();

            if file_type.is_symlink() {
                real = fs::canonicalize(&path).map_err(|err| LoadError::PackageUnreadable {
                    path: path.clone(),
                    message: format!("symlink cannot be followed: {err}"),
                })?;
                if !real.starts_with(&real_root) {
                    return Err(LoadError::PackageUnreadable {
                        path: path.clone(),
                        message: format!(
                            "symlink points outside the package, to {}",
                            real.display()
                        ),
                    });
                }
                file_type = fs::metadata(&real)
                    .map_err(|err| unreadable(&path, err))?
                    .file_type();
            }

            if file_type.is_dir() {
                let real_dir = fs::canonicalize(&path).map_err(|err| unreadable(&path, err))?;
                // A link back to an enclosing directory would loop.
                if !ancestors.contains(&real_dir) {
                    let mut chain = ancestors.clone();
                    chain.push(real_dir);
                    stack.push((path, chain));
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            if path == manifest || real_manifest.as_deref() == Some(real.as_path()) {
                continue;
            }

            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let name = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push((name, path));
        }
    }

    files.sort();
    Ok(files)
}
