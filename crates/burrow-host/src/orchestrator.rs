use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use burrow_config::{ModuleManifest, MANIFEST_FILE};
use burrow_core::cancel::Cancellation;
use burrow_core::capability::{CapabilitySet, ModuleInstance};
use burrow_core::context::{HostContext, ModuleContext};
use burrow_core::event::{LifecycleEvent, LifecycleObserver, TracingObserver};
use burrow_core::surface::SharedSurface;
use semver::Version;

use crate::boundary::Boundary;
use crate::compat::VerdictCache;
use crate::error::{InstantiateError, LoadError};
use crate::handle::{DisposePolicy, ModuleHandle};
use crate::runtime::{panic_message, RuntimeSet};

/// Everything needed to load one module.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    location: PathBuf,
    host_version: Version,
    contract_version: Version,
    shared: Vec<String>,
    context: HostContext,
}

impl LoadRequest {
    /// `location` is the package directory or its `module.toml`.
    pub fn new(location: impl Into<PathBuf>, host_version: Version, contract_version: Version) -> Self {
        Self {
            location: location.into(),
            host_version,
            contract_version,
            shared: Vec::new(),
            context: HostContext::new(),
        }
    }

    /// Allow the module to resolve one more shared-surface component.
    pub fn share(mut self, name: impl Into<String>) -> Self {
        self.shared.push(name.into());
        self
    }

    pub fn share_all(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.shared.extend(names);
        self
    }

    pub fn with_context(mut self, context: HostContext) -> Self {
        self.context = context;
        self
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    pub fn contract_version(&self) -> &Version {
        &self.contract_version
    }

    pub fn shared(&self) -> &[String] {
        &self.shared
    }
}

/// Turns load requests into module handles.
///
/// Holds no per-module state, so independent loads may run on separate
/// threads through one shared orchestrator.
pub struct Orchestrator {
    surface: Arc<SharedSurface>,
    runtimes: RuntimeSet,
    policy: DisposePolicy,
    verdicts: VerdictCache,
    observer: Arc<dyn LifecycleObserver>,
}

impl Orchestrator {
    pub fn new(surface: Arc<SharedSurface>, runtimes: RuntimeSet) -> Self {
        Self {
            surface,
            runtimes,
            policy: DisposePolicy::default(),
            verdicts: VerdictCache::new(),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_policy(mut self, policy: DisposePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn surface(&self) -> &Arc<SharedSurface> {
        &self.surface
    }

    pub fn load(&self, request: &LoadRequest) -> Result<ModuleHandle, LoadError> {
        self.load_cancellable(request, &Cancellation::new())
    }

    /// Load a module, polling `cancel` between steps. A cancelled load tears
    /// down whatever it had built and fails with [`LoadError::Cancelled`].
    pub fn load_cancellable(
        &self,
        request: &LoadRequest,
        cancel: &Cancellation,
    ) -> Result<ModuleHandle, LoadError> {
        let mut subject = request.location.display().to_string();
        let result = self.try_load(request, cancel, &mut subject);
        if let Err(err) = &result {
            self.observer.observe(LifecycleEvent::LoadRejected {
                module: subject,
                reason: err.to_string(),
            });
        }
        result
    }

    fn try_load(
        &self,
        request: &LoadRequest,
        cancel: &Cancellation,
        subject: &mut String,
    ) -> Result<ModuleHandle, LoadError> {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        self.validate_request(request)?;

        let (root, manifest_path, manifest) = read_manifest(&request.location)?;
        let manifest = Arc::new(manifest);
        let label = manifest.key().to_string();
        *subject = label.clone();

        let verdict = self.verdicts.resolve(
            &manifest,
            &request.host_version,
            &request.contract_version,
        );
        if !verdict.is_accepted() {
            return Err(LoadError::CompatibilityRejected(verdict));
        }
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        let mut boundary = Boundary::open(
            label.clone(),
            root,
            &self.surface,
            request.shared.iter().cloned(),
            Arc::clone(&self.observer),
        )
        .with_manifest(manifest_path);
        match self.build(&manifest, &mut boundary, request, cancel) {
            Ok((instance, capabilities)) => {
                let handle = ModuleHandle::new(
                    Arc::clone(&manifest),
                    boundary,
                    instance,
                    capabilities,
                    self.policy,
                    Arc::clone(&self.observer),
                );
                if cancel.is_cancelled() {
                    if let Err(err) = handle.dispose() {
                        tracing::warn!(module = %label, "disposing cancelled load failed: {err}");
                    }
                    return Err(LoadError::Cancelled);
                }
                self.observer.observe(LifecycleEvent::ModuleLoaded {
                    boundary: handle.boundary_id(),
                    module: label,
                });
                Ok(handle)
            }
            Err(err) => {
                self.abandon(boundary);
                Err(err)
            }
        }
    }

    fn validate_request(&self, request: &LoadRequest) -> Result<(), LoadError> {
        if &request.contract_version != self.surface.contract_version() {
            return Err(LoadError::InvalidRequest(format!(
                "request contract version {} differs from the exposed surface {}",
                request.contract_version,
                self.surface.contract_version()
            )));
        }

        let mut seen = BTreeSet::new();
        for name in &request.shared {
            if name.trim().is_empty() {
                return Err(LoadError::InvalidRequest(
                    "shared allowlist contains an empty name".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(LoadError::InvalidRequest(format!(
                    "shared allowlist lists {name:?} twice"
                )));
            }
            if !self.surface.exports(name) {
                return Err(LoadError::InvalidRequest(format!(
                    "shared allowlist names {name:?}, which the host does not export"
                )));
            }
        }
        Ok(())
    }

    /// Populate the boundary and instantiate the entry point inside it.
    fn build(
        &self,
        manifest: &ModuleManifest,
        boundary: &mut Boundary,
        request: &LoadRequest,
        cancel: &Cancellation,
    ) -> Result<(Arc<dyn ModuleInstance>, CapabilitySet), LoadError> {
        let label = manifest.key().to_string();
        boundary.load_package(cancel)?;

        if let Some(dependency) = manifest.dependency() {
            if !boundary.ships(&format!("lib/{}", dependency.library)) {
                return Err(LoadError::DependencyMissing {
                    module: label,
                    library: dependency.library.clone(),
                });
            }
        }

        let entry_name = manifest.entry_point().replace('\\', "/");
        let not_found = |reason: String| LoadError::EntryPointNotFound {
            module: label.clone(),
            entry_point: manifest.entry_point().to_string(),
            reason,
        };
        let entry = boundary
            .scope()
            .resolve_private(&entry_name)
            .map_err(|_| not_found("the package does not contain it".to_string()))?;

        let kind = manifest.launch().kind;
        let runtime = self
            .runtimes
            .get(kind)
            .ok_or_else(|| not_found(format!("no {kind} runtime is available")))?;

        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        let context = ModuleContext::new(
            manifest.id(),
            manifest.version().to_string(),
            &request.context,
            boundary.scope(),
        );
        let instance = runtime
            .instantiate(manifest, &entry, boundary, context, cancel)
            .map_err(|err| match err {
                InstantiateError::EntryNotFound(reason) => not_found(reason),
                InstantiateError::Failed(cause) => LoadError::InstantiationFailed {
                    module: label.clone(),
                    cause,
                },
                InstantiateError::Cancelled => LoadError::Cancelled,
            })?;
        drop(entry);

        let capabilities = panic::catch_unwind(AssertUnwindSafe(|| instance.capabilities()))
            .map_err(|payload| LoadError::InstantiationFailed {
                module: label.clone(),
                cause: anyhow!(
                    "capabilities() panicked: {}",
                    panic_message(payload.as_ref())
                ),
            })?;
        Ok((instance, capabilities))
    }

    /// Tear down a boundary from a load that did not complete. Uses a fresh
    /// token so a cancelled load still gets its full reclamation budget.
    fn abandon(&self, mut boundary: Boundary) {
        if let Err(err) = boundary.teardown(&self.policy.reclaim, &Cancellation::new()) {
            tracing::warn!(
                boundary = %boundary.id(),
                module = boundary.module(),
                "failed load left an unreclaimed boundary: {err}"
            );
        }
    }
}

/// Locate and parse `module.toml`. Returns the canonical package root and
/// the manifest's path inside it.
fn read_manifest(location: &Path) -> Result<(PathBuf, PathBuf, ModuleManifest), LoadError> {
    let manifest_path = if location.is_dir() {
        location.join(MANIFEST_FILE)
    } else {
        location.to_path_buf()
    };

    let raw = fs::read_to_string(&manifest_path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => LoadError::ManifestMissing(manifest_path.clone()),
        _ => LoadError::PackageUnreadable {
            path: manifest_path.clone(),
            message: err.to_string(),
        },
    })?;
    let manifest =
        ModuleManifest::from_toml_str(&raw).map_err(|error| LoadError::ManifestMalformed {
            path: manifest_path.clone(),
            error,
        })?;

    let root = match manifest_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let root = fs::canonicalize(&root).map_err(|err| LoadError::PackageUnreadable {
        path: root.clone(),
        message: err.to_string(),
    })?;
    let manifest_path = match manifest_path.file_name() {
        Some(name) => root.join(name),
        None => root.join(MANIFEST_FILE),
    };
    Ok((root, manifest_path, manifest))
}
