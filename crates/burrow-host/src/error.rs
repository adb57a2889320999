use std::fmt;
use std::path::PathBuf;

use burrow_config::ManifestError;
use burrow_core::capability::CapabilityKind;
use burrow_core::scope::BoundaryId;

use crate::compat::CompatibilityVerdict;

/// Why a load request did not produce a handle.
#[derive(Debug)]
pub enum LoadError {
    /// The request itself is inconsistent with the host (allowlist, contract).
    InvalidRequest(String),
    ManifestMissing(PathBuf),
    ManifestMalformed {
        path: PathBuf,
        error: ManifestError,
    },
    CompatibilityRejected(CompatibilityVerdict),
    PackageUnreadable {
        path: PathBuf,
        message: String,
    },
    DependencyMissing {
        module: String,
        library: String,
    },
    EntryPointNotFound {
        module: String,
        entry_point: String,
        reason: String,
    },
    InstantiationFailed {
        module: String,
        cause: anyhow::Error,
    },
    Cancelled,
}

impl LoadError {
    /// Stable snake_case label, used in logs and rejection events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::ManifestMissing(_) => "manifest_missing",
            Self::ManifestMalformed { .. } => "manifest_malformed",
            Self::CompatibilityRejected(_) => "compatibility_rejected",
            Self::PackageUnreadable { .. } => "package_unreadable",
            Self::DependencyMissing { .. } => "dependency_missing",
            Self::EntryPointNotFound { .. } => "entry_point_not_found",
            Self::InstantiationFailed { .. } => "instantiation_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "invalid load request: {msg}"),
            Self::ManifestMissing(path) => {
                write!(f, "module manifest not found at {}", path.display())
            }
            Self::ManifestMalformed { path, error } => {
                write!(f, "malformed module manifest {}: {error}", path.display())
            }
            Self::CompatibilityRejected(verdict) => {
                write!(f, "module rejected: {}", verdict.reason())
            }
            Self::PackageUnreadable { path, message } => {
                write!(f, "failed to read module package {}: {message}", path.display())
            }
            Self::DependencyMissing { module, library } => write!(
                f,
                "module {module} declares dependency {library:?} but the package does not ship it"
            ),
            Self::EntryPointNotFound {
                module,
                entry_point,
                reason,
            } => write!(
                f,
                "entry point {entry_point:?} of module {module} not found: {reason}"
            ),
            Self::InstantiationFailed { module, cause } => {
                write!(f, "module {module} failed to instantiate: {cause:#}")
            }
            Self::Cancelled => write!(f, "load cancelled"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ManifestMalformed { error, .. } => Some(error),
            Self::InstantiationFailed { cause, .. } => Some(&**cause),
            _ => None,
        }
    }
}

/// Failures of operations on a live (or formerly live) module handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// The handle was disposed; nothing may run through it any more.
    HandleDisposed(String),
    CapabilityFailed {
        module: String,
        capability: CapabilityKind,
        message: String,
    },
    /// In-flight calls did not finish within the drain bound.
    DrainTimeout { module: String, in_flight: usize },
    TeardownTimeout {
        module: String,
        attempts: u32,
        outstanding: Vec<String>,
    },
    Cancelled(String),
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandleDisposed(module) => write!(f, "module {module} has been disposed"),
            Self::CapabilityFailed {
                module,
                capability,
                message,
            } => write!(f, "module {module} failed {capability} request: {message}"),
            Self::DrainTimeout { module, in_flight } => write!(
                f,
                "module {module} still has {in_flight} call(s) in flight"
            ),
            Self::TeardownTimeout {
                module,
                attempts,
                outstanding,
            } => write!(
                f,
                "boundary of module {module} not reclaimed after {attempts} attempt(s); outstanding: {}",
                outstanding.join(", ")
            ),
            Self::Cancelled(module) => write!(f, "disposal of module {module} cancelled"),
        }
    }
}

impl std::error::Error for HandleError {}

/// Reclamation of a boundary did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownError {
    Timeout {
        boundary: BoundaryId,
        attempts: u32,
        outstanding: Vec<String>,
    },
    Cancelled {
        boundary: BoundaryId,
        outstanding: Vec<String>,
    },
}

impl TeardownError {
    pub fn outstanding(&self) -> &[String] {
        match self {
            Self::Timeout { outstanding, .. } | Self::Cancelled { outstanding, .. } => outstanding,
        }
    }
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout {
                boundary,
                attempts,
                outstanding,
            } => write!(
                f,
                "{boundary} not reclaimed after {attempts} attempt(s); outstanding: {}",
                outstanding.join(", ")
            ),
            Self::Cancelled {
                boundary,
                outstanding,
            } => write!(
                f,
                "teardown of {boundary} cancelled; outstanding: {}",
                outstanding.join(", ")
            ),
        }
    }
}

impl std::error::Error for TeardownError {}

/// Failures a runtime reports while turning an entry unit into an instance.
#[derive(Debug)]
pub enum InstantiateError {
    /// The entry unit does not name anything the runtime can start.
    EntryNotFound(String),
    Failed(anyhow::Error),
    Cancelled,
}

impl fmt::Display for InstantiateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntryNotFound(msg) => write!(f, "{msg}"),
            Self::Failed(err) => write!(f, "{err:#}"),
            Self::Cancelled => write!(f, "instantiation cancelled"),
        }
    }
}

impl std::error::Error for InstantiateError {}

impl From<anyhow::Error> for InstantiateError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}
