//! Configuration types and loaders for burrow.
//!
//! This crate owns the on-disk schemas (`module.toml` and `burrow.toml`) so the
//! host and its tooling share a single source of truth.

pub mod host;
pub mod manifest;

pub use host::{HostConfig, ProcessConfig, TeardownConfig};
pub use manifest::{
    ContractRequirement, DependencyDecl, LaunchSpec, ManifestError, ModuleKey, ModuleManifest,
    RuntimeKind, MANIFEST_FILE,
};
