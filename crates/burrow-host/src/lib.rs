//! Module host for burrow.
//!
//! Loads versioned module packages into isolated boundaries, routes
//! capability requests to them through handles, and tears each boundary down
//! again when its handle is disposed. Native modules are linked into the host
//! binary; process modules speak JSON-RPC over stdio.

pub mod boundary;
pub mod compat;
pub mod discovery;
pub mod error;
pub mod handle;
pub mod orchestrator;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod runtime;

#[cfg(test)]
mod testing;

pub use boundary::{Boundary, ReclaimPolicy, Reclaimable};
pub use compat::{CompatibilityVerdict, RejectReason, VerdictCache};
pub use discovery::{discover_modules, DiscoveredModule, Discovery};
pub use error::{HandleError, LoadError, TeardownError};
pub use handle::{DisposePolicy, DisposeReport, ModuleHandle};
pub use orchestrator::{LoadRequest, Orchestrator};
pub use process::ProcessRuntime;
pub use registry::ModuleSet;
pub use runtime::{ModuleRuntime, NativeRuntime, RuntimeSet};
