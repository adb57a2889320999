//! Shared contract surface for burrow hosts and modules.
//!
//! Every module links against this crate and nothing else from the host: the
//! capability types, the module instance trait, the context handed to a module
//! at instantiation, the shared-surface and scope types a boundary resolves
//! through, lifecycle events, cancellation, and the logging subsystem.

pub mod bus;
pub mod cancel;
pub mod capability;
pub mod context;
pub mod event;
pub mod logging;
pub mod scope;
pub mod surface;
