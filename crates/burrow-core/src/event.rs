use std::sync::Arc;

use crate::scope::BoundaryId;

/// How a module's own release hook ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

impl ReleaseOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, ReleaseOutcome::Completed)
    }
}

/// Observable steps of a module's load and disposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    LoadRejected {
        module: String,
        reason: String,
    },
    BoundaryCreated {
        boundary: BoundaryId,
        module: String,
    },
    ModuleLoaded {
        boundary: BoundaryId,
        module: String,
    },
    ReleaseStarted {
        module: String,
    },
    ReleaseFinished {
        module: String,
        outcome: ReleaseOutcome,
    },
    TeardownRequested {
        boundary: BoundaryId,
    },
    BoundaryReclaimed {
        boundary: BoundaryId,
        passes: u32,
    },
    TeardownTimedOut {
        boundary: BoundaryId,
        attempts: u32,
        outstanding: Vec<String>,
    },
    HandleDisposed {
        module: String,
    },
}

impl LifecycleEvent {
    /// Boundary the event concerns, when it concerns one.
    pub fn boundary(&self) -> Option<BoundaryId> {
        match self {
            Self::BoundaryCreated { boundary, .. }
            | Self::ModuleLoaded { boundary, .. }
            | Self::TeardownRequested { boundary }
            | Self::BoundaryReclaimed { boundary, .. }
            | Self::TeardownTimedOut { boundary, .. } => Some(*boundary),
            Self::LoadRejected { .. }
            | Self::ReleaseStarted { .. }
            | Self::ReleaseFinished { .. }
            | Self::HandleDisposed { .. } => None,
        }
    }

    /// Short snake_case name, stable for logs and assertions.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadRejected { .. } => "load_rejected",
            Self::BoundaryCreated { .. } => "boundary_created",
            Self::ModuleLoaded { .. } => "module_loaded",
            Self::ReleaseStarted { .. } => "release_started",
            Self::ReleaseFinished { .. } => "release_finished",
            Self::TeardownRequested { .. } => "teardown_requested",
            Self::BoundaryReclaimed { .. } => "boundary_reclaimed",
            Self::TeardownTimedOut { .. } => "teardown_timed_out",
            Self::HandleDisposed { .. } => "handle_disposed",
        }
    }
}

/// Receiver of lifecycle events. Called synchronously on the thread that
/// performs the step, so implementations must be quick.
pub trait LifecycleObserver: Send + Sync {
    fn observe(&self, event: LifecycleEvent);
}

/// Writes every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn observe(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::LoadRejected { module, reason } => {
                tracing::warn!(module = %module, reason = %reason, "module load rejected");
            }
            LifecycleEvent::ReleaseFinished { module, outcome } if !outcome.is_clean() => {
                tracing::warn!(module = %module, outcome = ?outcome, "module release did not complete cleanly");
            }
            LifecycleEvent::TeardownTimedOut {
                boundary,
                attempts,
                outstanding,
            } => {
                tracing::warn!(
                    boundary = %boundary,
                    attempts = *attempts,
                    outstanding = ?outstanding,
                    "boundary reclamation timed out"
                );
            }
            LifecycleEvent::ModuleLoaded { boundary, module } => {
                tracing::info!(boundary = %boundary, module = %module, "module loaded");
            }
            other => tracing::debug!(event = other.name(), detail = ?other, "lifecycle"),
        }
    }
}

/// Fans each event out to several observers, in order.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn LifecycleObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl LifecycleObserver for ObserverSet {
    fn observe(&self, event: LifecycleEvent) {
        for observer in &self.observers {
            observer.observe(event.clone());
        }
    }
}
