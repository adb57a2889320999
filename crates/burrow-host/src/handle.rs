use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use burrow_config::{ModuleKey, ModuleManifest, TeardownConfig};
use burrow_core::cancel::Cancellation;
use burrow_core::capability::{
    CapabilityKind, CapabilityRequest, CapabilityResponse, CapabilitySet, ModuleInstance,
    SearchHit, SettingEntry,
};
use burrow_core::event::{LifecycleEvent, LifecycleObserver, ReleaseOutcome};
use burrow_core::scope::BoundaryId;

use crate::boundary::{Boundary, ReclaimPolicy};
use crate::error::{HandleError, TeardownError};
use crate::runtime::panic_message;

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Bounds applied when disposing a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisposePolicy {
    /// How long the module's own release hook may run.
    pub release_timeout: Duration,
    /// How long to wait for in-flight calls before giving up.
    pub drain_timeout: Duration,
    pub reclaim: ReclaimPolicy,
}

impl Default for DisposePolicy {
    fn default() -> Self {
        Self::from_config(&TeardownConfig::default())
    }
}

impl DisposePolicy {
    pub fn from_config(config: &TeardownConfig) -> Self {
        Self {
            release_timeout: config.release_timeout(),
            drain_timeout: config.drain_timeout(),
            reclaim: ReclaimPolicy::from_config(config),
        }
    }
}

/// What a disposal did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisposeReport {
    pub release: ReleaseOutcome,
    /// Reclamation passes of this call; zero if already disposed.
    pub passes: u32,
    pub already_disposed: bool,
}

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    closed: bool,
}

/// Counts calls into the module so disposal can wait for them.
#[derive(Debug, Default)]
struct CallGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

struct CallGuard<'a> {
    gate: &'a CallGate,
}

impl CallGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self) -> Option<CallGuard<'_>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.in_flight += 1;
        Some(CallGuard { gate: self })
    }

    fn close(&self) {
        self.lock().closed = true;
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wait for in-flight calls to finish. `Err` carries how many remain.
    fn drain(&self, timeout: Duration, cancel: &Cancellation) -> Result<(), usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || cancel.is_cancelled() {
                return Err(state.in_flight);
            }
            state = self
                .idle
                .wait_timeout(state, remaining.min(DRAIN_POLL))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(())
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.idle.notify_all();
        }
    }
}

enum Slot {
    Live(Boundary),
    /// Released and closed, but reclamation has not finished.
    Inert(Boundary),
    Disposed,
}

/// A loaded module. The only owner of its boundary and its instance.
///
/// Capability calls may run concurrently. [`dispose`](ModuleHandle::dispose)
/// stops new calls, waits for in-flight ones, runs the module's release hook
/// (bounded), and only then tears the boundary down. Every call after
/// disposal fails with [`HandleError::HandleDisposed`].
pub struct ModuleHandle {
    manifest: Arc<ModuleManifest>,
    label: String,
    boundary_id: BoundaryId,
    capabilities: CapabilitySet,
    gate: CallGate,
    instance: Mutex<Option<Arc<dyn ModuleInstance>>>,
    slot: Mutex<Slot>,
    release: Mutex<Option<ReleaseOutcome>>,
    policy: DisposePolicy,
    observer: Arc<dyn LifecycleObserver>,
}

impl ModuleHandle {
    pub(crate) fn new(
        manifest: Arc<ModuleManifest>,
        boundary: Boundary,
        instance: Arc<dyn ModuleInstance>,
        capabilities: CapabilitySet,
        policy: DisposePolicy,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Self {
        Self {
            label: manifest.key().to_string(),
            manifest,
            boundary_id: boundary.id(),
            capabilities,
            gate: CallGate::default(),
            instance: Mutex::new(Some(instance)),
            slot: Mutex::new(Slot::Live(boundary)),
            release: Mutex::new(None),
            policy,
            observer,
        }
    }

    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    pub fn key(&self) -> ModuleKey {
        self.manifest.key()
    }

    pub fn boundary_id(&self) -> BoundaryId {
        self.boundary_id
    }

    pub fn is_disposed(&self) -> bool {
        self.gate.is_closed()
    }

    /// Capabilities the module reported when it was loaded.
    pub fn capabilities(&self) -> Result<CapabilitySet, HandleError> {
        if self.gate.is_closed() {
            return Err(self.disposed());
        }
        Ok(self.capabilities.clone())
    }

    pub fn provides(&self, kind: CapabilityKind) -> Result<bool, HandleError> {
        self.capabilities().map(|set| set.contains(&kind))
    }

    /// Route one request to the module. `Ok(None)` when the module does not
    /// provide that capability.
    pub fn request(
        &self,
        request: CapabilityRequest,
    ) -> Result<Option<CapabilityResponse>, HandleError> {
        let _guard = self.gate.enter().ok_or_else(|| self.disposed())?;
        let kind = request.kind();
        if !self.capabilities.contains(&kind) {
            return Ok(None);
        }
        let instance = self
            .instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| self.disposed())?;

        let failed = |message: String| HandleError::CapabilityFailed {
            module: self.label.clone(),
            capability: kind,
            message,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| instance.handle(request))) {
            Ok(Ok(response)) if response.kind() == kind => Ok(Some(response)),
            Ok(Ok(response)) => Err(failed(format!(
                "answered a {kind} request with a {} response",
                response.kind()
            ))),
            Ok(Err(err)) => Err(failed(format!("{err:#}"))),
            Err(payload) => Err(failed(format!(
                "panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }

    pub fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Option<Vec<SearchHit>>, HandleError> {
        match self.request(CapabilityRequest::search(query, limit))? {
            Some(CapabilityResponse::Search { hits }) => Ok(Some(hits)),
            _ => Ok(None),
        }
    }

    pub fn settings(&self) -> Result<Option<Vec<SettingEntry>>, HandleError> {
        match self.request(CapabilityRequest::Settings)? {
            Some(CapabilityResponse::Settings { entries }) => Ok(Some(entries)),
            _ => Ok(None),
        }
    }

    pub fn command(
        &self,
        name: &str,
        args: Vec<String>,
    ) -> Result<Option<Vec<String>>, HandleError> {
        match self.request(CapabilityRequest::command(name, args))? {
            Some(CapabilityResponse::Command { lines }) => Ok(Some(lines)),
            _ => Ok(None),
        }
    }

    /// Dispose with no external cancellation.
    pub fn dispose(&self) -> Result<DisposeReport, HandleError> {
        self.dispose_with(&Cancellation::new())
    }

    /// Release the module and reclaim its boundary.
    ///
    /// Idempotent: once disposal has completed, further calls return a report
    /// with `already_disposed` set. If reclamation timed out, a later call
    /// resumes it without running the release hook again.
    pub fn dispose_with(&self, cancel: &Cancellation) -> Result<DisposeReport, HandleError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *slot, Slot::Disposed) {
            Slot::Disposed => Ok(DisposeReport {
                release: self.recorded_release(),
                passes: 0,
                already_disposed: true,
            }),
            Slot::Live(boundary) => {
                self.gate.close();
                if let Err(in_flight) = self.gate.drain(self.policy.drain_timeout, cancel) {
                    *slot = Slot::Live(boundary);
                    return Err(if cancel.is_cancelled() {
                        HandleError::Cancelled(self.label.clone())
                    } else {
                        HandleError::DrainTimeout {
                            module: self.label.clone(),
                            in_flight,
                        }
                    });
                }

                let outcome = self.release_instance();
                *self.release.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(outcome.clone());
                self.reclaim(&mut slot, boundary, outcome, cancel)
            }
            Slot::Inert(boundary) => {
                let outcome = self.recorded_release();
                self.reclaim(&mut slot, boundary, outcome, cancel)
            }
        }
    }

    /// Run the module's release hook on a worker thread, bounded by the
    /// release timeout, and drop the handle's reference to the instance.
    fn release_instance(&self) -> ReleaseOutcome {
        let Some(instance) = self
            .instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return ReleaseOutcome::Completed;
        };

        self.observer.observe(LifecycleEvent::ReleaseStarted {
            module: self.label.clone(),
        });

        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(&instance);
        let spawned = thread::Builder::new()
            .name(format!("burrow-release-{}", self.boundary_id.get()))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| worker.release()));
                // The instance must be gone before the handle starts reclaiming.
                drop(worker);
                let _ = tx.send(result);
            });
        drop(instance);

        let outcome = match spawned {
            Ok(_) => match rx.recv_timeout(self.policy.release_timeout) {
                Ok(Ok(Ok(()))) => ReleaseOutcome::Completed,
                Ok(Ok(Err(err))) => ReleaseOutcome::Failed(format!("{err:#}")),
                Ok(Err(payload)) => ReleaseOutcome::Failed(format!(
                    "release panicked: {}",
                    panic_message(payload.as_ref())
                )),
                Err(RecvTimeoutError::Timeout) => ReleaseOutcome::TimedOut,
                Err(RecvTimeoutError::Disconnected) => {
                    ReleaseOutcome::Failed("release worker exited without reporting".to_string())
                }
            },
            Err(err) => ReleaseOutcome::Failed(format!("could not start release worker: {err}")),
        };

        self.observer.observe(LifecycleEvent::ReleaseFinished {
            module: self.label.clone(),
            outcome: outcome.clone(),
        });
        outcome
    }

    fn reclaim(
        &self,
        slot: &mut Slot,
        mut boundary: Boundary,
        release: ReleaseOutcome,
        cancel: &Cancellation,
    ) -> Result<DisposeReport, HandleError> {
        match boundary.teardown(&self.policy.reclaim, cancel) {
            Ok(report) => {
                *slot = Slot::Disposed;
                drop(boundary);
                self.observer.observe(LifecycleEvent::HandleDisposed {
                    module: self.label.clone(),
                });
                Ok(DisposeReport {
                    release,
                    passes: report.passes,
                    already_disposed: false,
                })
            }
            Err(err) => {
                *slot = Slot::Inert(boundary);
                Err(match err {
                    TeardownError::Timeout {
                        attempts,
                        outstanding,
                        ..
                    } => HandleError::TeardownTimeout {
                        module: self.label.clone(),
                        attempts,
                        outstanding,
                    },
                    TeardownError::Cancelled { .. } => HandleError::Cancelled(self.label.clone()),
                })
            }
        }
    }

    fn recorded_release(&self) -> ReleaseOutcome {
        self.release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or(ReleaseOutcome::Completed)
    }

    fn disposed(&self) -> HandleError {
        HandleError::HandleDisposed(self.label.clone())
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        let pending = !matches!(
            *self.slot.get_mut().unwrap_or_else(PoisonError::into_inner),
            Slot::Disposed
        );
        if pending {
            if let Err(err) = self.dispose() {
                tracing::warn!(module = %self.label, "dispose on drop failed: {err}");
            }
        }
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("module", &self.label)
            .field("boundary", &self.boundary_id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
