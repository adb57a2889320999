use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use burrow_config::{ModuleManifest, ProcessConfig, RuntimeKind};
use burrow_core::cancel::Cancellation;
use burrow_core::capability::{
    CapabilityRequest, CapabilityResponse, CapabilitySet, ModuleInstance,
};
use burrow_core::context::ModuleContext;
use burrow_core::scope::PrivateUnit;
use serde_json::Value;

use crate::boundary::{Boundary, Reclaimable};
use crate::error::InstantiateError;
use crate::protocol::{
    Incoming, InitializeParams, InitializeResult, JsonRpcError, LogParams, Message,
    RequestEnvelope, CAPABILITY_METHOD, INITIALIZE_METHOD, LOG_METHOD, RELEASE_METHOD,
};
use crate::runtime::ModuleRuntime;

const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Runtime for modules that run as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRuntime {
    config: ProcessConfig,
}

impl ProcessRuntime {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }
}

impl ModuleRuntime for ProcessRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Process
    }

    fn instantiate(
        &self,
        manifest: &ModuleManifest,
        entry: &Arc<PrivateUnit>,
        boundary: &mut Boundary,
        context: ModuleContext,
        cancel: &Cancellation,
    ) -> Result<Arc<dyn ModuleInstance>, InstantiateError> {
        let label = manifest.key().to_string();
        let launch = manifest.launch();

        let mut command = match &launch.command {
            Some(program) => {
                let mut command = Command::new(program);
                command.args(&launch.args).arg(entry.path());
                command
            }
            None => {
                let mut command = Command::new(entry.path());
                command.args(&launch.args);
                command
            }
        };
        command
            .current_dir(boundary.root())
            .env("BURROW_MODULE_ID", manifest.id())
            .env("BURROW_MODULE_VERSION", manifest.version().to_string())
            .env("BURROW_MODULE_ROOT", boundary.root())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                InstantiateError::EntryNotFound(format!(
                    "cannot launch {}: {err}",
                    launch.command.as_deref().unwrap_or(entry.name())
                ))
            } else {
                InstantiateError::Failed(anyhow!("failed to spawn module {label}: {err}"))
            }
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let child = Arc::new(Mutex::new(child));
        boundary.register_resource(Box::new(ChildReclaim::new(&child)));
        tracing::debug!(module = %label, "module process spawned");

        let stdin = stdin.ok_or_else(|| anyhow!("failed to capture module {label} stdin pipe"))?;
        let stdout =
            stdout.ok_or_else(|| anyhow!("failed to capture module {label} stdout pipe"))?;

        let session = Session {
            label: label.clone(),
            stdin: Some(stdin),
            rx: spawn_reader(stdout, label.clone()),
            next_id: 1,
        };

        let params = InitializeParams {
            module_id: manifest.id().to_string(),
            module_version: manifest.version().to_string(),
            contract_version: context
                .scope()
                .contract_version()
                .map(|version| version.to_string())
                .unwrap_or_default(),
            shared: context.scope().visible_names(),
            settings: context.settings().clone(),
        };
        let instance = ProcessInstance {
            label,
            session: Mutex::new(session),
            capabilities: CapabilitySet::new(),
            request_timeout: self.config.request_timeout(),
            child,
        };
        let result: InitializeResult = instance
            .call(
                INITIALIZE_METHOD,
                serde_json::to_value(params).context("failed to encode initialize params")?,
                self.config.handshake_timeout(),
                Some(cancel),
            )
            .map_err(|err| match err.downcast::<Interrupted>() {
                Ok(Interrupted) => InstantiateError::Cancelled,
                Err(err) => InstantiateError::Failed(err.context("module handshake failed")),
            })
            .and_then(|value| {
                serde_json::from_value(value)
                    .context("invalid initialize result")
                    .map_err(InstantiateError::Failed)
            })?;

        Ok(Arc::new(ProcessInstance {
            capabilities: result.capabilities.into_iter().collect(),
            ..instance
        }))
    }
}

#[derive(Debug)]
struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("cancelled while waiting for the module")
    }
}

impl std::error::Error for Interrupted {}

struct Session {
    label: String,
    stdin: Option<ChildStdin>,
    rx: Receiver<ReaderEvent>,
    next_id: u64,
}

impl Session {
    fn send(&mut self, method: &str, params: Value) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;

        let encoded = serde_json::to_string(&RequestEnvelope::new(id, method, params))
            .context("failed to encode JSON-RPC request")?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("module {} pipe is closed", self.label))?;
        stdin
            .write_all(encoded.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush())
            .with_context(|| format!("failed to write to module {}", self.label))?;
        Ok(id)
    }

    fn wait(&mut self, id: u64, timeout: Duration, cancel: Option<&Cancellation>) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_some_and(Cancellation::is_cancelled) {
                return Err(Interrupted.into());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!(
                    "timed out waiting for module {} after {}ms",
                    self.label,
                    timeout.as_millis()
                );
            }

            match self.rx.recv_timeout(remaining.min(CANCEL_POLL)) {
                Ok(ReaderEvent::Response { id: got, outcome }) if got == id => {
                    return outcome.map_err(|error| {
                        anyhow!("module {} answered with error: {error}", self.label)
                    });
                }
                Ok(ReaderEvent::Response { id: got, .. }) => {
                    tracing::warn!(module = %self.label, expected = id, got, "discarding stale module response");
                }
                Ok(ReaderEvent::ProtocolError(message)) => {
                    bail!("module {} protocol error: {message}", self.label)
                }
                Ok(ReaderEvent::IoError(message)) => {
                    bail!("module {} stdout read error: {message}", self.label)
                }
                Ok(ReaderEvent::Eof) | Err(RecvTimeoutError::Disconnected) => {
                    bail!("module {} closed its output", self.label)
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

/// A module instance living in a child process.
struct ProcessInstance {
    label: String,
    session: Mutex<Session>,
    capabilities: CapabilitySet,
    request_timeout: Duration,
    child: Arc<Mutex<Child>>,
}

impl ProcessInstance {
    fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: Option<&Cancellation>,
    ) -> Result<Value> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let id = session.send(method, params)?;
        session.wait(id, timeout, cancel).map_err(|err| {
            match self
                .child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_wait()
            {
                Ok(Some(status)) => err.context(format!("module process exited ({status})")),
                _ => err,
            }
        })
    }
}

impl ModuleInstance for ProcessInstance {
    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    fn handle(&self, request: CapabilityRequest) -> Result<CapabilityResponse> {
        let params = serde_json::to_value(&request).context("failed to encode request")?;
        let value = self.call(CAPABILITY_METHOD, params, self.request_timeout, None)?;
        serde_json::from_value(value)
            .with_context(|| format!("module {} sent an invalid capability response", self.label))
    }

    fn release(&self) -> Result<()> {
        let result = self.call(RELEASE_METHOD, Value::Null, self.request_timeout, None);
        // Closing stdin tells the module to exit.
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stdin
            .take();
        result.map(|_| ())
    }
}

/// Waits for the module process to exit, killing it if it lingers past the
/// first pass.
struct ChildReclaim {
    label: String,
    child: Arc<Mutex<Child>>,
    passes: u32,
}

impl ChildReclaim {
    fn new(child: &Arc<Mutex<Child>>) -> Self {
        let pid = child.lock().unwrap_or_else(PoisonError::into_inner).id();
        Self {
            label: format!("process {pid}"),
            child: Arc::clone(child),
            passes: 0,
        }
    }
}

impl Reclaimable for ChildReclaim {
    fn label(&self) -> &str {
        &self.label
    }

    fn try_reclaim(&mut self) -> Result<bool> {
        self.passes += 1;
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if child.try_wait()?.is_some() {
            return Ok(true);
        }
        if self.passes > 1 {
            tracing::debug!(resource = %self.label, "killing lingering module process");
            // Fails only when the process already exited.
            let _ = child.kill();
            return Ok(child.try_wait()?.is_some());
        }
        Ok(false)
    }
}

enum ReaderEvent {
    Response {
        id: u64,
        outcome: std::result::Result<Value, JsonRpcError>,
    },
    ProtocolError(String),
    IoError(String),
    Eof,
}

/// Read module output on a dedicated thread. Log notifications go straight to
/// `tracing`; everything else is handed to the session.
fn spawn_reader(stdout: ChildStdout, label: String) -> Receiver<ReaderEvent> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    let _ = tx.send(ReaderEvent::IoError(err.to_string()));
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let message = serde_json::from_str::<Incoming>(&line)
                .map_err(|err| format!("invalid JSON-RPC message ({err}): {line}"))
                .and_then(Incoming::classify);
            let event = match message {
                Ok(Message::Response { id, outcome }) => ReaderEvent::Response { id, outcome },
                Ok(Message::Notification { method, params }) if method == LOG_METHOD => {
                    forward_log(&label, params);
                    continue;
                }
                Ok(Message::Notification { method, .. }) => {
                    tracing::debug!(module = %label, method = %method, "ignoring module notification");
                    continue;
                }
                Err(message) => {
                    let _ = tx.send(ReaderEvent::ProtocolError(message));
                    return;
                }
            };
            if tx.send(event).is_err() {
                return;
            }
        }
        let _ = tx.send(ReaderEvent::Eof);
    });
    rx
}

fn forward_log(label: &str, params: Value) {
    let Ok(LogParams { level, message }) = serde_json::from_value::<LogParams>(params) else {
        tracing::debug!(module = %label, "malformed log notification");
        return;
    };
    match level.as_str() {
        "error" => tracing::error!(target: "burrow::module", module = label, "{message}"),
        "warn" => tracing::warn!(target: "burrow::module", module = label, "{message}"),
        "debug" => tracing::debug!(target: "burrow::module", module = label, "{message}"),
        "trace" => tracing::trace!(target: "burrow::module", module = label, "{message}"),
        _ => tracing::info!(target: "burrow::module", module = label, "{message}"),
    }
}
