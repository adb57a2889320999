use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use semver::Version;

use burrow_config::{HostConfig, ModuleKey};
use burrow_core::{
    bus::EventBus,
    context::HostContext,
    event::{LifecycleEvent, LifecycleObserver, TracingObserver},
    logging::{self, LogBuffer, LogLevel},
    surface::SharedSurface,
};
use burrow_host::{
    discover_modules, DisposePolicy, LoadRequest, ModuleHandle, ModuleSet, NativeRuntime,
    Orchestrator, ProcessRuntime, RuntimeSet,
};

/// Burrow: load isolated modules and talk to them.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "burrow")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Host configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Extra directory to discover modules in (repeatable)
    #[arg(long = "modules", value_name = "DIR", global = true)]
    module_roots: Vec<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

/// MODULE is an id (newest loaded version) or id@version.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Load every discovered module and list it
    List,
    /// Search across all modules
    Search {
        query: Vec<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show a module's settings
    Settings { module: String },
    /// Run a module command
    Run {
        module: String,
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

impl Cli {
    fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::List)
    }
}

/// Forwards lifecycle events to `tracing` and keeps them for the exit summary.
#[derive(Default)]
struct Recorder {
    bus: Mutex<EventBus>,
}

impl LifecycleObserver for Recorder {
    fn observe(&self, event: LifecycleEvent) {
        TracingObserver.observe(event.clone());
        self.bus.observe(event);
    }
}

impl Recorder {
    fn drain(&self) -> Vec<LifecycleEvent> {
        self.bus.lock().map(|mut bus| bus.drain()).unwrap_or_default()
    }
}

fn host_locale() -> String {
    env::var("LANG")
        .ok()
        .and_then(|lang| lang.split('.').next().map(str::to_string))
        .filter(|lang| !lang.is_empty() && lang != "C" && lang != "POSIX")
        .unwrap_or_else(|| "en".to_string())
}

struct Host {
    config: HostConfig,
    host_version: Version,
    contract_version: Version,
    orchestrator: Orchestrator,
    recorder: Arc<Recorder>,
    modules: ModuleSet,
}

impl Host {
    fn new(config: HostConfig) -> Result<Self> {
        let host_version = config.host_version()?;
        let contract_version = config.contract_version()?;

        let surface = SharedSurface::builder(contract_version.clone())
            .component(
                burrow_mod_greeter::LOCALE_COMPONENT,
                Version::new(1, 0, 0),
                host_locale(),
            )
            .component("burrow.host_version", host_version.clone(), host_version.clone())
            .build();

        let runtimes = RuntimeSet::new()
            .with(Arc::new(NativeRuntime::new().register(
                burrow_mod_greeter::ENTRY_SYMBOL,
                burrow_mod_greeter::instantiate,
            )))
            .with(Arc::new(ProcessRuntime::new(config.process.clone())));

        let recorder = Arc::new(Recorder::default());
        let orchestrator = Orchestrator::new(surface, runtimes)
            .with_policy(DisposePolicy::from_config(&config.teardown))
            .with_observer(recorder.clone());

        Ok(Self {
            config,
            host_version,
            contract_version,
            orchestrator,
            recorder,
            modules: ModuleSet::new(),
        })
    }

    /// Discover and load every module under the configured roots. Modules
    /// that fail to load are reported and skipped.
    fn load_all(&mut self) -> Result<()> {
        let discovery = discover_modules(&self.config.module_roots)?;
        for (path, reason) in &discovery.skipped {
            println!("skipped {}: {reason}", path.display());
        }

        for module in &discovery.modules {
            let id = module.manifest.id();
            let request = LoadRequest::new(
                module.root(),
                self.host_version.clone(),
                self.contract_version.clone(),
            )
            .share_all(self.config.shared.iter().cloned())
            .with_context(HostContext::from_settings(self.config.module_settings(id)));

            match self.orchestrator.load(&request) {
                Ok(handle) => {
                    self.modules.insert(handle)?;
                }
                Err(err) => println!("rejected {}: {err}", module.manifest.key()),
            }
        }
        Ok(())
    }

    fn find(&self, module: &str) -> Result<&ModuleHandle> {
        let found = match module.split_once('@') {
            Some((id, version)) => {
                let version = Version::parse(version)
                    .with_context(|| format!("{module:?} has an invalid version"))?;
                self.modules.get(&ModuleKey::new(id, version))
            }
            None => self.modules.latest(module),
        };
        found.with_context(|| format!("module {module} is not loaded"))
    }

    fn execute(&self, command: &Command) -> Result<()> {
        match command {
            Command::List => {
                for handle in self.modules.iter() {
                    let capabilities = handle
                        .capabilities()?
                        .iter()
                        .map(|kind| kind.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    println!(
                        "{:<32} {:<24} [{capabilities}]",
                        handle.key().to_string(),
                        handle.manifest().name()
                    );
                }
            }
            Command::Search { query, limit } => {
                let query = query.join(" ");
                let mut hits = Vec::new();
                for handle in self.modules.iter() {
                    match handle.search(&query, *limit) {
                        Ok(Some(found)) => {
                            hits.extend(found.into_iter().map(|hit| (handle.key(), hit)))
                        }
                        Ok(None) => {}
                        Err(err) => println!("search failed in {}: {err}", handle.key()),
                    }
                }
                hits.sort_by(|a, b| b.1.score.total_cmp(&a.1.score));
                hits.truncate(*limit);
                for (key, hit) in hits {
                    println!("{:.2}  {}  ({key})", hit.score, hit.title);
                }
            }
            Command::Settings { module } => {
                let handle = self.find(module)?;
                match handle.settings()? {
                    Some(entries) => {
                        for entry in entries {
                            match entry.description {
                                Some(description) => {
                                    println!("{} = {}  # {description}", entry.key, entry.value)
                                }
                                None => println!("{} = {}", entry.key, entry.value),
                            }
                        }
                    }
                    None => println!("{} has no settings", handle.key()),
                }
            }
            Command::Run {
                module,
                command,
                args,
            } => {
                let handle = self.find(module)?;
                match handle.command(command, args.clone())? {
                    Some(lines) => lines.iter().for_each(|line| println!("{line}")),
                    None => println!("{} does not run commands", handle.key()),
                }
            }
        }
        Ok(())
    }

    /// Dispose every module and report what the lifecycle looked like.
    fn shutdown(&mut self) {
        for (key, result) in self.modules.dispose_all() {
            if let Err(err) = result {
                println!("dispose {key}: {err}");
            }
        }

        let events = self.recorder.drain();
        let count = |name: &str| events.iter().filter(|event| event.name() == name).count();
        tracing::info!(
            loaded = count("module_loaded"),
            rejected = count("load_rejected"),
            disposed = count("handle_disposed"),
            timed_out = count("teardown_timed_out"),
            "burrow shutting down"
        );
    }
}

fn print_warnings(buffer: &LogBuffer) {
    let warnings = buffer.drain_at_least(LogLevel::Warn);
    if warnings.is_empty() {
        return;
    }
    eprintln!("\n{} warning(s) logged:", warnings.len());
    for entry in warnings {
        eprintln!("  {entry}");
    }
}

fn main() -> Result<()> {
    let log_buffer = logging::init();

    let cli = Cli::parse();

    let mut config = HostConfig::load(cli.config.as_deref())?;
    config.module_roots.extend(cli.module_roots.iter().cloned());
    tracing::info!(
        host_version = %config.host_version,
        contract_version = %config.contract_version,
        roots = config.module_roots.len(),
        "burrow starting up"
    );

    let mut host = Host::new(config)?;
    let result = host
        .load_all()
        .and_then(|()| host.execute(&cli.command()));
    host.shutdown();
    print_warnings(&log_buffer);
    result
}
