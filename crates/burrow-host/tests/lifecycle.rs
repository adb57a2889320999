use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use burrow_core::bus::EventBus;
use burrow_core::cancel::Cancellation;
use burrow_core::capability::{CapabilityKind, ModuleInstance};
use burrow_core::context::ModuleContext;
use burrow_core::event::{LifecycleEvent, LifecycleObserver, ReleaseOutcome};
use burrow_core::surface::SharedSurface;
use burrow_host::{
    HandleError, LoadError, LoadRequest, ModuleSet, NativeRuntime, Orchestrator, RuntimeSet,
};
use semver::Version;

fn surface() -> Arc<SharedSurface> {
    SharedSurface::builder(Version::new(1, 2, 0))
        .component(
            burrow_mod_greeter::LOCALE_COMPONENT,
            Version::new(1, 0, 0),
            "en-GB".to_string(),
        )
        .build()
}

fn runtimes() -> RuntimeSet {
    RuntimeSet::new().with(Arc::new(NativeRuntime::new().register(
        burrow_mod_greeter::ENTRY_SYMBOL,
        burrow_mod_greeter::instantiate,
    )))
}

fn orchestrator(observer: Arc<dyn LifecycleObserver>) -> Orchestrator {
    Orchestrator::new(surface(), runtimes()).with_observer(observer)
}

fn request(location: &Path, host: Version) -> LoadRequest {
    LoadRequest::new(location, host, Version::new(1, 2, 0))
}

fn names(bus: &Mutex<EventBus>) -> Vec<&'static str> {
    bus.lock()
        .unwrap()
        .drain()
        .iter()
        .map(LifecycleEvent::name)
        .collect()
}

struct Package {
    manifest: String,
    files: Vec<(&'static str, String)>,
}

impl Package {
    fn greeter(id: &str, version: &str, greeting: &str) -> Self {
        Self {
            manifest: format!(
                r#"
id = "{id}"
name = "Greeter"
version = "{version}"
api_version = "^1.0"
min_host_version = "2.0.0"
entry_point = "entry.txt"
"#
            ),
            files: vec![
                ("entry.txt", format!("{}\n", burrow_mod_greeter::ENTRY_SYMBOL)),
                (burrow_mod_greeter::GREETINGS_UNIT, format!("{greeting}\n")),
            ],
        }
    }

    fn manifest_line(mut self, line: &str) -> Self {
        self.manifest.push_str(line);
        self.manifest.push('\n');
        self
    }

    fn replace(mut self, from: &str, to: &str) -> Self {
        self.manifest = self.manifest.replace(from, to);
        self
    }

    fn file(mut self, name: &'static str, contents: &str) -> Self {
        self.files.push((name, contents.to_string()));
        self
    }

    fn without(mut self, name: &str) -> Self {
        self.files.retain(|(file, _)| *file != name);
        self
    }

    fn write(self, dir: &Path, folder: &str) -> PathBuf {
        let root = dir.join(folder);
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("module.toml"), self.manifest).unwrap();
        for (name, contents) in self.files {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        root
    }
}

#[test]
fn compatible_module_loads_and_incompatible_one_never_gets_a_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let a = Package::greeter("acme.a", "1.0.0", "Hello").write(dir.path(), "a");
    let b = Package::greeter("acme.b", "1.0.0", "Hello")
        .replace("min_host_version = \"2.0.0\"", "min_host_version = \"3.0.0\"")
        .write(dir.path(), "b");

    let bus = Arc::new(Mutex::new(EventBus::new()));
    let orchestrator = orchestrator(bus.clone());
    let host = Version::new(2, 5, 0);

    let handle_a = orchestrator.load(&request(&a, host.clone())).unwrap();
    assert_eq!(
        names(&bus),
        vec!["boundary_created", "module_loaded"]
    );

    let err = orchestrator.load(&request(&b, host)).unwrap_err();
    let LoadError::CompatibilityRejected(verdict) = &err else {
        panic!("expected a compatibility rejection, got {err:?}");
    };
    assert_eq!(verdict.rejection().unwrap().code(), "host_too_old");
    assert_eq!(names(&bus), vec!["load_rejected"]);

    assert_eq!(
        handle_a.command("greet", vec!["Ada".into()]).unwrap(),
        Some(vec!["Hello, Ada!".to_string()])
    );
}

#[test]
fn two_versions_of_one_module_stay_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let old = Package::greeter("acme.greeter", "1.0.0", "Hello")
        .manifest_line("[dependency]\nlibrary = \"textkit\"\nversion = \"1.0.0\"")
        .file("lib/textkit/VERSION", "1.0.0")
        .write(dir.path(), "greeter-1");
    let new = Package::greeter("acme.greeter", "2.0.0", "Bonjour")
        .manifest_line("[dependency]\nlibrary = \"textkit\"\nversion = \"2.0.0\"")
        .file("lib/textkit/VERSION", "2.0.0")
        .write(dir.path(), "greeter-2");

    // Each instantiation reports the textkit its own scope resolves.
    let loaded: Arc<Mutex<Vec<(String, String, Arc<dyn ModuleInstance>)>>> = Arc::default();
    let seen = Arc::clone(&loaded);
    let runtimes = RuntimeSet::new().with(Arc::new(NativeRuntime::new().register(
        burrow_mod_greeter::ENTRY_SYMBOL,
        move |ctx: ModuleContext| {
            let textkit = ctx
                .scope()
                .resolve_private("lib/textkit/VERSION")
                .unwrap()
                .text()
                .unwrap()
                .to_string();
            let version = ctx.module_version().to_string();
            let instance = burrow_mod_greeter::instantiate(ctx)?;
            seen.lock()
                .unwrap()
                .push((version, textkit, Arc::clone(&instance)));
            Ok(instance)
        },
    )));
    let orchestrator = Orchestrator::new(surface(), runtimes)
        .with_observer(Arc::new(Mutex::new(EventBus::new())));
    let host = Version::new(2, 0, 0);
    let mut set = ModuleSet::new();
    set.insert(orchestrator.load(&request(&old, host.clone())).unwrap())
        .unwrap();
    set.insert(orchestrator.load(&request(&new, host)).unwrap())
        .unwrap();

    {
        let mut loaded = loaded.lock().unwrap();
        let seen = loaded
            .iter()
            .map(|(version, textkit, _)| (version.as_str(), textkit.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(seen, vec![("1.0.0", "1.0.0"), ("2.0.0", "2.0.0")]);
        assert!(!Arc::ptr_eq(&loaded[0].2, &loaded[1].2));
        // Instances held here would keep both boundaries alive.
        loaded.clear();
    }

    let versions = set.versions_of("acme.greeter");
    assert_eq!(versions.len(), 2);
    assert_ne!(versions[0].boundary_id(), versions[1].boundary_id());
    assert_eq!(
        versions[0].command("greet", Vec::new()).unwrap(),
        Some(vec!["Hello, world!".to_string()])
    );
    assert_eq!(
        versions[1].command("greet", Vec::new()).unwrap(),
        Some(vec!["Bonjour, world!".to_string()])
    );
    assert_eq!(
        set.latest("acme.greeter")
            .unwrap()
            .command("version", Vec::new())
            .unwrap(),
        Some(vec!["2.0.0".to_string()])
    );

    for (_, result) in set.dispose_all() {
        assert!(result.unwrap().release.is_clean());
    }
}

#[test]
fn disposal_is_ordered_and_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let root = Package::greeter("acme.c", "1.0.0", "Hi").write(dir.path(), "c");
    let bus = Arc::new(Mutex::new(EventBus::new()));
    let orchestrator = orchestrator(bus.clone());

    let handle = orchestrator
        .load(&request(&root, Version::new(2, 0, 0)))
        .unwrap();
    assert!(handle.provides(CapabilityKind::Search).unwrap());
    assert_eq!(handle.search("hi", 5).unwrap().unwrap().len(), 1);
    names(&bus);

    let first = handle.dispose().unwrap();
    assert!(!first.already_disposed);
    assert_eq!(first.release, ReleaseOutcome::Completed);
    assert_eq!(
        names(&bus),
        vec![
            "release_started",
            "release_finished",
            "teardown_requested",
            "boundary_reclaimed",
            "handle_disposed",
        ]
    );

    let second = handle.dispose().unwrap();
    assert!(second.already_disposed);
    assert_eq!(second.passes, 0);
    assert!(names(&bus).is_empty());

    assert!(handle.is_disposed());
    assert_eq!(
        handle.search("hi", 5).unwrap_err(),
        HandleError::HandleDisposed("acme.c@1.0.0".to_string())
    );
}

#[test]
fn dropping_a_handle_disposes_it() {
    let dir = tempfile::tempdir().unwrap();
    let root = Package::greeter("acme.d", "1.0.0", "Hi").write(dir.path(), "d");
    let bus = Arc::new(Mutex::new(EventBus::new()));
    let orchestrator = orchestrator(bus.clone());

    drop(
        orchestrator
            .load(&request(&root, Version::new(2, 0, 0)))
            .unwrap(),
    );
    assert_eq!(names(&bus).last(), Some(&"handle_disposed"));
}

/// Cancels the token as soon as a boundary exists.
struct CancelOnBoundary {
    token: Cancellation,
    bus: Mutex<EventBus>,
}

impl LifecycleObserver for CancelOnBoundary {
    fn observe(&self, event: LifecycleEvent) {
        if matches!(event, LifecycleEvent::BoundaryCreated { .. }) {
            self.token.cancel();
        }
        self.bus.observe(event);
    }
}

#[test]
fn cancelled_load_tears_down_its_partial_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let root = Package::greeter("acme.e", "1.0.0", "Hi").write(dir.path(), "e");
    let observer = Arc::new(CancelOnBoundary {
        token: Cancellation::new(),
        bus: Mutex::new(EventBus::new()),
    });
    let orchestrator = orchestrator(observer.clone());

    let err = orchestrator
        .load_cancellable(&request(&root, Version::new(2, 0, 0)), &observer.token)
        .unwrap_err();
    assert!(matches!(err, LoadError::Cancelled));
    assert_eq!(
        names(&observer.bus),
        vec![
            "boundary_created",
            "teardown_requested",
            "boundary_reclaimed",
            "load_rejected",
        ]
    );
}

#[test]
fn already_cancelled_load_does_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let root = Package::greeter("acme.f", "1.0.0", "Hi").write(dir.path(), "f");
    let bus = Arc::new(Mutex::new(EventBus::new()));
    let orchestrator = orchestrator(bus.clone());

    let token = Cancellation::new();
    token.cancel();
    let err = orchestrator
        .load_cancellable(&request(&root, Version::new(2, 0, 0)), &token)
        .unwrap_err();
    assert!(matches!(err, LoadError::Cancelled));
    assert_eq!(names(&bus), vec!["load_rejected"]);
}

#[test]
fn request_validation_happens_before_reading_the_package() {
    let dir = tempfile::tempdir().unwrap();
    let root = Package::greeter("acme.g", "1.0.0", "Hi").write(dir.path(), "g");
    let orchestrator = orchestrator(Arc::new(Mutex::new(EventBus::new())));
    let host = Version::new(2, 0, 0);

    let unexported = request(&root, host.clone()).share("burrow.clock");
    assert_eq!(
        orchestrator.load(&unexported).unwrap_err().kind(),
        "invalid_request"
    );

    let twice = request(&root, host.clone())
        .share(burrow_mod_greeter::LOCALE_COMPONENT)
        .share(burrow_mod_greeter::LOCALE_COMPONENT);
    assert_eq!(orchestrator.load(&twice).unwrap_err().kind(), "invalid_request");

    let wrong_contract = LoadRequest::new(&root, host, Version::new(1, 3, 0));
    assert_eq!(
        orchestrator.load(&wrong_contract).unwrap_err().kind(),
        "invalid_request"
    );
}

#[test]
fn allowlisted_component_is_visible_to_the_module() {
    let dir = tempfile::tempdir().unwrap();
    let root = Package::greeter("acme.h", "1.0.0", "Hi").write(dir.path(), "h");
    let orchestrator = orchestrator(Arc::new(Mutex::new(EventBus::new())));

    let shared = orchestrator
        .load(&request(&root, Version::new(2, 0, 0)).share(burrow_mod_greeter::LOCALE_COMPONENT))
        .unwrap();
    let settings = shared.settings().unwrap().unwrap();
    assert!(settings
        .iter()
        .any(|entry| entry.key == "locale" && entry.value == "en-GB"));

    let isolated = orchestrator
        .load(&request(&root, Version::new(2, 0, 0)))
        .unwrap();
    let settings = isolated.settings().unwrap().unwrap();
    assert!(settings.iter().all(|entry| entry.key != "locale"));
}

#[test]
fn manifest_problems_are_reported_without_a_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(Mutex::new(EventBus::new()));
    let orchestrator = orchestrator(bus.clone());
    let host = Version::new(2, 0, 0);

    let empty = dir.path().join("empty");
    fs::create_dir_all(&empty).unwrap();
    let err = orchestrator.load(&request(&empty, host.clone())).unwrap_err();
    assert!(matches!(err, LoadError::ManifestMissing(_)));

    let broken = Package::greeter("acme.i", "1.0.0", "Hi")
        .replace("version = \"1.0.0\"", "version = \"one\"")
        .write(dir.path(), "broken");
    let err = orchestrator.load(&request(&broken, host.clone())).unwrap_err();
    let LoadError::ManifestMalformed { error, .. } = &err else {
        panic!("expected a malformed manifest, got {err:?}");
    };
    assert_eq!(error.field(), Some("version"));

    let contract = Package::greeter("acme.j", "1.0.0", "Hi")
        .replace("api_version = \"^1.0\"", "api_version = \"^1.5\"")
        .write(dir.path(), "contract");
    let err = orchestrator.load(&request(&contract, host)).unwrap_err();
    let LoadError::CompatibilityRejected(verdict) = &err else {
        panic!("expected a compatibility rejection, got {err:?}");
    };
    assert_eq!(verdict.rejection().unwrap().code(), "contract_mismatch");

    assert_eq!(
        names(&bus),
        vec!["load_rejected", "load_rejected", "load_rejected"]
    );
}

#[test]
fn failures_inside_the_boundary_still_reclaim_it() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(Mutex::new(EventBus::new()));
    let orchestrator = orchestrator(bus.clone());
    let host = Version::new(2, 0, 0);

    let no_dependency = Package::greeter("acme.k", "1.0.0", "Hi")
        .manifest_line("[dependency]\nlibrary = \"textkit\"\nversion = \"1.0.0\"")
        .write(dir.path(), "no-dependency");
    let no_entry = Package::greeter("acme.l", "1.0.0", "Hi")
        .without("entry.txt")
        .write(dir.path(), "no-entry");
    let unknown_symbol = Package::greeter("acme.m", "1.0.0", "Hi")
        .file("entry.txt", "acme.nothing\n")
        .write(dir.path(), "unknown-symbol");
    let no_greetings = Package::greeter("acme.n", "1.0.0", "Hi")
        .without(burrow_mod_greeter::GREETINGS_UNIT)
        .write(dir.path(), "no-greetings");

    let cases = [
        (no_dependency, "dependency_missing"),
        (no_entry, "entry_point_not_found"),
        (unknown_symbol, "entry_point_not_found"),
        (no_greetings, "instantiation_failed"),
    ];
    for (root, kind) in cases {
        let err = orchestrator.load(&request(&root, host.clone())).unwrap_err();
        assert_eq!(err.kind(), kind, "{err}");
        assert_eq!(
            names(&bus),
            vec![
                "boundary_created",
                "teardown_requested",
                "boundary_reclaimed",
                "load_rejected",
            ],
            "{kind}"
        );
    }
}

#[test]
fn independent_loads_run_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let roots = (0..4)
        .map(|i| {
            Package::greeter(&format!("acme.par{i}"), "1.0.0", "Hi")
                .write(dir.path(), &format!("par{i}"))
        })
        .collect::<Vec<_>>();
    let orchestrator = orchestrator(Arc::new(Mutex::new(EventBus::new())));

    let handles = thread::scope(|scope| {
        let workers = roots
            .iter()
            .map(|root| {
                let orchestrator = &orchestrator;
                scope.spawn(move || orchestrator.load(&request(root, Version::new(2, 0, 0))))
            })
            .collect::<Vec<_>>();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap().unwrap())
            .collect::<Vec<_>>()
    });

    let mut boundaries = handles
        .iter()
        .map(|handle| handle.boundary_id())
        .collect::<Vec<_>>();
    boundaries.sort();
    boundaries.dedup();
    assert_eq!(boundaries.len(), 4);
}
