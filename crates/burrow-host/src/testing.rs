//! Package fixtures shared by unit tests.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use burrow_config::MANIFEST_FILE;
use burrow_core::capability::{
    CapabilityKind, CapabilityRequest, CapabilityResponse, CapabilitySet, ModuleInstance,
    SearchHit,
};
use burrow_core::surface::SharedSurface;
use semver::Version;
use tempfile::TempDir;

use crate::handle::ModuleHandle;
use crate::orchestrator::{LoadRequest, Orchestrator};
use crate::runtime::{NativeRuntime, RuntimeSet};

pub(crate) const ECHO_SYMBOL: &str = "test.echo";

/// Answers every search with the query itself.
pub(crate) struct Echo;

impl ModuleInstance for Echo {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::from([CapabilityKind::Search])
    }

    fn handle(&self, request: CapabilityRequest) -> anyhow::Result<CapabilityResponse> {
        match request {
            CapabilityRequest::Search { query, .. } => Ok(CapabilityResponse::Search {
                hits: vec![SearchHit {
                    title: query,
                    subtitle: None,
                    score: 1.0,
                }],
            }),
            other => bail!("echo does not serve {}", other.kind()),
        }
    }
}

/// A temp directory of native packages and an orchestrator that loads them.
pub(crate) struct Fixture {
    dir: TempDir,
    orchestrator: Orchestrator,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let surface = SharedSurface::builder(Version::new(1, 0, 0)).build();
        let runtimes = RuntimeSet::new().with(Arc::new(
            NativeRuntime::new().register(ECHO_SYMBOL, |_ctx| Ok(Arc::new(Echo) as _)),
        ));
        Self {
            dir: tempfile::tempdir().unwrap(),
            orchestrator: Orchestrator::new(surface, runtimes),
        }
    }

    /// Write an echo package for `id@version` and return its directory.
    pub(crate) fn package(&self, id: &str, version: &str) -> PathBuf {
        let root = self.dir.path().join(format!("{id}-{version}"));
        fs::create_dir_all(&root).unwrap();
        fs::write(
            root.join(MANIFEST_FILE),
            format!(
                r#"
id = "{id}"
name = "{id}"
version = "{version}"
api_version = "^1.0"
min_host_version = "1.0.0"
entry_point = "entry.txt"
"#
            ),
        )
        .unwrap();
        fs::write(root.join("entry.txt"), format!("{ECHO_SYMBOL}\n")).unwrap();
        root
    }

    pub(crate) fn load(&self, id: &str, version: &str) -> ModuleHandle {
        let request = LoadRequest::new(
            self.package(id, version),
            Version::new(1, 0, 0),
            Version::new(1, 0, 0),
        );
        self.orchestrator.load(&request).unwrap()
    }
}
