use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burrow_config::{ModuleKey, ModuleManifest, MANIFEST_FILE};

/// A module package found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredModule {
    pub manifest_path: PathBuf,
    pub manifest: ModuleManifest,
}

impl DiscoveredModule {
    /// Package directory, suitable as a load request location.
    pub fn root(&self) -> &Path {
        self.manifest_path.parent().unwrap_or(Path::new("."))
    }
}

/// Result of scanning module roots.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Valid packages, sorted by id then version.
    pub modules: Vec<DiscoveredModule>,
    /// Manifests that failed to parse, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

/// Discover module packages under one or more roots.
///
/// A root can be a directory (searched recursively for `module.toml`) or a
/// direct path to a `module.toml`. Missing roots are ignored. A malformed
/// manifest is skipped and reported; two packages with the same id and
/// version are an error.
pub fn discover_modules(roots: &[PathBuf]) -> Result<Discovery> {
    let mut manifest_paths = Vec::new();
    for root in roots {
        collect_manifest_paths(root, &mut manifest_paths)
            .with_context(|| format!("failed to scan module root {}", root.display()))?;
    }
    manifest_paths.sort();

    let mut discovery = Discovery::default();
    let mut seen: BTreeMap<ModuleKey, PathBuf> = BTreeMap::new();
    for path in manifest_paths {
        let manifest = match ModuleManifest::from_path(&path) {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::warn!(path = %path.display(), "skipping module: {err:#}");
                discovery.skipped.push((path, format!("{err:#}")));
                continue;
            }
        };

        if let Some(previous) = seen.insert(manifest.key(), path.clone()) {
            bail!(
                "duplicate module {} in manifests {} and {}",
                manifest.key(),
                previous.display(),
                path.display()
            );
        }
        discovery.modules.push(DiscoveredModule {
            manifest_path: path,
            manifest,
        });
    }

    discovery
        .modules
        .sort_by(|left, right| left.manifest.key().cmp(&right.manifest.key()));
    Ok(discovery)
}

fn collect_manifest_paths(root: &Path, paths: &mut Vec<PathBuf>) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }

    if root.is_file() {
        if root.file_name().and_then(|name| name.to_str()) == Some(MANIFEST_FILE) {
            paths.push(root.to_path_buf());
        }
        return Ok(());
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        for entry in fs::read_dir(&path)
            .with_context(|| format!("failed to read directory {}", path.display()))?
        {
            let entry = entry
                .with_context(|| format!("failed to read directory entry in {}", path.display()))?;
            let child = entry.path();
            if child.is_dir() {
                stack.push(child);
                continue;
            }

            if child.file_name().and_then(|name| name.to_str()) == Some(MANIFEST_FILE) {
                paths.push(child);
            }
        }
    }

    Ok(())
}
