use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

/// Host configuration schema loaded from `burrow.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default = "default_host_version")]
    pub host_version: String,
    #[serde(default = "default_contract_version")]
    pub contract_version: String,
    #[serde(default)]
    pub module_roots: Vec<PathBuf>,
    /// Shared-surface components every load request exposes by default.
    #[serde(default)]
    pub shared: Vec<String>,
    #[serde(default)]
    pub teardown: TeardownConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    /// Per-module string settings, keyed by module id.
    #[serde(default)]
    pub settings: BTreeMap<String, BTreeMap<String, String>>,
}

/// Bounds for releasing modules and reclaiming their boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeardownConfig {
    #[serde(default = "default_release_timeout_ms")]
    pub release_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Timeouts for modules running as child processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_host_version() -> String {
    "1.0.0".to_string()
}

fn default_contract_version() -> String {
    "1.0.0".to_string()
}

fn default_release_timeout_ms() -> u64 {
    1_000
}

fn default_drain_timeout_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    8
}

fn default_initial_backoff_ms() -> u64 {
    5
}

fn default_max_backoff_ms() -> u64 {
    200
}

fn default_handshake_timeout_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    2_000
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            release_timeout_ms: default_release_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl TeardownConfig {
    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ProcessConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_version: default_host_version(),
            contract_version: default_contract_version(),
            module_roots: Vec::new(),
            shared: Vec::new(),
            teardown: TeardownConfig::default(),
            process: ProcessConfig::default(),
            settings: BTreeMap::new(),
        }
    }
}

/// Return the host configuration path.
///
/// Precedence: `BURROW_CONFIG` env var > `<config dir>/burrow/burrow.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("BURROW_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("burrow").join("burrow.toml"))
}

impl HostConfig {
    /// Parse and validate host configuration TOML.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse host config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate host configuration from disk.
    ///
    /// Relative module roots are resolved against the config file's directory.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read host config at {}", path.display()))?;

        let mut config = Self::from_toml_str(&raw)
            .with_context(|| format!("invalid host config at {}", path.display()))?;

        if let Some(base) = path.parent() {
            for root in &mut config.module_roots {
                if root.is_relative() {
                    *root = base.join(&*root);
                }
            }
        }
        Ok(config)
    }

    /// Load from an explicit path, else from [`config_path`] when that file
    /// exists, else fall back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        match config_path() {
            Some(path) if path.exists() => Self::from_path(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Validate versions, allowlists and teardown bounds.
    pub fn validate(&self) -> Result<()> {
        Version::parse(&self.host_version)
            .with_context(|| format!("host_version must be valid semver: {}", self.host_version))?;
        Version::parse(&self.contract_version).with_context(|| {
            format!(
                "contract_version must be valid semver: {}",
                self.contract_version
            )
        })?;

        validate_allowlist("shared", &self.shared)?;

        if self.teardown.max_attempts == 0 {
            bail!("teardown.max_attempts must be at least 1");
        }
        if self.teardown.initial_backoff_ms > self.teardown.max_backoff_ms {
            bail!(
                "teardown.initial_backoff_ms ({}) exceeds teardown.max_backoff_ms ({})",
                self.teardown.initial_backoff_ms,
                self.teardown.max_backoff_ms
            );
        }
        if self.process.handshake_timeout_ms == 0 || self.process.request_timeout_ms == 0 {
            bail!("process timeouts must be greater than zero");
        }

        Ok(())
    }

    pub fn host_version(&self) -> Result<Version> {
        Version::parse(&self.host_version)
            .with_context(|| format!("host_version must be valid semver: {}", self.host_version))
    }

    pub fn contract_version(&self) -> Result<Version> {
        Version::parse(&self.contract_version).with_context(|| {
            format!(
                "contract_version must be valid semver: {}",
                self.contract_version
            )
        })
    }

    /// Settings configured for one module id (empty when none).
    pub fn module_settings(&self, module_id: &str) -> BTreeMap<String, String> {
        self.settings.get(module_id).cloned().unwrap_or_default()
    }
}

fn validate_allowlist(field: &str, values: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();

    for value in values {
        if value.trim().is_empty() {
            bail!("{field} entries must not be empty");
        }
        if value.trim() != value {
            bail!("{field} entry {:?} has leading/trailing whitespace", value);
        }
        if !seen.insert(value.as_str()) {
            bail!("{field} contains duplicate entry {:?}", value);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"
host_version = "2.5.0"
contract_version = "1.3.0"
module_roots = ["modules"]
shared = ["burrow.log", "burrow.locale"]

[teardown]
release_timeout_ms = 250
max_attempts = 4

[settings."acme.greeter"]
prefix = "Hi"
"#;

    #[test]
    fn parses_valid_config() {
        let config = HostConfig::from_toml_str(VALID_CONFIG).unwrap();
        assert_eq!(config.host_version().unwrap(), Version::new(2, 5, 0));
        assert_eq!(config.contract_version().unwrap(), Version::new(1, 3, 0));
        assert_eq!(config.teardown.release_timeout(), Duration::from_millis(250));
        assert_eq!(config.teardown.max_attempts, 4);
        assert_eq!(config.teardown.max_backoff_ms, default_max_backoff_ms());
        assert_eq!(
            config.module_settings("acme.greeter").get("prefix").map(String::as_str),
            Some("Hi")
        );
        assert!(config.module_settings("acme.other").is_empty());
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = HostConfig::from_toml_str("").unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn invalid_host_version_is_rejected() {
        let raw = VALID_CONFIG.replace("host_version = \"2.5.0\"", "host_version = \"soon\"");
        let err = HostConfig::from_toml_str(&raw).unwrap_err().to_string();
        assert!(err.contains("host_version must be valid semver"));
    }

    #[test]
    fn duplicate_shared_entries_are_rejected() {
        let raw = VALID_CONFIG.replace("\"burrow.locale\"", "\"burrow.log\"");
        let err = HostConfig::from_toml_str(&raw).unwrap_err().to_string();
        assert!(err.contains("shared contains duplicate entry"));
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let raw = VALID_CONFIG.replace("max_attempts = 4", "max_attempts = 0");
        let err = HostConfig::from_toml_str(&raw).unwrap_err().to_string();
        assert!(err.contains("max_attempts must be at least 1"));
    }

    #[test]
    fn relative_roots_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burrow.toml");
        fs::write(&path, VALID_CONFIG).unwrap();

        let config = HostConfig::from_path(&path).unwrap();
        assert_eq!(config.module_roots, vec![dir.path().join("modules")]);
    }

    #[test]
    fn load_with_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = HostConfig::load(Some(&dir.path().join("nope.toml")))
            .unwrap_err()
            .to_string();
        assert!(err.contains("failed to read host config"));
    }
}
