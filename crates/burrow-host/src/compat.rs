use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use burrow_config::{ContractRequirement, ModuleManifest};
use semver::Version;

/// Why a manifest is incompatible with the running host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    HostTooOld { required: Version, host: Version },
    ContractMismatch {
        required: ContractRequirement,
        contract: Version,
    },
    DependencyVersionInvalid { library: String, declared: String },
}

impl RejectReason {
    /// Stable code for logs and assertions.
    pub fn code(&self) -> &'static str {
        match self {
            Self::HostTooOld { .. } => "host_too_old",
            Self::ContractMismatch { .. } => "contract_mismatch",
            Self::DependencyVersionInvalid { .. } => "dependency_version_invalid",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostTooOld { required, host } => {
                write!(f, "module requires host {required} or newer, but host is {host}")
            }
            Self::ContractMismatch { required, contract } => write!(
                f,
                "module requires contract {required}, but host exposes contract {contract}"
            ),
            Self::DependencyVersionInvalid { library, declared } => write!(
                f,
                "dependency {library:?} declares invalid version {declared:?}"
            ),
        }
    }
}

/// Accept/reject decision for one manifest against one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityVerdict {
    reject: Option<RejectReason>,
    reason: String,
}

impl CompatibilityVerdict {
    fn accepted(manifest: &ModuleManifest, host: &Version, contract: &Version) -> Self {
        Self {
            reject: None,
            reason: format!(
                "module {} is compatible with host {host} and contract {contract}",
                manifest.key()
            ),
        }
    }

    fn rejected(manifest: &ModuleManifest, reason: RejectReason) -> Self {
        Self {
            reason: format!("module {} rejected: {reason}", manifest.key()),
            reject: Some(reason),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.reject.is_none()
    }

    pub fn rejection(&self) -> Option<&RejectReason> {
        self.reject.as_ref()
    }

    /// Human-readable diagnostic, for accepted and rejected verdicts alike.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for CompatibilityVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Decide whether `manifest` can load into a host at `host` exposing
/// contract `contract`.
///
/// Rules run in a fixed order and the first failure wins:
/// minimum host version, then contract requirement, then the declared
/// dependency version.
pub fn resolve(manifest: &ModuleManifest, host: &Version, contract: &Version) -> CompatibilityVerdict {
    if precedes(host, manifest.min_host_version()) {
        return CompatibilityVerdict::rejected(
            manifest,
            RejectReason::HostTooOld {
                required: manifest.min_host_version().clone(),
                host: host.clone(),
            },
        );
    }

    let required = manifest.api_version();
    if !required.matches(contract) {
        return CompatibilityVerdict::rejected(
            manifest,
            RejectReason::ContractMismatch {
                required,
                contract: contract.clone(),
            },
        );
    }

    if let Some(dependency) = manifest.dependency() {
        if Version::parse(&dependency.version).is_err() {
            return CompatibilityVerdict::rejected(
                manifest,
                RejectReason::DependencyVersionInvalid {
                    library: dependency.library.clone(),
                    declared: dependency.version.clone(),
                },
            );
        }
    }

    CompatibilityVerdict::accepted(manifest, host, contract)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VerdictKey {
    module: String,
    min_host_version: Version,
    api_version: ContractRequirement,
    dependency_version: Option<String>,
    host: Version,
    contract: Version,
}

impl VerdictKey {
    fn new(manifest: &ModuleManifest, host: &Version, contract: &Version) -> Self {
        Self {
            module: manifest.key().to_string(),
            min_host_version: manifest.min_host_version().clone(),
            api_version: manifest.api_version(),
            dependency_version: manifest.dependency().map(|dep| dep.version.clone()),
            host: host.clone(),
            contract: contract.clone(),
        }
    }
}

/// Semver precedence: build metadata never orders versions.
fn precedes(left: &Version, right: &Version) -> bool {
    (left.major, left.minor, left.patch, &left.pre)
        < (right.major, right.minor, right.patch, &right.pre)
}

/// Memoizes [`resolve`] per (manifest compatibility fields, host, contract).
#[derive(Debug, Default)]
pub struct VerdictCache {
    verdicts: Mutex<HashMap<VerdictKey, CompatibilityVerdict>>,
}

impl VerdictCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(
        &self,
        manifest: &ModuleManifest,
        host: &Version,
        contract: &Version,
    ) -> CompatibilityVerdict {
        let key = VerdictKey::new(manifest, host, contract);
        let mut verdicts = self.verdicts.lock().unwrap_or_else(PoisonError::into_inner);
        verdicts
            .entry(key)
            .or_insert_with(|| resolve(manifest, host, contract))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.verdicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(min_host: &str, api: &str, dependency: Option<&str>) -> ModuleManifest {
        let mut raw = format!(
            r#"
id = "acme.fixture"
name = "Fixture"
version = "1.0.0"
api_version = "{api}"
min_host_version = "{min_host}"
entry_point = "entry.txt"
"#
        );
        if let Some(version) = dependency {
            raw.push_str(&format!(
                "\n[dependency]\nlibrary = \"json\"\nversion = \"{version}\"\n"
            ));
        }
        ModuleManifest::from_toml_str(&raw).unwrap()
    }

    fn v(input: &str) -> Version {
        Version::parse(input).unwrap()
    }

    fn code(verdict: &CompatibilityVerdict) -> Option<&'static str> {
        verdict.rejection().map(RejectReason::code)
    }

    #[test]
    fn host_version_table() {
        let cases = [
            ("2.0.0", "2.5.0", None),
            ("2.5.0", "2.5.0", None),
            ("2.5.1", "2.5.0", Some("host_too_old")),
            ("3.0.0", "2.5.0", Some("host_too_old")),
            ("1.0.0", "1.0.0-rc.1", Some("host_too_old")),
            ("0.1.0", "0.1.0", None),
            ("2.0.0+build.9", "2.0.0", None),
            ("2.0.0", "2.0.0+ci.4", None),
            ("2.0.1+build.1", "2.0.0+build.9", Some("host_too_old")),
        ];
        for (min_host, host, expected) in cases {
            let verdict = resolve(&manifest(min_host, "^1.0", None), &v(host), &v("1.0.0"));
            assert_eq!(code(&verdict), expected, "min_host={min_host} host={host}");
        }
    }

    #[test]
    fn contract_table_is_major_exact_minor_at_least() {
        let cases = [
            ("^1.0", "1.0.0", None),
            ("^1.2", "1.2.0", None),
            ("^1.2", "1.9.3", None),
            ("^1.2", "1.1.9", Some("contract_mismatch")),
            ("^1.2", "2.2.0", Some("contract_mismatch")),
            ("1", "1.7.0", None),
            ("1.x", "1.0.0", None),
            ("=2.1.5", "2.1.0", None),
            ("^0.3", "0.4.0", None),
            ("^0.3", "1.3.0", Some("contract_mismatch")),
        ];
        for (api, contract, expected) in cases {
            let verdict = resolve(&manifest("1.0.0", api, None), &v("1.0.0"), &v(contract));
            assert_eq!(code(&verdict), expected, "api={api} contract={contract}");
        }
    }

    #[test]
    fn contract_prerelease_and_build_are_ignored() {
        let m = manifest("1.0.0", "^1.2", None);
        assert!(resolve(&m, &v("1.0.0"), &v("1.2.0-beta.1")).is_accepted());
        assert!(resolve(&m, &v("1.0.0"), &v("1.2.0+build.9")).is_accepted());
    }

    #[test]
    fn dependency_version_must_parse() {
        let accepted = resolve(&manifest("1.0.0", "^1.0", Some("2.3.4")), &v("1.0.0"), &v("1.0.0"));
        assert!(accepted.is_accepted());

        let rejected = resolve(&manifest("1.0.0", "^1.0", Some("2.x")), &v("1.0.0"), &v("1.0.0"));
        assert_eq!(code(&rejected), Some("dependency_version_invalid"));
        assert!(rejected.reason().contains("\"2.x\""));
    }

    #[test]
    fn first_failing_rule_wins() {
        // Fails all three rules; only the host rule is reported.
        let m = manifest("9.0.0", "^4.0", Some("nope"));
        let verdict = resolve(&m, &v("1.0.0"), &v("1.0.0"));
        assert_eq!(code(&verdict), Some("host_too_old"));

        // Host passes; contract is next.
        let m = manifest("1.0.0", "^4.0", Some("nope"));
        let verdict = resolve(&m, &v("1.0.0"), &v("1.0.0"));
        assert_eq!(code(&verdict), Some("contract_mismatch"));
    }

    #[test]
    fn verdict_reason_names_module_and_versions() {
        let verdict = resolve(&manifest("3.0.0", "^1.0", None), &v("2.5.0"), &v("1.0.0"));
        assert!(!verdict.is_accepted());
        assert_eq!(
            verdict.reason(),
            "module acme.fixture@1.0.0 rejected: module requires host 3.0.0 or newer, but host is 2.5.0"
        );
    }

    #[test]
    fn resolve_is_deterministic() {
        let m = manifest("2.0.0", "^1.1", Some("1.0.0"));
        let first = resolve(&m, &v("2.5.0"), &v("1.3.0"));
        let second = resolve(&m, &v("2.5.0"), &v("1.3.0"));
        assert_eq!(first, second);
    }

    #[test]
    fn cache_reuses_verdicts_per_triple() {
        let cache = VerdictCache::new();
        let m = manifest("2.0.0", "^1.0", None);

        let a = cache.resolve(&m, &v("2.5.0"), &v("1.0.0"));
        let b = cache.resolve(&m, &v("2.5.0"), &v("1.0.0"));
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);

        let c = cache.resolve(&m, &v("1.0.0"), &v("1.0.0"));
        assert!(!c.is_accepted());
        assert_eq!(cache.len(), 2);
    }
}
