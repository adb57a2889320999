use std::fmt;
use std::fs;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

/// File name of the manifest at the root of every module package.
pub const MANIFEST_FILE: &str = "module.toml";

/// Manifest record exactly as it appears in `module.toml`.
///
/// Every field is optional at this layer so validation can report the first
/// missing or invalid field by name instead of a generic deserializer error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestSource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, alias = "apiVersion")]
    pub api_version: Option<String>,
    #[serde(default, alias = "minHostVersion")]
    pub min_host_version: Option<String>,
    #[serde(default)]
    pub dependency: Option<DependencySource>,
    #[serde(default, alias = "entryPoint", alias = "entryAssembly")]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub runtime: Option<RuntimeSource>,
}

/// `[dependency]` table of a manifest source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencySource {
    #[serde(default)]
    pub library: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// `[runtime]` table of a manifest source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSource {
    #[serde(default)]
    pub kind: Option<RuntimeKind>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// How a module's entry artifact is brought to life.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// The entry artifact names a factory compiled into the host.
    #[default]
    Native,
    /// The entry artifact is launched as a child process.
    Process,
}

impl RuntimeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeKind::Native => "native",
            RuntimeKind::Process => "process",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dependency library declared by a module.
///
/// The version is kept verbatim: whether it parses is a compatibility
/// decision, not a structural one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyDecl {
    pub library: String,
    pub version: String,
}

/// Launch settings for the module entry artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LaunchSpec {
    pub kind: RuntimeKind,
    pub command: Option<String>,
    pub args: Vec<String>,
}

/// Identity of one loadable unit: module id plus module version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleKey {
    pub id: String,
    pub version: Version,
}

impl ModuleKey {
    pub fn new(id: impl Into<String>, version: Version) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Contract-version requirement declared by a module.
///
/// Matching is major-exact, minor-at-least. Patch, pre-release and build
/// metadata components are accepted in the written form but never take part
/// in matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContractRequirement {
    major: u64,
    minor: u64,
}

impl ContractRequirement {
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// Parse `1`, `1.2`, `1.2.3`, `^1.2`, `=1.2.0`, `1.x`, `1.2.*` and friends.
    pub fn parse(input: &str) -> std::result::Result<Self, String> {
        let trimmed = input.trim();
        let body = trimmed
            .strip_prefix('^')
            .or_else(|| trimmed.strip_prefix('='))
            .unwrap_or(trimmed)
            .trim();
        if body.is_empty() {
            return Err("requirement is empty".to_string());
        }

        let core = body
            .split(|c: char| c == '-' || c == '+')
            .next()
            .unwrap_or(body);

        let mut components = core.split('.');
        let major = match components.next() {
            Some(raw) if is_wildcard(raw) => {
                return Err(format!("major component must be a number: {input:?}"))
            }
            Some(raw) => parse_component(raw, input)?,
            None => return Err(format!("requirement has no major component: {input:?}")),
        };

        let mut minor = 0;
        let mut wildcard_seen = false;
        for (position, raw) in components.enumerate() {
            if position > 1 {
                return Err(format!("requirement has too many components: {input:?}"));
            }
            if is_wildcard(raw) {
                wildcard_seen = true;
                continue;
            }
            if wildcard_seen {
                return Err(format!(
                    "numeric component after a wildcard in requirement: {input:?}"
                ));
            }
            let value = parse_component(raw, input)?;
            if position == 0 {
                minor = value;
            }
        }

        Ok(Self { major, minor })
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    /// Return true when `contract` satisfies this requirement.
    pub fn matches(&self, contract: &Version) -> bool {
        contract.major == self.major && contract.minor >= self.minor
    }
}

impl fmt::Display for ContractRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "^{}.{}", self.major, self.minor)
    }
}

fn is_wildcard(raw: &str) -> bool {
    matches!(raw, "x" | "X" | "*")
}

fn parse_component(raw: &str, input: &str) -> std::result::Result<u64, String> {
    raw.parse::<u64>()
        .map_err(|_| format!("invalid version component {raw:?} in requirement {input:?}"))
}

/// Structural manifest failure, naming the first offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    Syntax(String),
    MissingField(&'static str),
    InvalidField { field: &'static str, reason: String },
}

impl ManifestError {
    /// Field that failed validation, if the failure is field-specific.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Syntax(_) => None,
            Self::MissingField(field) | Self::InvalidField { field, .. } => Some(field),
        }
    }

    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax(msg) => write!(f, "failed to parse module manifest TOML: {msg}"),
            Self::MissingField(field) => write!(f, "manifest field {field} is required"),
            Self::InvalidField { field, reason } => {
                write!(f, "manifest field {field} is invalid: {reason}")
            }
        }
    }
}

impl std::error::Error for ManifestError {}

/// Validated, immutable description of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleManifest {
    id: String,
    name: String,
    version: Version,
    api_version: ContractRequirement,
    min_host_version: Version,
    dependency: Option<DependencyDecl>,
    entry_point: String,
    launch: LaunchSpec,
}

impl ModuleManifest {
    /// Parse and validate manifest TOML.
    pub fn from_toml_str(input: &str) -> std::result::Result<Self, ManifestError> {
        let source: ManifestSource =
            toml::from_str(input).map_err(|err| ManifestError::Syntax(err.to_string()))?;
        Self::from_source(source)
    }

    /// Load and validate a manifest from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read module manifest at {}", path.display()))?;

        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid module manifest at {}", path.display()))
    }

    /// Validate a raw record. Fields are checked in declaration order and the
    /// first failure is returned.
    pub fn from_source(source: ManifestSource) -> std::result::Result<Self, ManifestError> {
        let id = required("id", source.id)?;
        validate_identifier("id", &id)?;
        let name = required("name", source.name)?;

        let version = required("version", source.version)?;
        let version = Version::parse(&version).map_err(|err| {
            ManifestError::invalid("version", format!("not valid semver {version:?}: {err}"))
        })?;

        let api_version = required("api_version", source.api_version)?;
        let api_version =
            ContractRequirement::parse(&api_version).map_err(|err| {
                ManifestError::invalid("api_version", err)
            })?;

        let min_host_version = required("min_host_version", source.min_host_version)?;
        let min_host_version = Version::parse(&min_host_version).map_err(|err| {
            ManifestError::invalid(
                "min_host_version",
                format!("not valid semver {min_host_version:?}: {err}"),
            )
        })?;

        let dependency = match source.dependency {
            Some(dependency) => {
                let library = required("dependency.library", dependency.library)?;
                validate_relative_path("dependency.library", &library)?;
                Some(DependencyDecl {
                    library,
                    version: required("dependency.version", dependency.version)?,
                })
            }
            None => None,
        };

        let entry_point = required("entry_point", source.entry_point)?;
        validate_relative_path("entry_point", &entry_point)?;

        let launch = match source.runtime {
            Some(runtime) => {
                if let Some(command) = &runtime.command {
                    validate_nonempty("runtime.command", command)?;
                }
                validate_runtime_args(&runtime.args)?;
                LaunchSpec {
                    kind: runtime.kind.unwrap_or_default(),
                    command: runtime.command,
                    args: runtime.args,
                }
            }
            None => LaunchSpec::default(),
        };

        Ok(Self {
            id,
            name,
            version,
            api_version,
            min_host_version,
            dependency,
            entry_point,
            launch,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn api_version(&self) -> ContractRequirement {
        self.api_version
    }

    pub fn min_host_version(&self) -> &Version {
        &self.min_host_version
    }

    pub fn dependency(&self) -> Option<&DependencyDecl> {
        self.dependency.as_ref()
    }

    /// Package-relative path of the entry artifact.
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    pub fn key(&self) -> ModuleKey {
        ModuleKey::new(self.id.clone(), self.version.clone())
    }
}

fn required(
    field: &'static str,
    value: Option<String>,
) -> std::result::Result<String, ManifestError> {
    let value = value.ok_or(ManifestError::MissingField(field))?;
    validate_nonempty(field, &value)?;
    Ok(value.trim().to_string())
}

fn validate_nonempty(field: &'static str, value: &str) -> std::result::Result<(), ManifestError> {
    if value.trim().is_empty() {
        return Err(ManifestError::invalid(field, "must not be empty"));
    }
    Ok(())
}

fn validate_identifier(field: &'static str, value: &str) -> std::result::Result<(), ManifestError> {
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(ManifestError::invalid(
            field,
            format!("{value:?} contains unsupported character {bad:?}"),
        ));
    }
    Ok(())
}

fn validate_relative_path(field: &'static str, value: &str) -> std::result::Result<(), ManifestError> {
    let path = Path::new(value);
    let escapes = path
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ManifestError::invalid(
            field,
            format!("{value:?} must stay inside the module package"),
        ));
    }
    Ok(())
}

fn validate_runtime_args(args: &[String]) -> std::result::Result<(), ManifestError> {
    for arg in args {
        if arg.trim().is_empty() {
            return Err(ManifestError::invalid(
                "runtime.args",
                "entries must not be empty",
            ));
        }
        if arg.trim() != arg {
            return Err(ManifestError::invalid(
                "runtime.args",
                format!("entry {arg:?} has leading/trailing whitespace"),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_MANIFEST: &str = r#"
id = "acme.greeter"
name = "Greeter"
version = "1.0.0"
api_version = "1.2"
min_host_version = "2.0.0"
entry_point = "greeter.entry"

[dependency]
library = "textkit"
version = "0.4.1"
"#;

    #[test]
    fn parses_valid_manifest() {
        let manifest = ModuleManifest::from_toml_str(VALID_MANIFEST).unwrap();
        assert_eq!(manifest.id(), "acme.greeter");
        assert_eq!(manifest.version(), &Version::new(1, 0, 0));
        assert_eq!(manifest.api_version(), ContractRequirement::new(1, 2));
        assert_eq!(manifest.min_host_version(), &Version::new(2, 0, 0));
        assert_eq!(manifest.dependency().unwrap().library, "textkit");
        assert_eq!(manifest.launch().kind, RuntimeKind::Native);
        assert_eq!(manifest.key().to_string(), "acme.greeter@1.0.0");
    }

    #[test]
    fn camel_case_aliases_are_accepted() {
        let raw = r#"
id = "acme.alias"
name = "Alias"
version = "0.3.0"
apiVersion = "1"
minHostVersion = "1.0.0"
entryAssembly = "bin/alias.sh"

[runtime]
kind = "process"
command = "sh"
"#;
        let manifest = ModuleManifest::from_toml_str(raw).unwrap();
        assert_eq!(manifest.entry_point(), "bin/alias.sh");
        assert_eq!(manifest.launch().kind, RuntimeKind::Process);
        assert_eq!(manifest.launch().command.as_deref(), Some("sh"));
    }

    #[test]
    fn missing_field_is_named() {
        let raw = VALID_MANIFEST.replace("id = \"acme.greeter\"\n", "");
        let err = ModuleManifest::from_toml_str(&raw).unwrap_err();
        assert_eq!(err, ManifestError::MissingField("id"));
        assert_eq!(err.field(), Some("id"));
    }

    #[test]
    fn first_invalid_field_wins() {
        let raw = VALID_MANIFEST
            .replace("version = \"1.0.0\"", "version = \"one\"")
            .replace("min_host_version = \"2.0.0\"", "min_host_version = \"two\"");
        let err = ModuleManifest::from_toml_str(&raw).unwrap_err();
        assert_eq!(err.field(), Some("version"));
        assert!(err.to_string().contains("not valid semver"));
    }

    #[test]
    fn invalid_contract_requirement_is_rejected() {
        let raw = VALID_MANIFEST.replace("api_version = \"1.2\"", "api_version = \"what\"");
        let err = ModuleManifest::from_toml_str(&raw).unwrap_err();
        assert_eq!(err.field(), Some("api_version"));
    }

    #[test]
    fn dependency_version_is_kept_verbatim() {
        let raw = VALID_MANIFEST.replace("version = \"0.4.1\"", "version = \"latest\"");
        let manifest = ModuleManifest::from_toml_str(&raw).unwrap();
        assert_eq!(manifest.dependency().unwrap().version, "latest");
    }

    #[test]
    fn dependency_without_library_is_rejected() {
        let raw = VALID_MANIFEST.replace("library = \"textkit\"\n", "");
        let err = ModuleManifest::from_toml_str(&raw).unwrap_err();
        assert_eq!(err, ManifestError::MissingField("dependency.library"));
    }

    #[test]
    fn dependency_library_must_stay_inside_package() {
        for bad in ["../textkit", "/opt/textkit", "lib/../../textkit"] {
            let raw = VALID_MANIFEST.replace("library = \"textkit\"", &format!("library = {bad:?}"));
            let err = ModuleManifest::from_toml_str(&raw).unwrap_err();
            assert_eq!(err.field(), Some("dependency.library"), "{bad}");
        }

        let nested = VALID_MANIFEST.replace("library = \"textkit\"", "library = \"text/kit\"");
        let manifest = ModuleManifest::from_toml_str(&nested).unwrap();
        assert_eq!(manifest.dependency().unwrap().library, "text/kit");
    }

    #[test]
    fn entry_point_must_stay_inside_package() {
        for bad in ["../escape.entry", "/abs/entry"] {
            let raw = VALID_MANIFEST.replace("greeter.entry", bad);
            let err = ModuleManifest::from_toml_str(&raw).unwrap_err();
            assert_eq!(err.field(), Some("entry_point"), "{bad}");
        }
    }

    #[test]
    fn unknown_fields_are_syntax_errors() {
        let raw = format!("{VALID_MANIFEST}\nsurprise = true\n");
        let err = ModuleManifest::from_toml_str(&raw).unwrap_err();
        assert!(matches!(err, ManifestError::Syntax(_)));
        assert!(err.to_string().contains("failed to parse module manifest TOML"));
    }

    #[test]
    fn runtime_args_with_whitespace_are_rejected() {
        let raw = format!("{VALID_MANIFEST}\n[runtime]\nkind = \"process\"\nargs = [\" -v\"]\n");
        let err = ModuleManifest::from_toml_str(&raw).unwrap_err();
        assert_eq!(err.field(), Some("runtime.args"));
    }

    #[test]
    fn identifier_rejects_spaces() {
        let raw = VALID_MANIFEST.replace("acme.greeter", "acme greeter");
        let err = ModuleManifest::from_toml_str(&raw).unwrap_err();
        assert_eq!(err.field(), Some("id"));
    }

    #[test]
    fn contract_requirement_forms() {
        let cases = [
            ("1", (1, 0)),
            ("1.2", (1, 2)),
            ("1.2.9", (1, 2)),
            ("^1.4", (1, 4)),
            ("=2.0.0", (2, 0)),
            ("1.x", (1, 0)),
            ("3.1.*", (3, 1)),
            ("1.2.0-beta.1", (1, 2)),
            ("1.2.0+build.5", (1, 2)),
        ];
        for (raw, (major, minor)) in cases {
            let req = ContractRequirement::parse(raw).unwrap();
            assert_eq!((req.major(), req.minor()), (major, minor), "{raw}");
        }
    }

    #[test]
    fn contract_requirement_rejects_garbage() {
        for raw in ["", "^", "x", "1.x.3", "1.2.3.4", "one.two"] {
            assert!(ContractRequirement::parse(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn contract_requirement_matching_is_major_exact_minor_at_least() {
        let req = ContractRequirement::new(1, 2);
        assert!(req.matches(&Version::new(1, 2, 0)));
        assert!(req.matches(&Version::new(1, 9, 3)));
        assert!(!req.matches(&Version::new(1, 1, 9)));
        assert!(!req.matches(&Version::new(2, 2, 0)));
        assert!(!req.matches(&Version::new(0, 2, 0)));
    }
}
