use std::collections::BTreeMap;
use std::sync::Arc;

use crate::logging::LogLevel;
use crate::scope::ModuleScope;

/// Host services a load request hands to the module it loads.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    settings: BTreeMap<String, String>,
}

impl HostContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: BTreeMap<String, String>) -> Self {
        Self { settings }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }
}

/// What a module receives at instantiation: its identity, its configuration,
/// host logging, and the resolution scope of its own boundary.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    module_id: String,
    module_version: String,
    settings: Arc<BTreeMap<String, String>>,
    scope: ModuleScope,
}

impl ModuleContext {
    pub fn new(
        module_id: impl Into<String>,
        module_version: impl Into<String>,
        host: &HostContext,
        scope: ModuleScope,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            module_version: module_version.into(),
            settings: Arc::new(host.settings.clone()),
            scope,
        }
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn module_version(&self) -> &str {
        &self.module_version
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }

    pub fn scope(&self) -> &ModuleScope {
        &self.scope
    }

    /// Emit a log line through the host's logging, tagged with the module.
    pub fn log(&self, level: LogLevel, message: &str) {
        let module = self.scope.module();
        match level {
            LogLevel::Trace => tracing::trace!(target: "burrow::module", module, "{message}"),
            LogLevel::Debug => tracing::debug!(target: "burrow::module", module, "{message}"),
            LogLevel::Info => tracing::info!(target: "burrow::module", module, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "burrow::module", module, "{message}"),
            LogLevel::Error => tracing::error!(target: "burrow::module", module, "{message}"),
        }
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeArena;
    use crate::surface::SharedSurface;
    use semver::Version;

    #[test]
    fn settings_come_from_host_context() {
        let surface = SharedSurface::builder(Version::new(1, 0, 0)).build();
        let arena = ScopeArena::open("acme.greeter@1.0.0", &surface, Vec::new());
        let host = HostContext::new().with_setting("prefix", "Hi");

        let ctx = ModuleContext::new("acme.greeter", "1.0.0", &host, arena.scope());
        assert_eq!(ctx.setting("prefix"), Some("Hi"));
        assert_eq!(ctx.setting("missing"), None);
        assert_eq!(ctx.scope().boundary_id(), arena.id());
        assert_eq!(ctx.module_id(), "acme.greeter");
    }
}
