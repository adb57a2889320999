use std::sync::Arc;

use anyhow::{bail, Context, Result};
use burrow_core::capability::{
    CapabilityKind, CapabilityRequest, CapabilityResponse, CapabilitySet, ModuleInstance,
    SearchHit, SettingEntry,
};
use burrow_core::context::ModuleContext;

/// Symbol a package's entry unit names to start this module.
pub const ENTRY_SYMBOL: &str = "burrow.greeter";

/// Private unit holding one greeting per line.
pub const GREETINGS_UNIT: &str = "lib/greetings.txt";

/// Optional shared component carrying the host locale as a `String`.
pub const LOCALE_COMPONENT: &str = "burrow.locale";

/// A small reference module.
///
/// Greets by name, searches its own greeting list, and describes its
/// settings. Each package version ships its own `lib/greetings.txt`, so two
/// versions loaded side by side answer differently.
pub struct Greeter {
    ctx: ModuleContext,
    greetings: Vec<String>,
    locale: Option<String>,
}

/// Entry factory for the native runtime.
pub fn instantiate(ctx: ModuleContext) -> Result<Arc<dyn ModuleInstance>> {
    Ok(Arc::new(Greeter::new(ctx)?))
}

impl Greeter {
    pub fn new(ctx: ModuleContext) -> Result<Self> {
        let greetings = {
            let unit = ctx
                .scope()
                .resolve_private(GREETINGS_UNIT)
                .with_context(|| format!("greeter package must ship {GREETINGS_UNIT}"))?;
            let text = unit
                .text()
                .with_context(|| format!("{GREETINGS_UNIT} is not UTF-8"))?;
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect::<Vec<_>>()
        };
        if greetings.is_empty() {
            bail!("{GREETINGS_UNIT} contains no greetings");
        }

        let locale = ctx
            .scope()
            .resolve_shared(LOCALE_COMPONENT)
            .ok()
            .and_then(|component| component.value::<String>().cloned());

        ctx.info(&format!("loaded {} greetings", greetings.len()));
        Ok(Self {
            ctx,
            greetings,
            locale,
        })
    }

    /// The greeting used by the `greet` command: the `greeting` setting when
    /// configured, otherwise the first line of the package's list.
    pub fn greeting(&self) -> &str {
        self.ctx
            .setting("greeting")
            .unwrap_or(self.greetings[0].as_str())
    }

    fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let needle = query.trim().to_lowercase();
        let mut hits = self
            .greetings
            .iter()
            .filter_map(|greeting| {
                let lower = greeting.to_lowercase();
                let score = if needle.is_empty() {
                    0.5
                } else if lower == needle {
                    1.0
                } else if lower.starts_with(&needle) {
                    0.8
                } else if lower.contains(&needle) {
                    0.6
                } else {
                    return None;
                };
                Some(SearchHit {
                    title: greeting.clone(),
                    subtitle: Some(self.ctx.scope().module().to_string()),
                    score,
                })
            })
            .collect::<Vec<_>>();
        // Stable sort keeps file order among equal scores.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        hits
    }

    fn settings(&self) -> Vec<SettingEntry> {
        let mut entries = vec![SettingEntry {
            key: "greetings".to_string(),
            value: self.greetings.len().to_string(),
            description: Some(format!("lines in {GREETINGS_UNIT}")),
        }];
        if let Some(locale) = &self.locale {
            entries.push(SettingEntry {
                key: "locale".to_string(),
                value: locale.clone(),
                description: Some(format!("from shared {LOCALE_COMPONENT}")),
            });
        }
        entries.extend(self.ctx.settings().iter().map(|(key, value)| SettingEntry {
            key: key.clone(),
            value: value.clone(),
            description: None,
        }));
        entries
    }

    fn command(&self, name: &str, args: &[String]) -> Result<Vec<String>> {
        match name {
            "greet" => {
                let who = if args.is_empty() {
                    "world".to_string()
                } else {
                    args.join(" ")
                };
                Ok(vec![format!("{}, {who}!", self.greeting())])
            }
            "version" => Ok(vec![self.ctx.module_version().to_string()]),
            other => bail!("unknown command {other:?}"),
        }
    }
}

impl ModuleInstance for Greeter {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::from([
            CapabilityKind::Search,
            CapabilityKind::Settings,
            CapabilityKind::Command,
        ])
    }

    fn handle(&self, request: CapabilityRequest) -> Result<CapabilityResponse> {
        match request {
            CapabilityRequest::Search { query, limit } => Ok(CapabilityResponse::Search {
                hits: self.search(&query, limit),
            }),
            CapabilityRequest::Settings => Ok(CapabilityResponse::Settings {
                entries: self.settings(),
            }),
            CapabilityRequest::Command { name, args } => Ok(CapabilityResponse::Command {
                lines: self.command(&name, &args)?,
            }),
        }
    }

    fn release(&self) -> Result<()> {
        self.ctx.info("greeter released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use burrow_core::context::HostContext;
    use burrow_core::scope::ScopeArena;
    use burrow_core::surface::SharedSurface;
    use semver::Version;

    fn greeter(greetings: &str, share_locale: bool, host: HostContext) -> Result<Greeter> {
        let surface = SharedSurface::builder(Version::new(1, 0, 0))
            .component(LOCALE_COMPONENT, Version::new(1, 0, 0), "en-GB".to_string())
            .build();
        let visible = if share_locale {
            vec![LOCALE_COMPONENT.to_string()]
        } else {
            Vec::new()
        };
        let arena = ScopeArena::open("acme.greeter@1.0.0", &surface, visible);
        arena
            .insert(
                GREETINGS_UNIT,
                PathBuf::from(GREETINGS_UNIT),
                greetings.as_bytes().to_vec(),
            )
            .unwrap();
        Greeter::new(ModuleContext::new("acme.greeter", "1.0.0", &host, arena.scope()))
    }

    #[test]
    fn greet_uses_first_line_unless_configured() {
        let plain = greeter("Hello\nHowdy\n", false, HostContext::new()).unwrap();
        assert_eq!(
            plain.command("greet", &["Ada".to_string()]).unwrap(),
            vec!["Hello, Ada!"]
        );

        let configured = greeter(
            "Hello\n",
            false,
            HostContext::new().with_setting("greeting", "Ahoy"),
        )
        .unwrap();
        assert_eq!(configured.command("greet", &[]).unwrap(), vec!["Ahoy, world!"]);
    }

    #[test]
    fn search_ranks_exact_then_prefix_then_substring() {
        let greeter = greeter("# comment\nsay hi\nHi there\nhi\n", false, HostContext::new())
            .unwrap();
        let titles = greeter
            .search("hi", 10)
            .into_iter()
            .map(|hit| hit.title)
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["hi", "Hi there", "say hi"]);
        assert_eq!(greeter.search("", 2).len(), 2);
        assert!(greeter.search("zzz", 10).is_empty());
    }

    #[test]
    fn locale_only_visible_when_allowlisted() {
        let shared = greeter("Hello\n", true, HostContext::new()).unwrap();
        assert!(shared.settings().iter().any(|entry| entry.key == "locale"
            && entry.value == "en-GB"));

        let hidden = greeter("Hello\n", false, HostContext::new()).unwrap();
        assert!(hidden.settings().iter().all(|entry| entry.key != "locale"));
    }

    #[test]
    fn empty_or_missing_greetings_fail_instantiation() {
        assert!(greeter("# nothing\n\n", false, HostContext::new()).is_err());

        let surface = SharedSurface::builder(Version::new(1, 0, 0)).build();
        let arena = ScopeArena::open("acme.greeter@1.0.0", &surface, Vec::new());
        let ctx = ModuleContext::new("acme.greeter", "1.0.0", &HostContext::new(), arena.scope());
        let err = instantiate(ctx).err().unwrap();
        assert!(err.to_string().contains("must ship lib/greetings.txt"));
    }

    #[test]
    fn unknown_command_is_an_error() {
        let greeter = greeter("Hello\n", false, HostContext::new()).unwrap();
        let err = greeter
            .handle(CapabilityRequest::command("dance", Vec::new()))
            .unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }
}
