use std::collections::BTreeSet;
use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Kinds of capability a module may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Answer free-text queries with ranked hits.
    Search,
    /// Describe the module's settings.
    Settings,
    /// Run named commands.
    Command,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [
        CapabilityKind::Search,
        CapabilityKind::Settings,
        CapabilityKind::Command,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::Search => "search",
            CapabilityKind::Settings => "settings",
            CapabilityKind::Command => "command",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of capabilities a module instance reports.
pub type CapabilitySet = BTreeSet<CapabilityKind>;

fn default_search_limit() -> usize {
    10
}

/// A request routed to one capability of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityRequest {
    Search {
        query: String,
        #[serde(default = "default_search_limit")]
        limit: usize,
    },
    Settings,
    Command {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl CapabilityRequest {
    pub fn search(query: impl Into<String>, limit: usize) -> Self {
        Self::Search {
            query: query.into(),
            limit,
        }
    }

    pub fn command(name: impl Into<String>, args: Vec<String>) -> Self {
        Self::Command {
            name: name.into(),
            args,
        }
    }

    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Search { .. } => CapabilityKind::Search,
            Self::Settings => CapabilityKind::Settings,
            Self::Command { .. } => CapabilityKind::Command,
        }
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub score: f64,
}

/// One module setting as the module describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingEntry {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Answer to a [`CapabilityRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityResponse {
    Search { hits: Vec<SearchHit> },
    Settings { entries: Vec<SettingEntry> },
    Command { lines: Vec<String> },
}

impl CapabilityResponse {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Search { .. } => CapabilityKind::Search,
            Self::Settings { .. } => CapabilityKind::Settings,
            Self::Command { .. } => CapabilityKind::Command,
        }
    }
}

/// The entry object of a loaded module.
///
/// The host never assumes a capability is present: it asks
/// [`capabilities`](ModuleInstance::capabilities) first and only routes
/// requests of a reported kind. Calls may arrive concurrently; an
/// implementation that cannot handle that must serialize internally.
pub trait ModuleInstance: Send + Sync {
    /// Capabilities this instance serves.
    fn capabilities(&self) -> CapabilitySet;

    /// Serve one request of a reported kind.
    fn handle(&self, request: CapabilityRequest) -> Result<CapabilityResponse>;

    /// Release resources the module acquired. Called once, before its
    /// boundary is torn down.
    ///
    /// The default implementation has nothing to release.
    fn release(&self) -> Result<()> {
        Ok(())
    }
}
