//! Wire types for modules that run as child processes.
//!
//! Newline-delimited JSON-RPC 2.0 over the child's stdin/stdout. The host
//! sends requests; the module answers each with a response carrying the same
//! id and may interleave `burrow.log` notifications at any time.

use std::collections::BTreeMap;
use std::fmt;

use burrow_core::capability::CapabilityKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version used on the module pipe.
pub const JSONRPC_VERSION: &str = "2.0";

/// Host -> module: first request, carries identity and settings.
pub const INITIALIZE_METHOD: &str = "burrow.initialize";
/// Host -> module: one capability request.
pub const CAPABILITY_METHOD: &str = "burrow.capability";
/// Host -> module: release everything; the module should exit afterwards.
pub const RELEASE_METHOD: &str = "burrow.release";
/// Module -> host notification: a log line.
pub const LOG_METHOD: &str = "burrow.log";

/// JSON-RPC error codes a module may answer with.
pub mod error_code {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    /// The module understood the request but could not serve it.
    pub const CAPABILITY_FAILED: i32 = -32010;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Host-issued request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestEnvelope<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> RequestEnvelope<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

/// Any line a module writes. Responses carry `id` and no `method`;
/// notifications carry `method` and no `id`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Incoming {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// A classified [`Incoming`] line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Response {
        id: u64,
        outcome: Result<Value, JsonRpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Incoming {
    pub fn classify(self) -> Result<Message, String> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(format!("unsupported jsonrpc version: {}", self.jsonrpc));
        }
        match (self.id, self.method) {
            (Some(id), None) => {
                let outcome = match self.error {
                    Some(error) => Err(error),
                    None => Ok(self.result.unwrap_or(Value::Null)),
                };
                Ok(Message::Response { id, outcome })
            }
            (None, Some(method)) => Ok(Message::Notification {
                method,
                params: self.params,
            }),
            (Some(_), Some(method)) => Err(format!(
                "modules may not send requests to the host (got {method})"
            )),
            (None, None) => Err("message has neither id nor method".to_string()),
        }
    }
}

/// Params of [`INITIALIZE_METHOD`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeParams {
    pub module_id: String,
    pub module_version: String,
    pub contract_version: String,
    /// Shared-surface names the module may rely on.
    pub shared: Vec<String>,
    pub settings: BTreeMap<String, String>,
}

/// Result of [`INITIALIZE_METHOD`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: Vec<CapabilityKind>,
}

/// Params of a [`LOG_METHOD`] notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogParams {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub message: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
