//! Agent-facing shell tools.
//!
//! Five tools share one [`SessionRegistry`]:
//!
//! | Tool | Purpose |
//! |------|---------|
//! | `shell_start` | create (or revive) a session |
//! | `shell_run` | run a command and wait for its completion marker |
//! | `shell_write` | feed stdin, e.g. to answer a prompt |
//! | `shell_read` | collect output produced since the last delivery |
//! | `shell_stop` | terminate a session's process group |
//!
//! Each tool has a typed `execute` for Rust callers and implements [`Tool`]
//! for JSON callers. [`ToolExecutor`] dispatches by name and flattens every
//! failure into a `{"success": false, "error": ...}` object.

mod read;
mod run;
mod start;
mod stop;
mod write;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::output::{OutputPersister, PersistError};
use crate::session::{SessionError, SessionRegistry};
use crate::status::ShellStatus;

pub use read::{ReadArgs, ReadResponse, ShellReadTool};
pub use run::{RunArgs, RunResponse, ShellRunTool};
pub use start::{ShellStartTool, StartArgs, StartResponse};
pub use stop::{ShellStopTool, StopArgs, StopResponse};
pub use write::{ShellWriteTool, WriteArgs, WriteResponse};

/// Smallest accepted `wait_ms` for `shell_run` and `shell_read`.
pub const MIN_WAIT_MS: u64 = 3000;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),

    #[error(
        "Session '{session_id}' is already running a command ({command}). \
         Use shell_read to collect its output, or shell_stop to cancel it."
    )]
    SessionBusy { session_id: String, command: String },

    #[error("{0}")]
    ProcessSpawn(String),

    #[error("{0}")]
    IoWrite(String),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

impl ToolError {
    /// Stable machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "validation",
            ToolError::SessionBusy { .. } => "session_busy",
            ToolError::ProcessSpawn(_) => "process_spawn",
            ToolError::IoWrite(_) => "io_write",
            ToolError::Persist(_) => "persist",
            ToolError::InvalidArguments(_) => "invalid_arguments",
        }
    }

    /// The error as a tool result object.
    pub fn to_response(&self) -> Value {
        json!({
            "success": false,
            "error": self.to_string(),
            "error_kind": self.kind(),
        })
    }
}

impl From<SessionError> for ToolError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidId(_) => ToolError::Validation(err.to_string()),
            SessionError::Spawn(_) | SessionError::WorkingDir(_) => {
                ToolError::ProcessSpawn(err.to_string())
            }
            SessionError::NotAlive(_) | SessionError::Write { .. } => {
                ToolError::IoWrite(err.to_string())
            }
        }
    }
}

/// A handler result ready to be sent back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ToolResponse(pub Value);

impl ToolResponse {
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, ToolError> {
        serde_json::to_value(value)
            .map(ToolResponse)
            .map_err(|e| ToolError::InvalidArguments(format!("Unserializable response: {e}")))
    }

    pub fn success(&self) -> bool {
        self.0.get("success").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// A tool callable with JSON arguments.
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;

    fn call(&self, arguments: Value) -> Result<ToolResponse, ToolError>;
}

/// Name, description, and argument schema of a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Decode a tool's arguments; `null` counts as an empty object.
pub(crate) fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    let arguments = match arguments {
        Value::Null => json!({}),
        other => other,
    };
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Validate a `wait_ms` argument.
///
/// Taken as a raw JSON value so a missing or malformed value is reported as
/// a validation error naming the field rather than a decoding error.
pub(crate) fn parse_wait_ms(wait_ms: Option<&Value>) -> Result<Duration, ToolError> {
    let value = wait_ms.filter(|v| !v.is_null()).ok_or_else(|| {
        ToolError::Validation(format!(
            "wait_ms is required and must be at least {MIN_WAIT_MS}"
        ))
    })?;

    let ms = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        _ => None,
    }
    .ok_or_else(|| {
        ToolError::Validation(format!(
            "wait_ms must be a non-negative number of milliseconds, got {value}"
        ))
    })?;

    if ms < MIN_WAIT_MS {
        return Err(ToolError::Validation(format!(
            "wait_ms must be at least {MIN_WAIT_MS}, got {ms}"
        )));
    }
    Ok(Duration::from_millis(ms))
}

fn session_id_schema() -> Value {
    json!({
        "type": "string",
        "description": "Identifier of the persistent shell session. A new id is generated when omitted."
    })
}

fn wait_ms_schema(description: &str) -> Value {
    json!({
        "type": "integer",
        "minimum": MIN_WAIT_MS,
        "description": description,
    })
}

/// Dispatches tool calls by name.
pub struct ToolExecutor {
    registry: Arc<SessionRegistry>,
    tools: BTreeMap<&'static str, Box<dyn Tool>>,
    status: ShellStatus,
}

impl ToolExecutor {
    /// Register the five shell tools over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let persister = OutputPersister::new(registry.settings().output_dir.clone());
        let tools: Vec<Box<dyn Tool>> = vec![
            Box::new(ShellStartTool::new(Arc::clone(&registry))),
            Box::new(ShellRunTool::new(Arc::clone(&registry), persister.clone())),
            Box::new(ShellWriteTool::new(Arc::clone(&registry))),
            Box::new(ShellReadTool::new(Arc::clone(&registry), persister)),
            Box::new(ShellStopTool::new(Arc::clone(&registry))),
        ];

        Self {
            status: ShellStatus::new(Arc::clone(&registry)),
            registry,
            tools: tools.into_iter().map(|t| (t.name(), t)).collect(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Run a tool and return its result object. Never fails: errors become
    /// `{"success": false, ...}`.
    pub fn execute_tool(&self, name: &str, arguments: Value) -> Value {
        let Some(tool) = self.tools.get(name) else {
            return json!({
                "success": false,
                "error": format!("Tool '{name}' not found"),
            });
        };

        log::debug!("Executing tool {}", name);
        match tool.call(arguments) {
            Ok(response) => response.into_value(),
            Err(e) => {
                log::warn!("Tool {} failed: {}", name, e);
                e.to_response()
            }
        }
    }

    /// Specs of every registered tool, in name order.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Status reports of the tool group.
    pub fn statuses(&self) -> Vec<Value> {
        vec![self.status.get_status()]
    }
}
