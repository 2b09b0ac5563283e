use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    parse_args, parse_wait_ms, session_id_schema, wait_ms_schema, Tool, ToolError, ToolResponse,
};
use crate::output::{exceeds_limit, render, tail, InvocationKind, OutputPersister, INLINE_LIMIT};
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Deserialize)]
pub struct ReadArgs {
    pub session_id: Option<String>,
    pub wait_ms: Option<Value>,
    pub working_dir: Option<String>,
}

impl ReadArgs {
    pub fn new(wait_ms: u64) -> Self {
        Self {
            session_id: None,
            wait_ms: Some(Value::from(wait_ms)),
            working_dir: None,
        }
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReadResponse {
    pub success: bool,
    pub session_id: String,
    pub output: String,
    pub output_path: String,
    pub truncated: bool,
    /// Present while a `shell_run` command is outstanding on the session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `shell_read`: collect output not yet returned by any `run` or `read`.
pub struct ShellReadTool {
    registry: Arc<SessionRegistry>,
    persister: OutputPersister,
}

impl ShellReadTool {
    pub fn new(registry: Arc<SessionRegistry>, persister: OutputPersister) -> Self {
        Self {
            registry,
            persister,
        }
    }

    pub fn execute(&self, args: ReadArgs) -> Result<ReadResponse, ToolError> {
        let wait = parse_wait_ms(args.wait_ms.as_ref())?;
        let session = self
            .registry
            .ensure(args.session_id.as_deref(), args.working_dir.as_deref())?;
        let session_id = session.id().to_string();

        thread::sleep(wait);

        let had_pending = session.pending_command().is_some();
        let outcome = session.take_undelivered();
        let exit_code = outcome.hit.as_ref().map(|hit| hit.exit_code);
        let command_completed = if exit_code.is_some() {
            Some(true)
        } else if had_pending && session.pending_command().is_some() {
            Some(false)
        } else {
            None
        };

        let content = outcome.content;
        let path = self.persister.persist(
            &session_id,
            session.next_invocation(),
            InvocationKind::Read,
            &content,
        )?;
        let output_path = path.display().to_string();

        let response = if exceeds_limit(&content) {
            ReadResponse {
                success: false,
                error: Some(format!(
                    "Output is {} bytes, over the {}-byte inline limit; showing the last {} \
                     bytes. The full output is in {}.",
                    content.len(),
                    INLINE_LIMIT,
                    INLINE_LIMIT,
                    output_path
                )),
                session_id,
                output: render(tail(&content)),
                output_path,
                truncated: true,
                command_completed,
                exit_code,
            }
        } else {
            ReadResponse {
                success: true,
                session_id,
                output: render(&content),
                output_path,
                truncated: false,
                command_completed,
                exit_code,
                error: None,
            }
        };
        Ok(response)
    }
}

impl Tool for ShellReadTool {
    fn name(&self) -> &'static str {
        "shell_read"
    }

    fn description(&self) -> &'static str {
        "Wait wait_ms, then return all output of a persistent shell session not yet \
         returned by shell_run or shell_read. Reports command_completed and exit_code \
         once a timed-out shell_run command finishes. Output over 1024 bytes is \
         truncated to its tail; the full output is saved to output_path."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "wait_ms": wait_ms_schema("Time to wait before collecting output, in milliseconds"),
                "working_dir": {
                    "type": "string",
                    "description": "Directory a new session starts in (ignored for existing sessions)"
                }
            },
            "required": ["wait_ms"]
        })
    }

    fn call(&self, arguments: Value) -> Result<ToolResponse, ToolError> {
        let response = self.execute(parse_args(arguments)?)?;
        ToolResponse::from_serialize(&response)
    }
}
