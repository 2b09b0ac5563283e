use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{parse_args, session_id_schema, Tool, ToolError, ToolResponse};
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Deserialize)]
pub struct WriteArgs {
    pub session_id: Option<String>,
    pub input: String,
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WriteResponse {
    pub success: bool,
    pub session_id: String,
}

/// `shell_write`: send raw input to a session's stdin.
///
/// Not gated by the busy flag, so it can answer a prompt from a command a
/// `shell_run` is still waiting on.
pub struct ShellWriteTool {
    registry: Arc<SessionRegistry>,
}

impl ShellWriteTool {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn execute(&self, args: WriteArgs) -> Result<WriteResponse, ToolError> {
        let session = self
            .registry
            .ensure(args.session_id.as_deref(), args.working_dir.as_deref())?;

        let mut input = args.input.into_bytes();
        if !input.ends_with(b"\n") {
            input.push(b'\n');
        }
        session.write_stdin(&input)?;

        Ok(WriteResponse {
            success: true,
            session_id: session.id().to_string(),
        })
    }
}

impl Tool for ShellWriteTool {
    fn name(&self) -> &'static str {
        "shell_write"
    }

    fn description(&self) -> &'static str {
        "Write input to the stdin of a persistent shell session, e.g. to answer \
         a prompt from a running command. A trailing newline is added if missing. \
         Use shell_read afterwards to see the response."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "input": {
                    "type": "string",
                    "description": "Text to write to stdin"
                },
                "working_dir": {
                    "type": "string",
                    "description": "Directory a new session starts in (ignored for existing sessions)"
                }
            },
            "required": ["input"]
        })
    }

    fn call(&self, arguments: Value) -> Result<ToolResponse, ToolError> {
        let response = self.execute(parse_args(arguments)?)?;
        ToolResponse::from_serialize(&response)
    }
}
