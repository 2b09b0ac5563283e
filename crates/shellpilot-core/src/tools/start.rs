use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{parse_args, session_id_schema, Tool, ToolError, ToolResponse};
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartArgs {
    pub session_id: Option<String>,
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StartResponse {
    pub success: bool,
    pub session_id: String,
    pub status: &'static str,
}

/// `shell_start`: create a session, or revive one whose shell has exited.
pub struct ShellStartTool {
    registry: Arc<SessionRegistry>,
}

impl ShellStartTool {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn execute(&self, args: StartArgs) -> Result<StartResponse, ToolError> {
        let session = self
            .registry
            .start(args.session_id.as_deref(), args.working_dir.as_deref())?;
        Ok(StartResponse {
            success: true,
            session_id: session.id().to_string(),
            status: "started",
        })
    }
}

impl Tool for ShellStartTool {
    fn name(&self) -> &'static str {
        "shell_start"
    }

    fn description(&self) -> &'static str {
        "Start a persistent shell session (bash if available, otherwise sh). \
         Starting a session that is already running does nothing; a session \
         whose shell has exited is restarted with the same id."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "working_dir": {
                    "type": "string",
                    "description": "Directory the shell starts in (default: current directory)"
                }
            },
            "required": []
        })
    }

    fn call(&self, arguments: Value) -> Result<ToolResponse, ToolError> {
        let response = self.execute(parse_args(arguments)?)?;
        ToolResponse::from_serialize(&response)
    }
}
