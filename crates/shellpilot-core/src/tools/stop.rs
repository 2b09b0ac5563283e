use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{parse_args, Tool, ToolError, ToolResponse};
use crate::session::SessionRegistry;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopArgs {
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StopResponse {
    pub success: bool,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// `shell_stop`: terminate a session's shell and its children.
///
/// Never creates a session. Stopping an unknown or already-dead session
/// succeeds; the session stays registered for status queries.
pub struct ShellStopTool {
    registry: Arc<SessionRegistry>,
}

impl ShellStopTool {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn execute(&self, args: StopArgs) -> Result<StopResponse, ToolError> {
        if let Some(session) = args.session_id.as_deref().and_then(|id| self.registry.lookup(id)) {
            if session.is_alive() {
                session.stop(self.registry.settings().stop_grace);
            }
        }

        Ok(StopResponse {
            success: true,
            status: "stopped",
            session_id: args.session_id,
        })
    }
}

impl Tool for ShellStopTool {
    fn name(&self) -> &'static str {
        "shell_stop"
    }

    fn description(&self) -> &'static str {
        "Stop a persistent shell session, terminating the shell and every process \
         it started. Stopping an unknown or already stopped session succeeds."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "Identifier of the session to stop"
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
