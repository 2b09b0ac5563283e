//! JSON-lines request/response protocol.
//!
//! Each stdin line is one request:
//!
//! ```text
//! {"id": 1, "tool": "shell_run", "arguments": {"command": "ls", "wait_ms": 5000}}
//! ```
//!
//! and produces exactly one stdout line `{"id": 1, "result": {...}}`. Besides
//! the shell tools, `tools/list` returns the tool specs and `status` the
//! status reports.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shellpilot_core::ToolExecutor;

pub const LIST_TOOLS: &str = "tools/list";
pub const STATUS: &str = "status";

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Response {
    pub id: Value,
    pub result: Value,
}

/// Unsolicited event line, sent when event forwarding is on.
#[derive(Debug, Serialize)]
pub struct EventLine<'a> {
    pub event: &'a str,
    pub payload: &'a Value,
}

/// Parse one input line; malformed lines get an error response.
pub fn parse_line(line: &str) -> Result<Request, Response> {
    serde_json::from_str(line).map_err(|e| Response {
        id: Value::Null,
        result: json!({
            "success": false,
            "error": format!("Invalid request: {e}"),
        }),
    })
}

/// Handle one request. Blocks for as long as the tool does.
pub fn handle(executor: &ToolExecutor, request: Request) -> Response {
    let result = match request.tool.as_str() {
        LIST_TOOLS => json!({ "tools": executor.tool_specs() }),
        STATUS => json!({ "statuses": executor.statuses() }),
        tool => executor.execute_tool(tool, request.arguments),
    };
    Response {
        id: request.id,
        result,
    }
}
