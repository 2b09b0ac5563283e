//! Read-only status report of the shell tool group.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::session::{SessionRegistry, SessionSnapshot};
use crate::shell::shell_program;

#[derive(Debug, Serialize)]
struct StatusReport {
    name: &'static str,
    status: &'static str,
    shell_executable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    sessions: Vec<SessionSnapshot>,
}

/// Reports every session's state and log without touching it.
pub struct ShellStatus {
    registry: Arc<SessionRegistry>,
}

impl ShellStatus {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn get_status(&self) -> Value {
        let (shell_executable, error) = match shell_program(self.registry.settings()) {
            Ok((program, _)) => (Some(program), None),
            Err(e) => (None, Some(e)),
        };

        let report = StatusReport {
            name: "shell",
            status: if error.is_none() { "ok" } else { "error" },
            shell_executable,
            error,
            sessions: self.registry.snapshots(),
        };
        serde_json::to_value(report).unwrap_or_else(|e| {
            log::warn!("Failed to serialize shell status: {}", e);
            Value::Null
        })
    }
}
