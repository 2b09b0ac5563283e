use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    parse_args, parse_wait_ms, session_id_schema, wait_ms_schema, Tool, ToolError, ToolResponse,
};
use crate::marker::{EndReason, Marker};
use crate::output::{exceeds_limit, render, tail, InvocationKind, OutputPersister, INLINE_LIMIT};
use crate::session::{PendingCommand, SessionRegistry, ShellSession};
use crate::shell::ShellExit;

#[derive(Debug, Clone, Deserialize)]
pub struct RunArgs {
    pub session_id: Option<String>,
    pub command: String,
    /// Raw so that a missing or malformed value is a validation error.
    pub wait_ms: Option<Value>,
    pub working_dir: Option<String>,
}

impl RunArgs {
    pub fn new(command: impl Into<String>, wait_ms: u64) -> Self {
        Self {
            session_id: None,
            command: command.into(),
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
pub struct RunResponse {
    pub success: bool,
    pub session_id: String,
    pub output: String,
    pub output_path: String,
    pub end_reason: EndReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `shell_run`: run one command and wait for its completion marker.
pub struct ShellRunTool {
    registry: Arc<SessionRegistry>,
    persister: OutputPersister,
}

impl ShellRunTool {
    pub fn new(registry: Arc<SessionRegistry>, persister: OutputPersister) -> Self {
        Self {
            registry,
            persister,
        }
    }

    pub fn execute(&self, args: RunArgs) -> Result<RunResponse, ToolError> {
        let wait = parse_wait_ms(args.wait_ms.as_ref())?;
        let session = self
            .registry
            .ensure(args.session_id.as_deref(), args.working_dir.as_deref())?;
        let session_id = session.id().to_string();

        let _busy = session
            .try_acquire_busy()
            .ok_or_else(|| busy_error(&session))?;
        // a dead shell reports the write failure below instead
        if session.is_alive() && !session.resolve_pending() {
            return Err(busy_error(&session));
        }

        let marker = Marker::generate();
        let mut input = args.command.clone().into_bytes();
        if !input.ends_with(b"\n") {
            input.push(b'\n');
        }
        input.extend_from_slice(marker.echo_line().as_bytes());

        let cursor = session.log().len();
        let deadline = Instant::now() + wait;
        session.write_stdin(&input)?;
        session.set_pending(PendingCommand {
            marker: marker.clone(),
            command: args.command,
            since: cursor,
        });

        let result = session.wait_for_marker(&marker, cursor, deadline);
        let content = result.outcome.content;
        let exit_code = result.outcome.hit.map(|hit| hit.exit_code);
        let failure = match result.end_reason {
            EndReason::MarkerFound => None,
            EndReason::Timeout => {
                log::info!(
                    "Command on session {} still running after {} ms",
                    session_id,
                    wait.as_millis()
                );
                Some(timeout_hint(wait))
            }
            EndReason::ProcessExited => {
                log::info!("Shell of session {} exited during a run", session_id);
                Some(exited_hint(&session))
            }
        };

        let path = self.persister.persist(
            &session_id,
            session.next_invocation(),
            InvocationKind::Run,
            &content,
        )?;
        let output_path = path.display().to_string();

        let response = if exceeds_limit(&content) {
            let mut hint = format!(
                "Output is {} bytes, over the {}-byte inline limit; showing the last {} bytes. \
                 The full output is in {}.",
                content.len(),
                INLINE_LIMIT,
                INLINE_LIMIT,
                output_path
            );
            if let Some(failure) = &failure {
                hint.push_str(&format!(" {failure}"));
            }
            RunResponse {
                success: false,
                session_id,
                output: render(tail(&content)),
                output_path,
                end_reason: result.end_reason,
                exit_code,
                truncated: true,
                error: Some(hint),
            }
        } else if let Some(failure) = failure {
            RunResponse {
                success: false,
                session_id,
                output: render(&content),
                output_path,
                end_reason: result.end_reason,
                exit_code: None,
                truncated: false,
                error: Some(failure),
            }
        } else {
            RunResponse {
                success: true,
                session_id,
                output: render(&content),
                output_path,
                end_reason: result.end_reason,
                exit_code,
                truncated: false,
                error: None,
            }
        };
        Ok(response)
    }
}

fn busy_error(session: &ShellSession) -> ToolError {
    ToolError::SessionBusy {
        session_id: session.id().to_string(),
        command: session
            .pending_command()
            .unwrap_or_else(|| "unknown command".to_string()),
    }
}

fn timeout_hint(wait: Duration) -> String {
    format!(
        "Command timed out after {} ms and may still be running. Use shell_read to \
         collect more output, or retry with a larger wait_ms.",
        wait.as_millis()
    )
}

fn exited_hint(session: &ShellSession) -> String {
    let status = match session.exit() {
        Some(ShellExit {
            code: Some(code), ..
        }) => format!("code {code}"),
        Some(ShellExit {
            signal: Some(signal),
            ..
        }) => format!("signal {signal}"),
        _ => "unknown status".to_string(),
    };
    format!(
        "The shell exited ({status}) before the command finished. Use shell_start to \
         start a new shell in this session."
    )
}

impl Tool for ShellRunTool {
    fn name(&self) -> &'static str {
        "shell_run"
    }

    fn description(&self) -> &'static str {
        "Run a command in a persistent shell session and wait for it to finish. \
         Output over 1024 bytes is truncated to its tail; the full output is always \
         saved to output_path. Only one command runs per session at a time; if the \
         command is still running when wait_ms elapses, collect the rest with shell_read."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": session_id_schema(),
                "command": {
                    "type": "string",
                    "description": "Shell command to run"
                },
                "wait_ms": wait_ms_schema("Maximum time to wait for the command to finish, in milliseconds"),
                "working_dir": {
                    "type": "string",
                    "description": "Directory a new session starts in (ignored for existing sessions)"
                }
            },
            "required": ["command", "wait_ms"]
        })
    }

    fn call(&self, arguments: Value) -> Result<ToolResponse, ToolError> {
        let response = self.execute(parse_args(arguments)?)?;
        ToolResponse::from_serialize(&response)
    }
}
