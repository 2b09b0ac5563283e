//! # shellpilot-core
//!
//! Persistent interactive shell sessions for automated agents.
//!
//! An agent drives long-lived shells through five tools (`shell_start`,
//! `shell_run`, `shell_write`, `shell_read`, `shell_stop`). Shell state such
//! as the working directory and environment survives between calls, output
//! is drained continuously in the background, and every invocation's output
//! is saved to disk so that large results never flood the caller.
//!
//! This crate is framework-agnostic; the daemon crate exposes it over
//! JSON lines.
//!
//! ## Key Concepts
//!
//! - **Session**: one shell process plus its append-only output log
//! - **Marker**: a one-off token echoed after a command to detect completion
//! - **Artifact**: the on-disk copy of one `run`/`read` invocation's output

pub mod config;
pub mod event_bus;
pub mod logging;
pub mod marker;
pub mod output;
pub mod paths;
pub mod session;
pub mod shell;
pub mod status;
pub mod tools;

// Re-export commonly used types
pub use config::{ShellSettings, ShellType};
pub use event_bus::EventBus;
pub use session::{SessionId, SessionRegistry, ShellSession};
pub use tools::{ToolError, ToolExecutor};
