//! Broadcast of shell session events.
//!
//! Drain loops publish every output chunk and every process exit here, so a
//! monitoring surface can follow sessions live without touching session
//! state. Event types are namespaced by session:
//!
//! - `shell:data:<session_id>` with a [`ShellDataPayload`]
//! - `shell:exit:<session_id>` with a [`crate::shell::ShellExit`]
//!
//! # Example
//!
//! ```rust
//! use shellpilot_core::event_bus::EventBus;
//! use shellpilot_core::session::Stream;
//!
//! let bus = EventBus::new();
//! let _rx = bus.subscribe();
//! bus.emit_data("abc", Stream::Stdout, b"hi\n");
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::session::Stream;
use crate::shell::ShellExit;

/// Slow subscribers lag (and lose events) past this many buffered events.
const CHANNEL_CAPACITY: usize = 1024;

/// Event type for output chunks of a session.
pub fn data_event(session_id: &str) -> String {
    format!("shell:data:{session_id}")
}

/// Event type for the exit of a session's process.
pub fn exit_event(session_id: &str) -> String {
    format!("shell:exit:{session_id}")
}

/// One published event: its namespaced type plus a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Payload of a `shell:data:*` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellDataPayload {
    pub stream: Stream,
    pub data: String,
}

impl ShellDataPayload {
    pub fn new(stream: Stream, data: &[u8]) -> Self {
        Self {
            stream,
            data: String::from_utf8_lossy(data).into_owned(),
        }
    }
}

/// Fan-out of session events to any number of subscribers.
///
/// Publishing never blocks a drain loop: with nobody listening an event is
/// simply dropped.
pub struct EventBus {
    tx: broadcast::Sender<ShellEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    /// Publish an arbitrary payload. Returns how many subscribers got it.
    pub fn emit<T: Serialize>(&self, event_type: &str, payload: &T) -> usize {
        match serde_json::to_value(payload) {
            Ok(payload) => self
                .tx
                .send(ShellEvent {
                    event_type: event_type.to_string(),
                    payload,
                })
                .unwrap_or(0),
            Err(e) => {
                log::warn!("Dropping {} event: {}", event_type, e);
                0
            }
        }
    }

    /// Publish an output chunk of `session_id`.
    pub fn emit_data(&self, session_id: &str, stream: Stream, data: &[u8]) -> usize {
        self.emit(&data_event(session_id), &ShellDataPayload::new(stream, data))
    }

    /// Publish the exit of `session_id`'s process.
    pub fn emit_exit(&self, session_id: &str, exit: &ShellExit) -> usize {
        self.emit(&exit_event(session_id), exit)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
