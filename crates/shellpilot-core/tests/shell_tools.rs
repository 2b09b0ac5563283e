#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use shellpilot_core::event_bus::{data_event, exit_event};
use shellpilot_core::{EventBus, SessionRegistry, ShellSettings, ShellType, ToolExecutor};
use tempfile::TempDir;

struct Harness {
    executor: ToolExecutor,
    events: Arc<EventBus>,
    _outputs: TempDir,
}

impl Harness {
    fn new() -> Self {
        let outputs = tempfile::tempdir().unwrap();
        let settings = ShellSettings::new()
            .shell_type(ShellType::Sh)
            .output_dir(outputs.path())
            .stop_grace(Duration::from_millis(500));
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(SessionRegistry::new(settings, Arc::clone(&events)));
        Self {
            executor: ToolExecutor::new(registry),
            events,
            _outputs: outputs,
        }
    }

    fn call(&self, tool: &str, arguments: Value) -> Value {
        self.executor.execute_tool(tool, arguments)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.executor.registry().stop_all();
    }
}

fn read_artifact(response: &Value) -> Vec<u8> {
    let path = response["output_path"].as_str().expect("output_path");
    std::fs::read(path).unwrap()
}

#[test]
fn echo_completes_with_marker() {
    let h = Harness::new();
    let result = h.call(
        "shell_run",
        json!({"session_id": "s1", "command": "echo hi", "wait_ms": 5000}),
    );

    assert_eq!(result["success"], true, "{result}");
    assert_eq!(result["session_id"], "s1");
    assert_eq!(result["output"], "hi\n");
    assert_eq!(result["end_reason"], "marker_found");
    assert_eq!(result["exit_code"], 0);
    assert_eq!(result["truncated"], false);
    assert_eq!(read_artifact(&result), b"hi\n");
}

#[test]
fn slow_command_times_out_with_hint() {
    let h = Harness::new();
    let started = Instant::now();
    let result = h.call(
        "shell_run",
        json!({"session_id": "s2", "command": "sleep 5", "wait_ms": 3000}),
    );

    assert!(started.elapsed() >= Duration::from_millis(3000));
    assert!(started.elapsed() < Duration::from_millis(4900));
    assert_eq!(result["success"], false);
    assert_eq!(result["end_reason"], "timeout");
    assert!(result["output_path"].is_string());
    let error = result["error"].as_str().unwrap();
    assert!(error.contains("timed out"));
    assert!(error.contains("shell_read"));
}

#[test]
fn large_output_is_truncated_but_recoverable() {
    let h = Harness::new();
    let result = h.call(
        "shell_run",
        json!({
            "session_id": "s3",
            "command": "head -c 5000 /dev/zero | tr '\\0' x",
            "wait_ms": 5000
        }),
    );

    assert_eq!(result["success"], false);
    assert_eq!(result["truncated"], true);
    assert_eq!(result["end_reason"], "marker_found");
    assert_eq!(result["output"].as_str().unwrap().len(), 1024);
    assert!(result["error"].as_str().unwrap().contains("5000 bytes"));
    assert_eq!(read_artifact(&result), vec![b'x'; 5000]);
}

#[test]
fn large_output_of_unfinished_command_names_both_limits() {
    let h = Harness::new();
    let result = h.call(
        "shell_run",
        json!({
            "session_id": "s3-slow",
            "command": "head -c 5000 /dev/zero | tr '\\0' x; sleep 10",
            "wait_ms": 3000
        }),
    );

    assert_eq!(result["success"], false);
    assert_eq!(result["truncated"], true);
    assert_eq!(result["end_reason"], "timeout");
    assert!(result.get("exit_code").is_none());
    assert_eq!(result["output"].as_str().unwrap().len(), 1024);
    let error = result["error"].as_str().unwrap();
    assert!(error.contains("5000 bytes"), "{error}");
    assert!(error.contains("timed out after 3000 ms"), "{error}");
    assert_eq!(read_artifact(&result), vec![b'x'; 5000]);
}

#[test]
fn shell_exit_during_run_is_reported_promptly() {
    let h = Harness::new();
    let started = Instant::now();
    let result = h.call(
        "shell_run",
        json!({"session_id": "s-exit", "command": "exit 3", "wait_ms": 10000}),
    );

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result["success"], false);
    assert_eq!(result["end_reason"], "process_exited");
    assert!(result["error"].as_str().unwrap().contains("shell_start"));

    let again = h.call(
        "shell_run",
        json!({"session_id": "s-exit", "command": "echo hi", "wait_ms": 3000}),
    );
    assert_eq!(again["error_kind"], "io_write", "{again}");
}

#[test]
fn stopping_unknown_session_succeeds() {
    let h = Harness::new();
    let result = h.call("shell_stop", json!({"session_id": "never-created"}));
    assert_eq!(
        result,
        json!({"success": true, "status": "stopped", "session_id": "never-created"})
    );
    assert!(h.executor.registry().lookup("never-created").is_none());
}

#[test]
fn second_run_while_first_in_flight_is_busy() {
    let h = Arc::new(Harness::new());
    h.call("shell_start", json!({"session_id": "s5"}));

    let first = {
        let h = Arc::clone(&h);
        std::thread::spawn(move || {
            h.call(
                "shell_run",
                json!({"session_id": "s5", "command": "sleep 4; echo first", "wait_ms": 8000}),
            )
        })
    };

    let session = h.executor.registry().lookup("s5").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !session.is_busy() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(session.is_busy());

    let log_len = session.log().len();
    let second = h.call(
        "shell_run",
        json!({"session_id": "s5", "command": "echo second", "wait_ms": 3000}),
    );
    assert_eq!(second["success"], false);
    assert_eq!(second["error_kind"], "session_busy");

    let first = first.join().unwrap();
    assert_eq!(first["success"], true);
    assert_eq!(first["output"], "first\n");

    // nothing from the rejected call reached the shell
    let seen: Vec<u8> = session
        .log()
        .entries_from(log_len)
        .into_iter()
        .flat_map(|e| e.data)
        .collect();
    assert!(!String::from_utf8_lossy(&seen).contains("second"));
}

#[test]
fn wait_ms_below_minimum_is_rejected_without_side_effects() {
    let h = Harness::new();
    for tool in ["shell_run", "shell_read"] {
        let result = h.call(
            tool,
            json!({"session_id": "quick", "command": "echo hi", "wait_ms": 100}),
        );
        assert_eq!(result["success"], false, "{tool}");
        assert_eq!(result["error_kind"], "validation", "{tool}");
        assert!(result["error"].as_str().unwrap().contains("wait_ms"));
    }

    let missing = h.call("shell_run", json!({"command": "echo hi"}));
    assert_eq!(missing["error_kind"], "validation");
    assert!(missing["error"].as_str().unwrap().contains("wait_ms"));

    assert!(h.executor.registry().lookup("quick").is_none());
}

#[test]
fn write_after_exit_fails() {
    let h = Harness::new();
    h.call("shell_start", json!({"session_id": "gone"}));
    let session = h.executor.registry().lookup("gone").unwrap();

    h.call("shell_write", json!({"session_id": "gone", "input": "exit 0"}));
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.is_alive() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!session.is_alive());

    let result = h.call("shell_write", json!({"session_id": "gone", "input": "echo hi"}));
    assert_eq!(result["success"], false);
    assert_eq!(result["error_kind"], "io_write");
}

#[test]
fn read_picks_up_where_timed_out_run_left_off() {
    let h = Harness::new();
    let run = h.call(
        "shell_run",
        json!({"session_id": "later", "command": "sleep 4; echo done", "wait_ms": 3000}),
    );
    assert_eq!(run["end_reason"], "timeout");

    let busy = h.call(
        "shell_run",
        json!({"session_id": "later", "command": "echo again", "wait_ms": 3000}),
    );
    assert_eq!(busy["error_kind"], "session_busy");
    assert!(busy["error"].as_str().unwrap().contains("sleep 4"));

    let read = h.call("shell_read", json!({"session_id": "later", "wait_ms": 3000}));
    assert_eq!(read["success"], true, "{read}");
    assert_eq!(read["output"], "done\n");
    assert_eq!(read["command_completed"], true);
    assert_eq!(read["exit_code"], 0);
    assert!(read["output_path"]
        .as_str()
        .unwrap()
        .ends_with("later/000002-read.log"));

    let next = h.call(
        "shell_run",
        json!({"session_id": "later", "command": "echo again", "wait_ms": 3000}),
    );
    assert_eq!(next["success"], true);
    assert_eq!(next["output"], "again\n");
}

#[test]
fn read_returns_only_undelivered_output() {
    let h = Harness::new();
    h.call(
        "shell_run",
        json!({"session_id": "cursor", "command": "echo delivered", "wait_ms": 3000}),
    );
    h.call(
        "shell_write",
        json!({"session_id": "cursor", "input": "echo background"}),
    );

    let first = h.call("shell_read", json!({"session_id": "cursor", "wait_ms": 3000}));
    assert_eq!(first["output"], "background\n");
    assert!(first.get("command_completed").is_none());

    let second = h.call("shell_read", json!({"session_id": "cursor", "wait_ms": 3000}));
    assert_eq!(second["success"], true);
    assert_eq!(second["output"], "");
}

#[test]
fn stop_kills_child_processes() {
    let h = Harness::new();
    let run = h.call(
        "shell_run",
        json!({"session_id": "kids", "command": "sleep 60 & echo $!", "wait_ms": 3000}),
    );
    let child_pid: i32 = run["output"].as_str().unwrap().trim().parse().unwrap();

    let stop = h.call("shell_stop", json!({"session_id": "kids"}));
    assert_eq!(stop["success"], true);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut gone = false;
    while Instant::now() < deadline {
        if !process_running(child_pid) {
            gone = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(gone, "background child {child_pid} survived stop");

    let again = h.call("shell_stop", json!({"session_id": "kids"}));
    assert_eq!(again["status"], "stopped");
}

/// A reaped or zombie process counts as gone.
fn process_running(pid: i32) -> bool {
    // SAFETY: signal 0 only probes for existence
    if unsafe { libc::kill(pid, 0) } != 0 {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat.contains(") Z "),
        Err(_) => true,
    }
}

#[test]
fn start_revives_stopped_session_in_place() {
    let h = Harness::new();
    let start = h.call("shell_start", json!({"session_id": "phoenix"}));
    assert_eq!(start, json!({"success": true, "session_id": "phoenix", "status": "started"}));
    h.call("shell_stop", json!({"session_id": "phoenix"}));

    let revived = h.call("shell_start", json!({"session_id": "phoenix"}));
    assert_eq!(revived["status"], "started");
    let run = h.call(
        "shell_run",
        json!({"session_id": "phoenix", "command": "echo back", "wait_ms": 3000}),
    );
    assert_eq!(run["output"], "back\n");
}

#[test]
fn generated_session_id_is_returned() {
    let h = Harness::new();
    let result = h.call("shell_run", json!({"command": "echo anon", "wait_ms": 3000}));
    let id = result["session_id"].as_str().unwrap();
    assert!(uuid_like(id), "{id}");
    assert!(h.executor.registry().lookup(id).is_some());
}

fn uuid_like(id: &str) -> bool {
    id.len() == 36 && id.chars().filter(|c| *c == '-').count() == 4
}

#[test]
fn events_are_published_per_session() {
    let h = Harness::new();
    let mut rx = h.events.subscribe();
    h.call(
        "shell_run",
        json!({"session_id": "evt", "command": "echo event", "wait_ms": 3000}),
    );
    h.call("shell_stop", json!({"session_id": "evt"}));

    let mut saw_data = false;
    let mut saw_exit = false;
    while let Ok(event) = rx.try_recv() {
        if event.event_type == data_event("evt") {
            saw_data = true;
        }
        if event.event_type == exit_event("evt") {
            saw_exit = true;
        }
    }
    assert!(saw_data);
    assert!(saw_exit);
}

#[test]
fn status_lists_sessions() {
    let h = Harness::new();
    h.call(
        "shell_run",
        json!({"session_id": "st", "command": "echo s", "wait_ms": 3000}),
    );
    let statuses = h.executor.statuses();
    let sessions = statuses[0]["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["session_id"], "st");
    assert!(sessions[0]["pending_command"].is_null());
}
