//! Per-session state: the shell process, its stdin, and its output log.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::drain;
use super::log::{LogEntry, OutputLog, Stream};
use super::{lock, SessionError};
use crate::config::ShellSettings;
use crate::event_bus::EventBus;
use crate::logging::{log_line, open_log_file, LogHandle};
use crate::marker::{EndReason, Marker, MarkerHit, MarkerScanner, ScanOutcome};
use crate::shell::{build_shell_command, ShellExit};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long the stderr half of a marker may trail the stdout half.
const STDERR_SETTLE: Duration = Duration::from_millis(500);
/// A trailing marker fragment younger than this is held for the next scan.
const FRAGMENT_HOLD_MS: i64 = 500;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A command written by `run` whose marker has not been seen yet.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub marker: Marker,
    pub command: String,
    /// Log index from which the marker can appear
    pub since: usize,
}

/// Output gathered by a `run` wait.
#[derive(Debug)]
pub struct MarkerWait {
    pub outcome: ScanOutcome,
    pub end_reason: EndReason,
}

/// Read-only view of a session for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub alive: bool,
    pub pid: Option<u32>,
    pub working_dir: String,
    pub busy: bool,
    pub pending_command: Option<String>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub log: Vec<LogEntry>,
}

/// Holds the busy flag for the duration of one `run` wait.
pub struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// One long-lived shell process plus everything observed from it.
///
/// Shared as `Arc<ShellSession>` between the registry, tool handlers, and
/// the session's drain threads.
pub struct ShellSession {
    id: SessionId,
    working_dir: Mutex<PathBuf>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pid: Mutex<Option<u32>>,
    alive: AtomicBool,
    busy: AtomicBool,
    /// Bumped on every (re)spawn so threads of an old process stand down
    generation: AtomicU64,
    exit: Mutex<Option<ShellExit>>,
    log: OutputLog,
    delivered: AtomicUsize,
    pending: Mutex<Option<PendingCommand>>,
    invocations: AtomicU64,
    transcript: LogHandle,
    events: Arc<EventBus>,
}

impl ShellSession {
    /// Spawn a shell rooted at `working_dir` and start its drain loop.
    pub(crate) fn spawn(
        id: SessionId,
        working_dir: PathBuf,
        settings: &ShellSettings,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>, SessionError> {
        let transcript = open_log_file(settings.transcript_dir.as_deref(), id.as_str());
        let session = Arc::new(Self {
            id,
            working_dir: Mutex::new(working_dir),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            pid: Mutex::new(None),
            alive: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            exit: Mutex::new(None),
            log: OutputLog::new(),
            delivered: AtomicUsize::new(0),
            pending: Mutex::new(None),
            invocations: AtomicU64::new(0),
            transcript,
            events,
        });
        session.launch(settings)?;
        Ok(session)
    }

    /// Start a new process for a session whose previous one has ended.
    ///
    /// The id and log are kept; the log simply continues.
    pub(crate) fn respawn(
        self: &Arc<Self>,
        working_dir: Option<PathBuf>,
        settings: &ShellSettings,
    ) -> Result<(), SessionError> {
        if let Some(dir) = working_dir {
            *lock(&self.working_dir) = dir;
        }
        *lock(&self.pending) = None;
        self.launch(settings)
    }

    fn launch(self: &Arc<Self>, settings: &ShellSettings) -> Result<(), SessionError> {
        let dir = self.working_dir();
        let mut cmd = build_shell_command(settings, Some(&dir)).map_err(SessionError::Spawn)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            SessionError::Spawn(format!(
                "Failed to spawn shell in {}: {}",
                dir.display(),
                e
            ))
        })?;

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SessionError::Spawn(
                        "Failed to capture shell stdio".to_string(),
                    ));
                }
            };

        let pid = child.id();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *lock(&self.child) = Some(child);
        *lock(&self.stdin) = Some(stdin);
        *lock(&self.pid) = Some(pid);
        *lock(&self.exit) = None;
        self.alive.store(true, Ordering::Release);

        drain::start(Arc::clone(self), generation, stdout, stderr);

        log::info!(
            "Shell session {} started (pid {}, cwd {})",
            self.id,
            pid,
            dir.display()
        );
        Ok(())
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn working_dir(&self) -> PathBuf {
        lock(&self.working_dir).clone()
    }

    pub fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Exit status of the most recent process, once it has ended.
    pub fn exit(&self) -> Option<ShellExit> {
        lock(&self.exit).clone()
    }

    pub fn log(&self) -> &OutputLog {
        &self.log
    }

    pub fn pending_command(&self) -> Option<String> {
        lock(&self.pending).as_ref().map(|p| p.command.clone())
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn child(&self) -> &Mutex<Option<Child>> {
        &self.child
    }

    /// Number the next `run`/`read` invocation on this session (1-based).
    pub fn next_invocation(&self) -> u64 {
        self.invocations.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Index of the first log entry not yet handed to a caller.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Acquire)
    }

    fn mark_delivered(&self, upto: usize) {
        self.delivered.fetch_max(upto, Ordering::AcqRel);
    }

    /// Try to take the busy flag without waiting.
    pub fn try_acquire_busy(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard { flag: &self.busy })
    }

    /// Write raw bytes to the shell's stdin.
    pub fn write_stdin(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::NotAlive(self.id.clone()));
        }

        let mut guard = lock(&self.stdin);
        let stdin = guard
            .as_mut()
            .ok_or_else(|| SessionError::NotAlive(self.id.clone()))?;

        let result = stdin.write_all(data).and_then(|_| stdin.flush());
        if let Err(e) = result {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                // the shell is gone; the exit watcher records the status
                guard.take();
                self.alive.store(false, Ordering::Release);
            }
            return Err(SessionError::Write {
                session_id: self.id.clone(),
                source: e,
            });
        }
        drop(guard);

        log_line(&self.transcript, "STDIN", data);
        Ok(())
    }

    /// Record a chunk read by the drain loop.
    pub(crate) fn record_output(&self, stream: Stream, data: Vec<u8>) {
        log::debug!("shell {} [{}]: {} bytes", self.id, stream, data.len());
        log_line(&self.transcript, stream.tag(), &data);
        self.events.emit_data(self.id.as_str(), stream, &data);
        self.log.append(stream, data);
    }

    /// Record the end of the process started as `generation`.
    pub(crate) fn record_exit(&self, generation: u64, exit: ShellExit) {
        if generation != self.generation() {
            return;
        }
        *lock(&self.exit) = Some(exit.clone());
        *lock(&self.pid) = None;
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        self.log.notify();
        lock(&self.stdin).take();

        if was_alive {
            log::info!(
                "Shell session {} exited (code {:?}, signal {:?})",
                self.id,
                exit.code,
                exit.signal
            );
            log_line(
                &self.transcript,
                "EXIT",
                format!("code={:?} signal={:?}", exit.code, exit.signal).as_bytes(),
            );
            self.events.emit_exit(self.id.as_str(), &exit);
        }
    }

    /// Follow the log from `cursor` until `marker` appears, `deadline`
    /// passes, or the shell exits.
    ///
    /// The marker counts once both its stdout and stderr halves are in;
    /// if the stderr half never comes (the command closed stderr) the
    /// stdout half alone ends the wait after a short settle period. On
    /// timeout the held-back partial lines are released into the content
    /// unless they may be the start of a marker.
    pub fn wait_for_marker(
        &self,
        marker: &Marker,
        cursor: usize,
        deadline: Instant,
    ) -> MarkerWait {
        let start = cursor;
        let mut cursor = cursor;
        let mut scanner = MarkerScanner::new(Some(marker));
        let mut settle_by: Option<Instant> = None;
        let mut exited = false;

        let end_reason = 'wait: loop {
            for entry in self.log.entries_from(cursor) {
                cursor += 1;
                if scanner.feed(entry.stream, &entry.data) {
                    break 'wait EndReason::MarkerFound;
                }
            }
            if exited {
                break if scanner.found() {
                    EndReason::MarkerFound
                } else {
                    EndReason::ProcessExited
                };
            }

            let until = if scanner.found() {
                deadline.min(*settle_by.get_or_insert_with(|| Instant::now() + STDERR_SETTLE))
            } else {
                deadline
            };
            if !self.log.wait_past(cursor, until, || self.is_alive()) {
                if !self.is_alive() {
                    // one more pass for output flushed just before the exit
                    exited = true;
                    continue;
                }
                break if scanner.found() {
                    EndReason::MarkerFound
                } else {
                    EndReason::Timeout
                };
            }
        };

        let outcome = if end_reason == EndReason::Timeout {
            let entries = self.log.entries_from(start);
            let (outcome, settled) = scan_settled(&entries[..cursor - start], || {
                MarkerScanner::new(Some(marker))
            });
            self.mark_delivered(start + settled);
            outcome
        } else {
            self.mark_delivered(cursor);
            scanner.finish()
        };

        if let Some(hit) = &outcome.hit {
            self.resolve_hits(std::slice::from_ref(hit));
        }
        self.resolve_hits(&outcome.stale);
        if end_reason == EndReason::ProcessExited {
            self.forget_pending(marker);
        }
        MarkerWait {
            outcome,
            end_reason,
        }
    }

    /// Collect everything not yet delivered to a caller.
    ///
    /// Marker lines are stripped; seeing the pending command's marker
    /// resolves it and reports its exit status in the outcome's `hit`. A
    /// freshly written partial line that may be a marker is left for the
    /// next call.
    pub fn take_undelivered(&self) -> ScanOutcome {
        let start = self.delivered();
        let entries = self.log.entries_from(start);
        let pending = lock(&self.pending).as_ref().map(|p| p.marker.clone());

        let (outcome, settled) =
            scan_settled(&entries, || MarkerScanner::passthrough(pending.as_ref()));
        self.mark_delivered(start + settled);

        if let Some(hit) = &outcome.hit {
            self.resolve_hits(std::slice::from_ref(hit));
        }
        self.resolve_hits(&outcome.stale);
        outcome
    }

    /// Track the command a `run` has just written.
    ///
    /// Cleared when its marker is observed; a `run` that times out leaves it
    /// in place so later runs are refused until the command finishes.
    pub(crate) fn set_pending(&self, pending: PendingCommand) {
        *lock(&self.pending) = Some(pending);
    }

    /// Whether the session is free of an outstanding timed-out command.
    ///
    /// Looks for the pending marker in the log first, so a command that
    /// has finished in the meantime no longer blocks.
    pub fn resolve_pending(&self) -> bool {
        let mut guard = lock(&self.pending);
        let Some(pending) = guard.as_ref() else {
            return true;
        };

        let mut scanner = MarkerScanner::new(Some(&pending.marker));
        for entry in self.log.entries_from(pending.since) {
            if scanner.feed(entry.stream, &entry.data) {
                break;
            }
        }
        if scanner.found() {
            // the exit status is in; a missing stderr half must not block
            log::debug!("Pending command on {} has completed", self.id);
            guard.take();
            true
        } else {
            false
        }
    }

    fn forget_pending(&self, marker: &Marker) {
        let mut guard = lock(&self.pending);
        if guard.as_ref().is_some_and(|p| p.marker == *marker) {
            guard.take();
        }
    }

    /// Clear the pending command if one of `hits` is its marker.
    fn resolve_hits(&self, hits: &[MarkerHit]) {
        if hits.is_empty() {
            return;
        }
        let mut guard = lock(&self.pending);
        let resolved = guard
            .as_ref()
            .is_some_and(|p| hits.iter().any(|h| h.token == p.marker.token()));
        if resolved {
            guard.take();
        }
    }

    /// Terminate the process and everything in its process group.
    ///
    /// Sends SIGTERM, waits up to `grace`, then SIGKILL. No-op when the
    /// process has already been reaped.
    pub fn stop(&self, grace: Duration) {
        let child = lock(&self.child).take();
        let generation = self.generation();

        // A writer blocked on a full pipe holds the stdin lock until the
        // shell dies, so signal before touching it.
        let exit = match child {
            Some(mut child) => terminate(&mut child, grace),
            None => self.exit().unwrap_or(ShellExit {
                code: None,
                signal: None,
            }),
        };
        lock(&self.stdin).take();

        *lock(&self.pending) = None;
        self.record_exit(generation, exit);
        log::info!("Shell session {} stopped", self.id);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let exit = self.exit();
        SessionSnapshot {
            session_id: self.id.0.clone(),
            alive: self.is_alive(),
            pid: self.pid(),
            working_dir: self.working_dir().display().to_string(),
            busy: self.is_busy(),
            pending_command: self.pending_command(),
            exit_code: exit.as_ref().and_then(|e| e.code),
            exit_signal: exit.and_then(|e| e.signal),
            log: self.log.snapshot(),
        }
    }
}

fn terminate(child: &mut Child, grace: Duration) -> ShellExit {
    #[cfg(unix)]
    {
        let pgid = child.id() as libc::pid_t;
        // SAFETY: signalling a process group we created; failure is harmless
        unsafe {
            libc::killpg(pgid, libc::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    // reach stragglers that ignored SIGTERM
                    unsafe {
                        libc::killpg(pgid, libc::SIGKILL);
                    }
                    return ShellExit::from_status(status);
                }
                Ok(None) => thread::sleep(STOP_POLL_INTERVAL),
                Err(_) => break,
            }
        }

        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill();
    match child.wait() {
        Ok(status) => ShellExit::from_status(status),
        Err(e) => {
            log::warn!("Failed to reap shell process: {}", e);
            ShellExit {
                code: None,
                signal: None,
            }
        }
    }
}

/// Scan `entries`, returning the outcome and how many entries it covers.
///
/// When the scan ends inside a recently written line that may be a marker,
/// it is cut back to the last entry boundary with no partial line pending,
/// so the next scan sees the marker whole.
fn scan_settled(
    entries: &[LogEntry],
    new_scanner: impl Fn() -> MarkerScanner,
) -> (ScanOutcome, usize) {
    let mut scanner = new_scanner();
    let mut settled = 0;
    for (i, entry) in entries.iter().enumerate() {
        scanner.feed(entry.stream, &entry.data);
        if !scanner.holds_partial() {
            settled = i + 1;
        }
    }

    let recent = entries.last().is_some_and(|entry| {
        Utc::now() - entry.timestamp < chrono::Duration::milliseconds(FRAGMENT_HOLD_MS)
    });
    if !(recent && scanner.holds_marker_fragment()) {
        return (scanner.finish(), entries.len());
    }

    let mut scanner = new_scanner();
    for entry in &entries[..settled] {
        scanner.feed(entry.stream, &entry.data);
    }
    (scanner.finish(), settled)
}

/// Resolve the directory a new session starts in.
pub(crate) fn resolve_working_dir(working_dir: Option<&str>) -> Result<PathBuf, SessionError> {
    let dir = match working_dir.filter(|d| !d.trim().is_empty()) {
        Some(dir) => crate::paths::expand_home(dir).map_err(SessionError::WorkingDir)?,
        None => std::env::current_dir()
            .map_err(|e| SessionError::WorkingDir(format!("Cannot read current directory: {e}")))?,
    };
    if !Path::new(&dir).is_dir() {
        return Err(SessionError::WorkingDir(format!(
            "Not a directory: {}",
            dir.display()
        )));
    }
    Ok(dir)
}
