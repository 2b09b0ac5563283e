//! Per-session transcript files.
//!
//! When a transcript directory is configured, every byte written to a shell
//! and every chunk read back is appended to `{dir}/{session_id}.log` with a
//! timestamp and direction tag.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};

/// Thread-safe handle to an append-only transcript file.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// Current UTC time as ISO 8601 with milliseconds (e.g. 2026-02-04T10:15:30.123Z).
fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Write a timestamped entry to the transcript (if present).
///
/// Each line of `data` becomes its own record so multi-line chunks stay
/// readable.
pub fn log_line(handle: &LogHandle, direction: &str, data: &[u8]) {
    let mut guard = match handle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(ref mut file) = *guard {
        let ts = utc_timestamp();
        let text = String::from_utf8_lossy(data);
        for line in text.trim_end_matches('\n').split('\n') {
            let _ = writeln!(file, "[{}] {}: {}", ts, direction, line);
        }
        let _ = file.flush();
    }
}

/// Open (or create) `{log_dir}/{log_id}.log` and return a shared handle.
///
/// Returns an empty handle when no directory is configured or the file
/// cannot be opened; transcripts are best-effort.
pub fn open_log_file(log_dir: Option<&Path>, log_id: &str) -> LogHandle {
    let file = log_dir.and_then(|dir| {
        let path = dir.join(format!("{}.log", log_id));
        if let Err(e) = std::fs::create_dir_all(dir) {
            log::warn!("Failed to create transcript dir {}: {}", dir.display(), e);
            return None;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| log::warn!("Failed to open transcript {}: {}", path.display(), e))
            .ok()
    });
    Arc::new(Mutex::new(file))
}
