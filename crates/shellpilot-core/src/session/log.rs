//! Append-only output log of a session.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }

    /// Direction tag used in transcripts.
    pub fn tag(&self) -> &'static str {
        match self {
            Stream::Stdout => "STDOUT",
            Stream::Stderr => "STDERR",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chunk read from the process.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub stream: Stream,
    #[serde(serialize_with = "serialize_lossy")]
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

fn serialize_lossy<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(data))
}

/// Ordered, append-only sequence of output chunks.
///
/// Written by the drain loop only; any number of tool handlers read slices
/// of it by index and block on [`OutputLog::wait_past`] for new entries.
#[derive(Debug, Default)]
pub struct OutputLog {
    entries: Mutex<Vec<LogEntry>>,
    changed: Condvar,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a chunk and wake every waiter. Returns the new length.
    pub fn append(&self, stream: Stream, data: Vec<u8>) -> usize {
        let mut entries = self.lock();
        entries.push(LogEntry {
            stream,
            data,
            timestamp: Utc::now(),
        });
        let len = entries.len();
        drop(entries);
        self.changed.notify_all();
        len
    }

    /// Wake waiters without appending (e.g. when the process exits).
    ///
    /// Taking the lock first orders this after any waiter's last check.
    pub fn notify(&self) {
        drop(self.lock());
        self.changed.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone the entries at and after `cursor`.
    pub fn entries_from(&self, cursor: usize) -> Vec<LogEntry> {
        let entries = self.lock();
        entries.get(cursor..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Clone the whole log.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    /// Block until the log holds more than `cursor` entries, `deadline`
    /// passes, or `active` turns false (checked on every wake-up, so its
    /// state change must be followed by [`OutputLog::notify`]). Returns
    /// whether new entries are available.
    pub fn wait_past(&self, cursor: usize, deadline: Instant, active: impl Fn() -> bool) -> bool {
        let mut entries = self.lock();
        loop {
            if entries.len() > cursor {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || !active() {
                return false;
            }
            entries = match self.changed.wait_timeout(entries, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn stream_names() {
        assert_eq!(Stream::Stdout.to_string(), "stdout");
        assert_eq!(Stream::Stderr.tag(), "STDERR");
        assert_eq!(serde_json::to_value(Stream::Stderr).unwrap(), "stderr");
    }

    #[test]
    fn append_preserves_order() {
        let log = OutputLog::new();
        assert!(log.is_empty());
        log.append(Stream::Stdout, b"one".to_vec());
        log.append(Stream::Stderr, b"two".to_vec());
        assert_eq!(log.append(Stream::Stdout, b"three".to_vec()), 3);

        let entries = log.snapshot();
        let data: Vec<&[u8]> = entries.iter().map(|e| e.data.as_slice()).collect();
        assert_eq!(data, vec![&b"one"[..], &b"two"[..], &b"three"[..]]);
        assert_eq!(entries[1].stream, Stream::Stderr);
        assert!(entries[0].timestamp <= entries[2].timestamp);
    }

    #[test]
    fn entries_from_slices_by_cursor() {
        let log = OutputLog::new();
        log.append(Stream::Stdout, b"a".to_vec());
        log.append(Stream::Stdout, b"b".to_vec());

        assert_eq!(log.entries_from(1).len(), 1);
        assert!(log.entries_from(2).is_empty());
        assert!(log.entries_from(10).is_empty());
    }

    #[test]
    fn entry_serializes_data_as_text() {
        let log = OutputLog::new();
        log.append(Stream::Stdout, b"hi\n".to_vec());
        let value = serde_json::to_value(&log.snapshot()[0]).unwrap();
        assert_eq!(value["stream"], "stdout");
        assert_eq!(value["data"], "hi\n");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn wait_past_times_out_without_entries() {
        let log = OutputLog::new();
        let start = Instant::now();
        assert!(!log.wait_past(0, start + Duration::from_millis(50), || true));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_past_wakes_on_append() {
        let log = Arc::new(OutputLog::new());
        let writer = Arc::clone(&log);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.append(Stream::Stdout, b"x".to_vec());
        });

        let start = Instant::now();
        assert!(log.wait_past(0, start + Duration::from_secs(5), || true));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn wait_past_returns_when_no_longer_active() {
        let log = Arc::new(OutputLog::new());
        let open = Arc::new(AtomicBool::new(true));

        let closer = {
            let (log, open) = (Arc::clone(&log), Arc::clone(&open));
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                open.store(false, Ordering::Release);
                log.notify();
            })
        };

        let start = Instant::now();
        assert!(!log.wait_past(0, start + Duration::from_secs(10), || {
            open.load(Ordering::Acquire)
        }));
        assert!(start.elapsed() < Duration::from_secs(5));
        closer.join().unwrap();
    }
}
