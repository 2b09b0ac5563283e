//! Completion markers for commands sent to a shell.
//!
//! Shell output is an unframed byte stream, so `run` appends an echo of a
//! one-off token after the caller's command:
//!
//! ```text
//! <command>
//! echo "__SHELLPILOT_DONE_<32 alphanumerics>__:$?"; echo "__SHELLPILOT_DONE_<32 alphanumerics>__" >&2
//! ```
//!
//! When the shell reaches the echo it prints `__SHELLPILOT_DONE_<token>__:<status>`
//! on stdout and the bare sentinel on stderr. The two pipes are drained
//! independently, so only seeing both proves that everything the command
//! wrote to either stream is already in the log. [`MarkerScanner`] watches
//! log chunks as they arrive, assembles each stream into lines across chunk
//! boundaries, and recognises the marker lines even when the command's own
//! output did not end with a newline.

use std::sync::LazyLock;

use rand::{distributions::Alphanumeric, Rng};
use regex::bytes::Regex;

use crate::session::Stream;

pub const MARKER_PREFIX: &str = "__SHELLPILOT_DONE_";
const MARKER_SUFFIX: &str = "__";
const TOKEN_LEN: usize = 32;

static MARKER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__SHELLPILOT_DONE_([A-Za-z0-9]{32})__:(\d+)\r?\n").unwrap()
});

static STDERR_MARKER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__SHELLPILOT_DONE_([A-Za-z0-9]{32})__\r?\n").unwrap());

/// A per-invocation completion sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    token: String,
}

impl Marker {
    /// Generate a fresh marker with a random alphanumeric token.
    pub fn generate() -> Self {
        let token = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        Self { token }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// The sentinel text without the exit status.
    pub fn text(&self) -> String {
        format!("{MARKER_PREFIX}{}{MARKER_SUFFIX}", self.token)
    }

    /// Shell line that prints the sentinel with the last exit status on
    /// stdout, then the bare sentinel on stderr.
    ///
    /// The token is alphanumeric, so neither quoting nor expansion can
    /// change it; only `$?` is expanded.
    pub fn echo_line(&self) -> String {
        let text = self.text();
        format!("echo \"{text}:$?\"; echo \"{text}\" >&2\n")
    }
}

/// Why a `run` wait stopped collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    MarkerFound,
    Timeout,
    /// The shell itself ended before printing the marker
    ProcessExited,
}

/// A marker line observed in output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerHit {
    pub token: String,
    pub exit_code: i32,
}

/// Result of scanning a sequence of log chunks.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Output with every marker line removed
    pub content: Vec<u8>,
    /// The expected marker, if it was seen
    pub hit: Option<MarkerHit>,
    /// Markers of other invocations seen along the way
    pub stale: Vec<MarkerHit>,
}

/// Incremental matcher over log chunks.
///
/// Each stream is held one line at a time so that a marker split across
/// chunks is still recognised; a line that carries no marker is released
/// into the content when its newline arrives, or by [`MarkerScanner::finish`].
#[derive(Debug)]
pub struct MarkerScanner {
    expected: Option<String>,
    stop_on_hit: bool,
    stdout_line: Vec<u8>,
    stderr_line: Vec<u8>,
    stderr_seen: bool,
    outcome: ScanOutcome,
}

impl MarkerScanner {
    /// Scan for `expected` and stop consuming each stream once its half of
    /// the marker is seen.
    pub fn new(expected: Option<&Marker>) -> Self {
        Self {
            expected: expected.map(|m| m.token.clone()),
            stop_on_hit: true,
            stdout_line: Vec::new(),
            stderr_line: Vec::new(),
            stderr_seen: false,
            outcome: ScanOutcome::default(),
        }
    }

    /// Strip marker lines (recording a hit on `expected`) but keep
    /// collecting whatever follows them.
    pub fn passthrough(expected: Option<&Marker>) -> Self {
        Self {
            stop_on_hit: false,
            ..Self::new(expected)
        }
    }

    /// Whether the expected stdout marker, and with it the exit status,
    /// has been seen.
    pub fn found(&self) -> bool {
        self.outcome.hit.is_some()
    }

    /// Whether both halves of the expected marker have been seen.
    pub fn complete(&self) -> bool {
        self.found() && self.stderr_seen
    }

    /// Whether an unterminated line is being held on either stream.
    pub fn holds_partial(&self) -> bool {
        !self.stdout_line.is_empty() || !self.stderr_line.is_empty()
    }

    /// Whether a held line could be the start of a marker line.
    pub fn holds_marker_fragment(&self) -> bool {
        may_start_marker(&self.stdout_line) || may_start_marker(&self.stderr_line)
    }

    /// Feed one chunk. Returns true once both halves of the expected
    /// marker are seen and the scanner stops; everything after them is
    /// ignored.
    pub fn feed(&mut self, stream: Stream, data: &[u8]) -> bool {
        if !(self.stop_on_hit && self.seen(stream)) {
            let mut rest = data;
            while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
                self.line_mut(stream).extend_from_slice(&rest[..=pos]);
                rest = &rest[pos + 1..];
                self.complete_line(stream);
                if self.stop_on_hit && self.seen(stream) {
                    rest = &[];
                    break;
                }
            }
            self.line_mut(stream).extend_from_slice(rest);
        }
        self.stop_on_hit && self.complete()
    }

    fn seen(&self, stream: Stream) -> bool {
        match stream {
            Stream::Stdout => self.found(),
            Stream::Stderr => self.stderr_seen,
        }
    }

    fn line_mut(&mut self, stream: Stream) -> &mut Vec<u8> {
        match stream {
            Stream::Stdout => &mut self.stdout_line,
            Stream::Stderr => &mut self.stderr_line,
        }
    }

    fn complete_line(&mut self, stream: Stream) {
        let line = std::mem::take(self.line_mut(stream));
        let pattern = match stream {
            Stream::Stdout => &MARKER_LINE,
            Stream::Stderr => &STDERR_MARKER_LINE,
        };

        let mut start = 0;
        for caps in pattern.captures_iter(&line) {
            let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
            self.outcome
                .content
                .extend_from_slice(&line[start..whole.start]);
            start = whole.end;

            let token = caps
                .get(1)
                .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
                .unwrap_or_default();
            let expected = self.expected.as_deref() == Some(token.as_str());
            match stream {
                Stream::Stdout if expected => {
                    self.outcome.hit = Some(MarkerHit {
                        token,
                        exit_code: parse_status(&caps),
                    });
                }
                Stream::Stdout => {
                    log::debug!("Stripped stale marker {}", token);
                    self.outcome.stale.push(MarkerHit {
                        token,
                        exit_code: parse_status(&caps),
                    });
                }
                Stream::Stderr if expected => self.stderr_seen = true,
                Stream::Stderr => {}
            }
            if expected && self.stop_on_hit {
                return;
            }
        }
        self.outcome.content.extend_from_slice(&line[start..]);
    }

    /// Release any held partial lines and return the outcome.
    pub fn finish(mut self) -> ScanOutcome {
        for stream in [Stream::Stdout, Stream::Stderr] {
            if !(self.stop_on_hit && self.seen(stream)) {
                let line = std::mem::take(self.line_mut(stream));
                self.outcome.content.extend_from_slice(&line);
            }
        }
        self.outcome
    }
}

fn parse_status(caps: &regex::bytes::Captures<'_>) -> i32 {
    caps.get(2)
        .and_then(|m| std::str::from_utf8(m.as_bytes()).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(-1)
}

/// Whether `line` contains the marker prefix or ends with a piece of it.
fn may_start_marker(line: &[u8]) -> bool {
    let prefix = MARKER_PREFIX.as_bytes();
    line.windows(prefix.len()).any(|w| w == prefix)
        || (2..prefix.len()).any(|n| line.ends_with(&prefix[..n]))
}
