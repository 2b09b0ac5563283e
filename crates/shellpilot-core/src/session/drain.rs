//! Background threads that keep a session's pipes drained.
//!
//! Each process gets one reader per output pipe plus an exit watcher. The
//! readers run whether or not any tool call is waiting, so a chatty process
//! never blocks on a full pipe.

use std::io::Read;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::log::Stream;
use super::state::ShellSession;
use super::lock;
use crate::shell::ShellExit;

const READ_BUF_SIZE: usize = 4096;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long the exit watcher lets readers flush the last output.
const READER_FLUSH_WAIT: Duration = Duration::from_millis(500);

/// Start the readers and exit watcher for process `generation`.
pub(crate) fn start<O, E>(session: Arc<ShellSession>, generation: u64, stdout: O, stderr: E)
where
    O: Read + Send + 'static,
    E: Read + Send + 'static,
{
    let readers = vec![
        spawn_reader(Arc::clone(&session), Stream::Stdout, stdout),
        spawn_reader(Arc::clone(&session), Stream::Stderr, stderr),
    ];

    thread::spawn(move || watch_exit(session, generation, readers));
}

fn spawn_reader<R>(session: Arc<ShellSession>, stream: Stream, mut pipe: R) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => session.record_output(stream, buf[..n].to_vec()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Read error on {} of session {}: {}", stream, session.id(), e);
                    break;
                }
            }
        }
        log::debug!("{} reader for session {} finished", stream, session.id());
    })
}

fn watch_exit(session: Arc<ShellSession>, generation: u64, readers: Vec<JoinHandle<()>>) {
    let exit = loop {
        thread::sleep(EXIT_POLL_INTERVAL);
        if session.generation() != generation {
            return;
        }

        let mut guard = lock(session.child());
        let Some(child) = guard.as_mut() else {
            // stop() took the child and records the exit itself
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                guard.take();
                break ShellExit::from_status(status);
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("Failed to poll session {}: {}", session.id(), e);
                guard.take();
                break ShellExit {
                    code: None,
                    signal: None,
                };
            }
        }
    };

    // Background jobs may still hold the pipes open, so don't wait forever.
    let deadline = Instant::now() + READER_FLUSH_WAIT;
    while Instant::now() < deadline && !readers.iter().all(JoinHandle::is_finished) {
        thread::sleep(Duration::from_millis(10));
    }

    session.record_exit(generation, exit);
}
