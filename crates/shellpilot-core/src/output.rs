//! Durable copies of invocation output and the inline size guard.
//!
//! Every `run` and `read` writes the complete bytes it collected to
//! `{output_dir}/{session_id}/{invocation:06}-{kind}.log`, whatever their
//! size. Only the response payload is subject to [`INLINE_LIMIT`]; callers
//! recover the rest from the file.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Maximum number of output bytes returned inline.
pub const INLINE_LIMIT: usize = 1024;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write output file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot resolve output directory: {0}")]
    Resolve(#[source] std::io::Error),
}

/// Which tool produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Run,
    Read,
}

impl InvocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationKind::Run => "run",
            InvocationKind::Read => "read",
        }
    }
}

/// Writes invocation output under a root directory.
#[derive(Debug, Clone)]
pub struct OutputPersister {
    root: PathBuf,
}

impl OutputPersister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path an invocation's artifact is written to.
    pub fn artifact_path(&self, session_id: &str, invocation: u64, kind: InvocationKind) -> PathBuf {
        self.root
            .join(session_id)
            .join(format!("{:06}-{}.log", invocation, kind.as_str()))
    }

    /// Write `data` and return the absolute path of the artifact.
    pub fn persist(
        &self,
        session_id: &str,
        invocation: u64,
        kind: InvocationKind,
        data: &[u8],
    ) -> Result<PathBuf, PersistError> {
        let path = self.artifact_path(session_id, invocation, kind);
        let path = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()
                .map_err(PersistError::Resolve)?
                .join(path)
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| PersistError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let temp_path = path.with_extension("log.tmp");
        fs::write(&temp_path, data)
            .and_then(|_| fs::rename(&temp_path, &path))
            .map_err(|source| PersistError::Write {
                path: path.clone(),
                source,
            })?;

        log::debug!("Persisted {} bytes to {}", data.len(), path.display());
        Ok(path)
    }
}

/// Whether `data` is too large to return inline.
pub fn exceeds_limit(data: &[u8]) -> bool {
    data.len() > INLINE_LIMIT
}

/// The last [`INLINE_LIMIT`] bytes of `data`.
pub fn tail(data: &[u8]) -> &[u8] {
    &data[data.len().saturating_sub(INLINE_LIMIT)..]
}

/// Render output bytes for a response.
pub fn render(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}
