//! Error types for every component of the core.
//!
//! Each component owns one enum. Failures inside tasks are converted into
//! these values at the task boundary and never unwind past it.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Hardware probing failed. Always recovered by falling back to the
/// conservative profile.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("total memory reported as zero")]
    NoMemoryInfo,

    #[error("core count unavailable: {0}")]
    NoCoreInfo(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("unknown performance profile '{0}'")]
    UnknownProfile(String),
}

/// Outcome of a task that did not produce a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task was cancelled before it started")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to build worker pool: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to spawn dispatcher thread: {0}")]
    Dispatcher(#[source] io::Error),

    #[error("executor has been shut down")]
    ShutDown,
}

/// A single file could not be turned into a bitmap.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unsupported file type: {0}")]
    Unsupported(PathBuf),

    #[error("no embedded preview found in {0}")]
    NoEmbeddedPreview(PathBuf),

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("RAW decode failed: {0}")]
    Raw(String),

    #[error("decoder pool rejected {path}: {reason}")]
    Pool { path: PathBuf, reason: String },

    #[error("decoder panicked on {0}")]
    Panicked(PathBuf),
}

/// Decoder pool plumbing failures (spawning, handshake, wire protocol).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn decoder worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("decoder worker failed to initialise: {0}")]
    Init(String),

    #[error("decoder worker i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed decoder message: {0}")]
    Protocol(String),

    /// The request itself cannot be put on the wire. Only that task fails.
    #[error("cannot encode decoder request: {0}")]
    Encode(String),

    #[error("decoder worker closed its channel")]
    Disconnected,
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::Protocol(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("index {index} is outside the file list ({len} files)")]
    IndexOutOfRange { index: usize, len: usize },
}
