use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures raised while moving artifact bytes onto local storage.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("{url}: unexpected status {status}")]
    Status { url: String, status: u16 },

    #[error("{url}: request failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("archive {path:?}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("archive entry escapes destination: {0}")]
    UnsafeEntry(String),

    #[error("{url}: server resumed at byte {server_start}, local file has {local_len}")]
    ResumeMismatch {
        url: String,
        local_len: u64,
        server_start: u64,
    },

    #[error("size mismatch for {path:?}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("not enough free space: need {needed} bytes, {available} available")]
    InsufficientStorage { needed: u64, available: u64 },

    #[error("foreground registration refused: {0}")]
    Foreground(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("{0} has no remote source")]
    MissingSource(String),
}

impl DownloadError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Cancellation keeps partial bytes on disk and is not reported as a failure to the UI.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
