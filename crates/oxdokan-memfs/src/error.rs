use std::io;
use std::path::PathBuf;

use oxdokan_core::{DokanError, MountError, NtStatus};
use thiserror::Error;

/// Errors from loading configuration or driving the demo workload.
#[derive(Debug, Error)]
pub enum MemFsError {
    #[error("Failed to read config {}: {source}", path.display())]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config {}: {source}", path.display())]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A driver call returned a failure status.
    #[error("{op} on {path} failed: {status}")]
    Request {
        op: &'static str,
        path: String,
        status: NtStatus,
    },

    #[error("Failed to add {path}: {source}")]
    Publish {
        path: String,
        #[source]
        source: DokanError,
    },

    /// The mounted session refused to announce a change.
    #[error(transparent)]
    Notify(#[from] MountError),

    #[error("Failed to spawn writer thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Writer {0} panicked")]
    WriterPanicked(usize),

    /// Read-back data did not match what was written.
    #[error("Content mismatch on {path}: expected {expected} bytes, got {actual}")]
    Mismatch {
        path: String,
        expected: usize,
        actual: usize,
    },
}

impl MemFsError {
    pub(crate) fn request(op: &'static str, path: &str) -> impl FnOnce(NtStatus) -> Self {
        let path = path.to_string();
        move |status| MemFsError::Request { op, path, status }
    }
}
