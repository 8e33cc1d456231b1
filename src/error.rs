use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("remote session unavailable: {0}")]
    Connection(String),

    #[error("metadata error in {path}: {message}")]
    Metadata { path: String, message: String },

    #[error("metadata header in {path} diverges from the configured columns (missing: {missing:?}, extra: {extra:?})")]
    MetadataColumns {
        path: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("integrity check failed for {0}")]
    Integrity(String),

    #[error("remote operation failed: {0}")]
    Remote(String),

    #[error("remote path does not exist: {0}")]
    RemoteNotFound(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("refusing to remove protected folder: {0}")]
    ProtectedFolder(String),

    #[error("missing config file seqbatch.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid lab code: {0}")]
    InvalidLabCode(String),
}

impl SyncError {
    /// Only a lost remote session aborts the whole run; everything else is
    /// scoped to one folder or one sample.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, SyncError::Connection(_))
    }

    pub fn metadata(path: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Metadata {
            path: path.into(),
            message: message.into(),
        }
    }
}
