//! Engine error types
//!
//! "Already running" conditions are reported as `false` results, not errors.

/// Errors surfaced by the backup manager and cache registry
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Snapshot, folder or remote credential does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A persisted snapshot failed to decode
    #[error("Malformed snapshot {0}: {1}")]
    Malformed(String, String),

    /// The provider reported a failure mid-download
    #[error("Transfer failed for {0}: {1}")]
    TransferFailed(String, String),

    /// Failure inside a remote or storage collaborator
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl BackupError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackupError::NotFound(_))
    }
}
