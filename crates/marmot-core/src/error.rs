use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of space writing to '{0}'")]
    NoSpace(String),

    #[error("invalid hashfile: {0}")]
    InvalidHashfile(String),

    #[error("invalid listing stream: {0}")]
    InvalidListing(String),

    #[error("tree diff failed: {0}")]
    TreeDiff(String),

    #[error("a full backup is required before an incremental can run")]
    FullBackupRequired,

    #[error("snapshot operation failed: {0}")]
    Snapshot(String),

    #[error("client went offline: {0}")]
    ClientOffline(String),

    #[error("backup verification failed for '{0}'")]
    VerificationFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

impl BackupError {
    /// Errors that abort only the current file, not the run.
    ///
    /// The walker records the file as not-downloaded and keeps going so
    /// as much linkable state as possible is saved.
    pub fn is_file_local(&self) -> bool {
        matches!(self, BackupError::Io(_) | BackupError::NoSpace(_))
    }
}
