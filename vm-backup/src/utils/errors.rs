//! Error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote {remote} unavailable: {message}")]
    RemoteUnavailable { remote: String, message: String },

    #[error("Unsupported remote type: {0}")]
    UnsupportedRemote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid remote path: {0}")]
    InvalidPath(String),

    #[error("Validation of {path} failed: {reason}")]
    Validation { path: String, reason: String },

    #[error("Invalid disk image: {0}")]
    InvalidImage(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("{} of {attempted} deletions failed: {}", failed.len(), errors.join("; "))]
    PartialDeletion {
        attempted: usize,
        failed: Vec<String>,
        errors: Vec<String>,
    },

    #[error("Chain merge error: {0}")]
    ChainMerge(String),

    #[error("Unknown VDI: {0}")]
    UnknownVdi(String),
}

impl BackupError {
    /// True when the error means the target file or object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            BackupError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            BackupError::ObjectStore(object_store::Error::NotFound { .. }) => true,
            _ => false,
        }
    }

    pub fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        BackupError::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let io = BackupError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(io.is_not_found());

        let store = BackupError::ObjectStore(object_store::Error::NotFound {
            path: "a/b".into(),
            source: "missing".into(),
        });
        assert!(store.is_not_found());

        let denied = BackupError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!denied.is_not_found());
    }

    #[test]
    fn test_partial_deletion_message() {
        let err = BackupError::PartialDeletion {
            attempted: 3,
            failed: vec!["a.json".into()],
            errors: vec!["a.json: permission denied".into()],
        };
        assert_eq!(err.to_string(), "1 of 3 deletions failed: a.json: permission denied");
    }
}
