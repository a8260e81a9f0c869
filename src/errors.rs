use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Missing or malformed configuration. Raised before any I/O happens.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The external dump utility could not be started or exited non-zero.
    #[error("Capture failed: {message}")]
    Capture { message: String, stderr: String },

    /// I/O or randomness failure while producing an artifact.
    #[error("Encryption failed: {context}")]
    Encryption {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Tag verification failed or the artifact is structurally incomplete.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// I/O failure on the restore path (not an authentication failure).
    #[error("Restore failed: {context}")]
    Restore {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    pub fn encryption(context: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::Encryption {
            context: context.into(),
            source,
        }
    }

    pub fn restore(context: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::Restore {
            context: context.into(),
            source,
        }
    }

    pub fn capture(message: impl Into<String>) -> Self {
        BackupError::Capture {
            message: message.into(),
            stderr: String::new(),
        }
    }

    /// Stable name of the error kind, for operators and scripts.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Configuration(_) => "ConfigurationError",
            BackupError::Capture { .. } => "CaptureError",
            BackupError::Encryption { .. } => "EncryptionError",
            BackupError::Integrity(_) => "IntegrityError",
            BackupError::Restore { .. } => "RestoreError",
        }
    }
}

/// Non-fatal: the temporary dump outlived a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not delete temporary dump {}: {}",
            self.path.display(),
            self.reason
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_distinguishable() {
        let errors = [
            BackupError::Configuration("MONGO_URI missing".into()),
            BackupError::capture("exit status 1"),
            BackupError::encryption("disk full", std::io::Error::other("ENOSPC")),
            BackupError::Integrity("tag mismatch".into()),
            BackupError::restore("read failed", std::io::Error::other("EIO")),
        ];
        let mut kinds: Vec<&str> = errors.iter().map(BackupError::kind).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_cleanup_warning_display_names_the_path() {
        let warning = CleanupWarning {
            path: PathBuf::from("/backups/temp-dump-x.gz"),
            reason: "permission denied".into(),
        };
        let text = warning.to_string();
        assert!(text.contains("/backups/temp-dump-x.gz"));
        assert!(text.contains("permission denied"));
    }
}
