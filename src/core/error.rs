/// Typed failure taxonomy for backup and restore operations
///
/// Adapters report `anyhow` errors; the orchestrating components decide
/// whether a failure is soft or hard and translate hard ones into `OpsError`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpsError {
    #[error("Preflight failed: {}", .0.join("; "))]
    PreflightFailure(Vec<String>),

    #[error("Database backup failed after {attempts} attempt(s): {reason}")]
    DatabaseBackupFailure { attempts: u32, reason: String },

    #[error("Archive creation failed: {0}")]
    ArchiveCreationFailure(String),

    #[error("Integrity check failed for {}: {reason}", path.display())]
    IntegrityFailure { path: PathBuf, reason: String },

    #[error("Encryption failed: {0}")]
    EncryptionFailure(String),

    #[error("Encryption key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Restore validation failed: {0}")]
    RestoreValidationFailure(String),

    #[error("Atomic swap failed: {0}")]
    AtomicSwapFailure(String),

    #[error("Service start failed: {0}")]
    ServiceStartFailure(String),

    #[error("Rollback failed, manual intervention required: {0}")]
    RollbackFailure(String),

    #[error("Another backup or restore is already running for {}", .0.display())]
    AlreadyInProgress(PathBuf),

    #[error("Stale rollback snapshot found at {} (left by an interrupted restore); inspect it and remove it manually", .0.display())]
    StaleSnapshot(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OpsError {
    pub fn integrity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        OpsError::IntegrityFailure {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Process exit status for this failure category
    pub fn exit_code(&self) -> u8 {
        match self {
            OpsError::Config(_) => 2,
            OpsError::PreflightFailure(_) => 10,
            OpsError::DatabaseBackupFailure { .. } => 11,
            OpsError::ArchiveCreationFailure(_) => 12,
            OpsError::IntegrityFailure { .. } => 13,
            OpsError::EncryptionFailure(_) => 14,
            OpsError::KeyUnavailable(_) => 15,
            OpsError::AlreadyInProgress(_) => 16,
            OpsError::StaleSnapshot(_) => 17,
            OpsError::RestoreValidationFailure(_)
            | OpsError::AtomicSwapFailure(_)
            | OpsError::ServiceStartFailure(_) => 20,
            OpsError::RollbackFailure(_) => 30,
            OpsError::Io(_) => 1,
        }
    }
}

pub type OpsResult<T> = std::result::Result<T, OpsError>;
