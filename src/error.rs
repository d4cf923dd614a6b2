//! Error handling module for the safety engine
//!
//! Provides centralized error handling with proper error types using thiserror.
//! All errors in the engine should use these types for consistency.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the safety and rollback engine
#[derive(Error, Debug)]
pub enum SafetyError {
    /// IO errors (file operations, locks, signals)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backup could not be created (source unreadable / destination not writable).
    /// Raised before any tracked change is made; no partial backup is left behind.
    #[error("Backup creation failed: {0}")]
    BackupCreation(String),

    /// Manifest checksum mismatch detected during verification.
    /// Restores from the affected backup are refused.
    #[error("Integrity violation in backup {backup_id}: {mismatched:?}")]
    IntegrityViolation {
        backup_id: String,
        mismatched: Vec<String>,
    },

    /// An inverse action could not be applied during rollback.
    /// Halts further reversal immediately.
    #[error("Rollback of operation {operation_id} failed: {reason}")]
    RollbackFailure { operation_id: u64, reason: String },

    /// A second session was requested while one is active
    #[error("Session busy: held by pid {owner_pid} (session {session_id})")]
    SessionBusy { owner_pid: u32, session_id: String },

    /// Caller-imposed rollback time budget exceeded
    #[error("Rollback timed out: {reversed} reversed, {remaining} still pending")]
    RollbackTimeout { reversed: usize, remaining: usize },

    /// Emergency stop observed mid-operation; no further tracked mutation performed
    #[error("Emergency stop raised: {reason}")]
    EmergencyStop { reason: String },

    /// Journal errors (unreadable or malformed records)
    #[error("Journal error: {0}")]
    Journal(String),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A referenced backup does not exist in the store
    #[error("Unknown backup: {0}")]
    UnknownBackup(String),

    /// A referenced rollback point does not exist in the session
    #[error("Unknown rollback point: {0}")]
    UnknownRollbackPoint(String),

    /// Restore destination problems (staging or final move)
    #[error("Restore failed for {path:?}: {reason}")]
    Restore { path: PathBuf, reason: String },
}

/// Result type alias for safety engine operations
pub type Result<T> = std::result::Result<T, SafetyError>;

// Convenient error constructors
impl SafetyError {
    /// Create a backup creation error
    pub fn backup(msg: impl Into<String>) -> Self {
        Self::BackupCreation(msg.into())
    }

    /// Create a journal error
    pub fn journal(msg: impl Into<String>) -> Self {
        Self::Journal(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a rollback failure for a specific operation
    pub fn rollback_failure(operation_id: u64, reason: impl Into<String>) -> Self {
        Self::RollbackFailure {
            operation_id,
            reason: reason.into(),
        }
    }

    /// True if this error means the caller must stop issuing tracked operations
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::EmergencyStop { .. })
    }
}
