//! maintguard - Safety & Rollback Engine
//!
//! The trust layer under a destructive maintenance CLI: every tracked
//! operation is journaled, backed by checksum-verified backups, reversible
//! through a strict LIFO undo stack, and interruptible machine-wide by a
//! cooperative emergency stop.

pub mod backup;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod journal;
pub mod managers;
pub mod rollback;
pub mod session;
pub mod stop;
pub mod types;
pub mod undo_stack;

// Re-export main types for convenience
pub use backup::{Backup, BackupKind, BackupMetadata, BackupStore, RestoredSet};
pub use checksum::{ChecksumManifest, ManifestEntry, Mismatch, MismatchKind, VerifyReport};
pub use config::SafetyConfig;
pub use error::{Result, SafetyError};
pub use journal::{EventSeverity, JournalRecord, OperationFilter, OperationJournal};
pub use managers::{
    PackageManager, RecordingPackageManager, RecordingServiceManager, ServiceManager,
    SystemPackageManager, SystemServiceManager,
};
pub use rollback::{RollbackEngine, RollbackResult, StepFailure};
pub use session::{SafetySession, SessionStatus};
pub use stop::{
    init_signal_handlers, CommandProcessGroup, EmergencyStopCoordinator, StopSignal,
    StopState, StopToken, WorkerRegistry,
};
pub use types::{InverseAction, Operation, OperationKind, RollbackPoint};
pub use undo_stack::UndoStack;
