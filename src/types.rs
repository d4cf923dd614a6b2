//! Core data model for tracked operations and rollback points.
//!
//! Operation kinds form a closed enum; each kind carries its inverse as an
//! [`InverseAction`] payload, dispatched by pattern matching in the rollback
//! engine. No string-keyed dispatch, no global state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Kind of a tracked operation.
///
/// The engine does not decide what these operations mean on the system; it
/// only records them and knows how to dispatch their inverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// A file was created
    FileCreate,
    /// A file's content was modified
    FileModify,
    /// A file was deleted
    FileDelete,
    /// A package was installed
    PackageInstall,
    /// A package was removed
    PackageRemove,
    /// A service was started
    ServiceStart,
    /// A service was stopped
    ServiceStop,
}

impl OperationKind {
    /// True for kinds whose targets are filesystem paths
    pub const fn is_file_kind(self) -> bool {
        matches!(self, Self::FileCreate | Self::FileModify | Self::FileDelete)
    }

    /// Stable lowercase name used in journal queries and CLI output
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FileCreate => "file_create",
            Self::FileModify => "file_modify",
            Self::FileDelete => "file_delete",
            Self::PackageInstall => "package_install",
            Self::PackageRemove => "package_remove",
            Self::ServiceStart => "service_start",
            Self::ServiceStop => "service_stop",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_create" => Ok(Self::FileCreate),
            "file_modify" => Ok(Self::FileModify),
            "file_delete" => Ok(Self::FileDelete),
            "package_install" => Ok(Self::PackageInstall),
            "package_remove" => Ok(Self::PackageRemove),
            "service_start" => Ok(Self::ServiceStart),
            "service_stop" => Ok(Self::ServiceStop),
            other => Err(format!("Unknown operation kind: {}", other)),
        }
    }
}

/// Caller-supplied description of how to reverse an operation.
///
/// File inverses are executed by the engine itself; package and service
/// inverses are dispatched through the injected capability traits
/// (see `managers`). The engine never invents an inverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InverseAction {
    /// Delete the file the operation created
    DeleteFile { path: PathBuf },

    /// Restore one file from a backup taken before the operation
    RestoreFromBackup { backup_id: String, path: PathBuf },

    /// Reinstall a package; `version` pins the prior version when known
    InstallPackage {
        name: String,
        version: Option<String>,
    },

    /// Remove a package installed by the operation
    RemovePackage { name: String },

    /// Start a service the operation stopped
    StartService { name: String },

    /// Stop a service the operation started
    StopService { name: String },
}

impl fmt::Display for InverseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeleteFile { path } => write!(f, "delete {}", path.display()),
            Self::RestoreFromBackup { backup_id, path } => {
                write!(f, "restore {} from backup {}", path.display(), backup_id)
            }
            Self::InstallPackage { name, version } => match version {
                Some(v) => write!(f, "install {}={}", name, v),
                None => write!(f, "install {}", name),
            },
            Self::RemovePackage { name } => write!(f, "remove {}", name),
            Self::StartService { name } => write!(f, "start {}", name),
            Self::StopService { name } => write!(f, "stop {}", name),
        }
    }
}

/// One tracked operation. Immutable once appended to the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Monotonic sequence number within the owning session
    pub id: u64,
    /// Session that recorded the operation
    pub session_id: String,
    /// What happened
    pub kind: OperationKind,
    /// Path, package name, or service name acted upon
    pub target: String,
    /// When the operation was recorded
    pub timestamp: DateTime<Utc>,
    /// How to reverse it
    pub inverse: InverseAction,
    /// Backup taken before the operation, if its inverse needs one
    pub backup_ref: Option<String>,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {}", self.id, self.kind, self.target)
    }
}

/// A named checkpoint into the undo stack.
///
/// Consumed when `rollback_to_point` succeeds; persists until session end
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPoint {
    /// Unique id (UUID v4)
    pub id: String,
    /// Operator-chosen name
    pub name: String,
    /// When the point was created
    pub created_at: DateTime<Utc>,
    /// Undo-stack depth (= journal offset within the session) at creation
    pub depth: usize,
    /// Backup covering every file path touched before the point, if any
    pub backup_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            OperationKind::FileCreate,
            OperationKind::FileModify,
            OperationKind::FileDelete,
            OperationKind::PackageInstall,
            OperationKind::PackageRemove,
            OperationKind::ServiceStart,
            OperationKind::ServiceStop,
        ] {
            let parsed: OperationKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("file_shred".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_file_kind_predicate() {
        assert!(OperationKind::FileDelete.is_file_kind());
        assert!(!OperationKind::PackageInstall.is_file_kind());
        assert!(!OperationKind::ServiceStop.is_file_kind());
    }

    #[test]
    fn test_inverse_action_serde_tagging() {
        let inverse = InverseAction::InstallPackage {
            name: "nginx".to_string(),
            version: Some("1.24.0-1".to_string()),
        };
        let json = serde_json::to_string(&inverse).unwrap();
        assert!(json.contains("\"action\":\"install_package\""));

        let back: InverseAction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inverse);
    }

    #[test]
    fn test_operation_display() {
        let op = Operation {
            id: 7,
            session_id: "s1".to_string(),
            kind: OperationKind::FileDelete,
            target: "cache/pkg.tar".to_string(),
            timestamp: Utc::now(),
            inverse: InverseAction::RestoreFromBackup {
                backup_id: "b1".to_string(),
                path: PathBuf::from("cache/pkg.tar"),
            },
            backup_ref: Some("b1".to_string()),
        };
        assert_eq!(op.to_string(), "#7 file_delete cache/pkg.tar");
    }
}
