//! Rollback execution: popping the undo stack and applying inverses.
//!
//! Entries are reversed in strict reverse-chronological order, one at a
//! time. The first failure halts all further pops; continuing past a failed
//! inverse could produce a state nobody can reason about. The result reports
//! what was reversed, what failed and why, and what remains on the stack.

use crate::backup::BackupStore;
use crate::error::{Result, SafetyError};
use crate::managers::{PackageManager, ServiceManager};
use crate::stop::StopToken;
use crate::types::{InverseAction, Operation};
use crate::undo_stack::UndoStack;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// The entry that could not be reversed, with the reason.
#[derive(Debug)]
pub struct StepFailure {
    pub operation: Operation,
    pub reason: String,
}

/// Outcome of a rollback request.
#[derive(Debug, Default)]
pub struct RollbackResult {
    /// Operations successfully reversed, in the order they were undone
    pub reversed: Vec<Operation>,
    /// First (and only) failure; halts further reversal
    pub failure: Option<StepFailure>,
    /// Entries left un-reversed on the stack (the failed entry included)
    pub remaining: usize,
}

impl RollbackResult {
    /// True when every requested entry was reversed
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }

    /// Structured report for the surrounding CLI
    pub fn describe(&self) -> String {
        let mut lines = vec![format!("reversed: {}", self.reversed.len())];
        for op in &self.reversed {
            lines.push(format!("  ok {}", op));
        }
        if let Some(failure) = &self.failure {
            lines.push(format!("failed: {} ({})", failure.operation, failure.reason));
        }
        lines.push(format!("pending: {}", self.remaining));
        lines.join("\n")
    }
}

/// Executes inverse actions against the filesystem and the injected
/// package/service capability seams.
pub struct RollbackEngine<'a> {
    store: &'a BackupStore,
    packages: &'a dyn PackageManager,
    services: &'a dyn ServiceManager,
    work_root: &'a Path,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(
        store: &'a BackupStore,
        packages: &'a dyn PackageManager,
        services: &'a dyn ServiceManager,
        work_root: &'a Path,
    ) -> Self {
        Self {
            store,
            packages,
            services,
            work_root,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        // join() replaces the base when `path` is absolute, which is the
        // behavior we want for callers recording absolute targets
        self.work_root.join(path)
    }

    /// Pop up to `n` entries, reversing each in strict reverse order.
    ///
    /// Stop and deadline checks sit at step boundaries: an observed stop
    /// returns [`SafetyError::EmergencyStop`], an exceeded `deadline`
    /// returns [`SafetyError::RollbackTimeout`]; in both cases entries
    /// already reversed stay reversed and the stack keeps the rest.
    /// Rolling back an empty stack (or `n == 0`) is a no-op success.
    pub fn rollback_last(
        &self,
        stack: &mut UndoStack,
        n: usize,
        token: &StopToken,
        deadline: Option<Instant>,
    ) -> Result<RollbackResult> {
        let mut result = RollbackResult::default();

        for _ in 0..n {
            let Some(top) = stack.peek().cloned() else {
                break;
            };
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(SafetyError::RollbackTimeout {
                        reversed: result.reversed.len(),
                        remaining: stack.depth(),
                    });
                }
            }
            token.ensure_clear()?;

            // Failure leaves the entry on the stack for human intervention
            match self.apply_inverse(&top) {
                Ok(()) => {
                    info!("Reversed {}", top);
                    stack.pop();
                    result.reversed.push(top);
                }
                Err(reason) => {
                    warn!("Rollback halted at {}: {}", top, reason);
                    result.failure = Some(StepFailure {
                        operation: top,
                        reason,
                    });
                    break;
                }
            }
        }

        result.remaining = stack.depth();
        Ok(result)
    }

    /// Roll back to a named point, restore its covering backup as a final
    /// consistency pass, and consume the point (plus any points above it).
    ///
    /// If the rollback halts or the consistency restore fails, the point
    /// persists so the operator can retry.
    pub fn rollback_to_point(
        &self,
        stack: &mut UndoStack,
        point_id: &str,
        token: &StopToken,
        deadline: Option<Instant>,
    ) -> Result<RollbackResult> {
        let point = stack.find_point(point_id)?;
        let n = stack.depth().saturating_sub(point.depth);

        let result = self.rollback_last(stack, n, token, deadline)?;
        if !result.is_complete() {
            return Ok(result);
        }

        if let Some(backup_ref) = &point.backup_ref {
            self.store.restore(backup_ref, self.work_root, token)?;
        }
        stack.discard_point_and_above(&point.id);
        info!("Rolled back to point '{}'", point.name);
        Ok(result)
    }

    /// Apply one inverse action. Failures are reported as strings so the
    /// caller can halt and surface them without losing the operation.
    fn apply_inverse(&self, operation: &Operation) -> std::result::Result<(), String> {
        match &operation.inverse {
            InverseAction::DeleteFile { path } => {
                let full = self.resolve(path);
                if !full.exists() {
                    return Err(format!(
                        "target already missing: {}",
                        full.display()
                    ));
                }
                fs::remove_file(&full).map_err(|e| format!("delete failed: {}", e))
            }
            InverseAction::RestoreFromBackup { backup_id, path } => {
                let dest = self.resolve(path);
                let rel = path.to_string_lossy();
                self.store
                    .restore_file(backup_id, &rel, &dest)
                    .map_err(|e| e.to_string())
            }
            InverseAction::InstallPackage { name, version } => self
                .packages
                .install(name, version.as_deref())
                .map_err(|e| e.to_string()),
            InverseAction::RemovePackage { name } => {
                self.packages.remove(name).map_err(|e| e.to_string())
            }
            InverseAction::StartService { name } => {
                self.services.start(name).map_err(|e| e.to_string())
            }
            InverseAction::StopService { name } => {
                self.services.stop(name).map_err(|e| e.to_string())
            }
        }
    }
}
