//! Per-session LIFO of still-reversible operations.
//!
//! The stack mirrors reverse-chronological operation order and is only ever
//! popped from the top: rollback always processes the most recently pushed,
//! not-yet-undone operation first. Rollback points record a depth into the
//! stack plus an optional covering backup.

use crate::error::{Result, SafetyError};
use crate::types::{Operation, RollbackPoint};
use chrono::Utc;
use uuid::Uuid;

/// Mutable rollback state for one session. Owned by the session context,
/// never global.
#[derive(Debug, Default)]
pub struct UndoStack {
    entries: Vec<Operation>,
    points: Vec<RollbackPoint>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a newly recorded operation
    pub fn push(&mut self, operation: Operation) {
        self.entries.push(operation);
    }

    /// Pop the most recent not-yet-undone operation
    pub fn pop(&mut self) -> Option<Operation> {
        self.entries.pop()
    }

    /// Peek at the top without consuming it
    pub fn peek(&self) -> Option<&Operation> {
        self.entries.last()
    }

    /// Current depth
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries bottom-to-top (chronological order)
    pub fn entries(&self) -> &[Operation] {
        &self.entries
    }

    /// Record a named point at the current depth.
    ///
    /// `backup_ref` is the covering backup of every file path touched so
    /// far (the session computes and creates it).
    pub fn mark_point(&mut self, name: &str, backup_ref: Option<String>) -> RollbackPoint {
        let point = RollbackPoint {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            depth: self.depth(),
            backup_ref,
        };
        self.points.push(point.clone());
        point
    }

    /// Find a point by id or name
    pub fn find_point(&self, id_or_name: &str) -> Result<RollbackPoint> {
        self.points
            .iter()
            .find(|p| p.id == id_or_name || p.name == id_or_name)
            .cloned()
            .ok_or_else(|| SafetyError::UnknownRollbackPoint(id_or_name.to_string()))
    }

    /// Drop a consumed point and every point recorded above its depth
    /// (those checkpoints no longer describe a reachable state).
    pub fn discard_point_and_above(&mut self, id: &str) {
        if let Some(point) = self.points.iter().find(|p| p.id == id).cloned() {
            self.points
                .retain(|p| p.id != id && p.depth < point.depth);
        }
    }

    /// Points still alive, in creation order
    pub fn points(&self) -> &[RollbackPoint] {
        &self.points
    }

    /// Distinct file paths (operation targets of file kinds) touched at or
    /// above `from_depth`, in first-touched order. Feeds rollback-point
    /// covering backups.
    pub fn touched_file_paths_since(&self, from_depth: usize) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for op in self.entries.iter().skip(from_depth) {
            if op.kind.is_file_kind() && seen.insert(op.target.clone()) {
                out.push(op.target.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InverseAction, OperationKind};
    use std::path::PathBuf;

    fn op(id: u64, kind: OperationKind, target: &str) -> Operation {
        Operation {
            id,
            session_id: "s1".to_string(),
            kind,
            target: target.to_string(),
            timestamp: Utc::now(),
            inverse: InverseAction::DeleteFile {
                path: PathBuf::from(target),
            },
            backup_ref: None,
        }
    }

    #[test]
    fn test_lifo_order() {
        let mut stack = UndoStack::new();
        stack.push(op(1, OperationKind::FileCreate, "f1"));
        stack.push(op(2, OperationKind::FileCreate, "f2"));
        stack.push(op(3, OperationKind::FileCreate, "f3"));

        assert_eq!(stack.depth(), 3);
        assert_eq!(stack.pop().unwrap().id, 3);
        assert_eq!(stack.pop().unwrap().id, 2);
        assert_eq!(stack.pop().unwrap().id, 1);
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_mark_and_find_point() {
        let mut stack = UndoStack::new();
        stack.push(op(1, OperationKind::FileCreate, "f1"));

        let point = stack.mark_point("before-cleanup", None);
        assert_eq!(point.depth, 1);

        assert_eq!(stack.find_point("before-cleanup").unwrap().id, point.id);
        assert_eq!(stack.find_point(&point.id).unwrap().name, "before-cleanup");
        assert!(matches!(
            stack.find_point("nope"),
            Err(SafetyError::UnknownRollbackPoint(_))
        ));
    }

    #[test]
    fn test_discard_point_and_above() {
        let mut stack = UndoStack::new();
        let low = stack.mark_point("low", None);
        stack.push(op(1, OperationKind::FileCreate, "f1"));
        let mid = stack.mark_point("mid", None);
        stack.push(op(2, OperationKind::FileCreate, "f2"));
        let high = stack.mark_point("high", None);

        stack.discard_point_and_above(&mid.id);

        let remaining: Vec<_> = stack.points().iter().map(|p| p.id.clone()).collect();
        assert!(remaining.contains(&low.id));
        assert!(!remaining.contains(&mid.id));
        assert!(!remaining.contains(&high.id));
    }

    #[test]
    fn test_touched_file_paths_dedup_and_skip_nonfile() {
        let mut stack = UndoStack::new();
        stack.push(op(1, OperationKind::FileCreate, "f1"));
        stack.push(op(2, OperationKind::FileModify, "f1"));
        stack.push(op(3, OperationKind::PackageInstall, "nginx"));
        stack.push(op(4, OperationKind::FileDelete, "f2"));

        assert_eq!(stack.touched_file_paths_since(0), vec!["f1", "f2"]);
        assert_eq!(stack.touched_file_paths_since(2), vec!["f2"]);
    }
}
