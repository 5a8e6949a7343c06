//! Rollback planning.
//!
//! A member whose log diverged from its sync source keeps the longest shared
//! prefix, undoes its own entries after it and takes the source's entries in
//! their place. User and role documents are ordinary catalog documents, so
//! privilege changes are reverted exactly like data changes.

use warden_common::{Result, WardenError};

use super::{LogEntry, LogPosition, LogView};

/// What a rollback will do.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackPlan {
    /// Newest position present in both logs.
    pub common_point: LogPosition,
    /// Local entries after the common point, newest last.
    pub undo: Vec<LogPosition>,
    /// Source entries after the common point.
    pub reapply: Vec<LogEntry>,
}

/// Find the newest local position that also exists in the source log.
///
/// Returns `None` when the source no longer retains any position the local
/// log still has.
pub fn find_common_point(local: &LogView, source: &LogView) -> Option<LogPosition> {
    let candidates = local
        .entries
        .iter()
        .rev()
        .map(|e| e.position)
        .chain(std::iter::once(local.start));

    for position in candidates {
        if position < source.start {
            return None;
        }
        if source.contains(position) {
            return Some(position);
        }
    }
    None
}

/// Build the plan that brings `local` in line with `source`.
pub fn plan_rollback(local: &LogView, source: &LogView) -> Result<RollbackPlan> {
    let common_point = find_common_point(local, source).ok_or_else(|| {
        WardenError::RollbackFailed(format!(
            "no common point with sync source (local {}..{}, source {}..{})",
            local.start,
            local.last(),
            source.start,
            source.last()
        ))
    })?;

    Ok(RollbackPlan {
        common_point,
        undo: local
            .after(common_point)
            .iter()
            .map(|e| e.position)
            .collect(),
        reapply: source.after(common_point).to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(start: (u64, u64), positions: &[(u64, u64)]) -> LogView {
        LogView {
            start: LogPosition::new(start.0, start.1),
            entries: positions
                .iter()
                .map(|&(term, index)| LogEntry {
                    position: LogPosition::new(term, index),
                    writes: Vec::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_common_point_after_divergence() {
        // Local wrote (1, 3) and (1, 4) that never replicated; source moved on in term 2
        let local = view((0, 0), &[(1, 1), (1, 2), (1, 3), (1, 4)]);
        let source = view((0, 0), &[(1, 1), (1, 2), (2, 3), (2, 4), (2, 5)]);

        assert_eq!(
            find_common_point(&local, &source),
            Some(LogPosition::new(1, 2))
        );

        let plan = plan_rollback(&local, &source).unwrap();
        assert_eq!(
            plan.undo,
            vec![LogPosition::new(1, 3), LogPosition::new(1, 4)]
        );
        assert_eq!(plan.reapply.len(), 3);
        assert!(!plan.undo.is_empty());
    }

    #[test]
    fn test_lagging_member_needs_no_undo() {
        let local = view((0, 0), &[(1, 1)]);
        let source = view((0, 0), &[(1, 1), (1, 2)]);
        let plan = plan_rollback(&local, &source).unwrap();
        assert_eq!(plan.common_point, LogPosition::new(1, 1));
        assert!(plan.undo.is_empty());
        assert_eq!(plan.reapply.len(), 1);
    }

    #[test]
    fn test_divergence_from_the_first_entry() {
        let local = view((0, 0), &[(1, 1)]);
        let source = view((0, 0), &[(2, 1)]);
        assert_eq!(find_common_point(&local, &source), Some(LogPosition::ZERO));
    }

    #[test]
    fn test_no_common_point_when_source_checkpointed_past_divergence() {
        let local = view((0, 0), &[(1, 1), (1, 2), (1, 3)]);
        // Source folded (1, 1), (1, 2), (2, 3), (2, 4) into a checkpoint
        let source = view((2, 4), &[(2, 5)]);

        assert_eq!(find_common_point(&local, &source), None);
        let err = plan_rollback(&local, &source).unwrap_err();
        assert_eq!(err.code(), warden_common::codes::ROLLBACK_FAILED);
    }

    #[test]
    fn test_identical_logs_are_noop() {
        let local = view((0, 0), &[(1, 1), (1, 2)]);
        let plan = plan_rollback(&local, &local.clone()).unwrap();
        assert!(plan.undo.is_empty());
        assert!(plan.reapply.is_empty());
    }
}
