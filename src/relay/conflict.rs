use std::collections::VecDeque;

use crate::models::{Conflict, ConflictKind, OpKind, Operation};

/// Classify an incompatible kind pair: new operation vs prior one.
fn classify(new: &OpKind, prior: &OpKind) -> Option<ConflictKind> {
    match (new, prior) {
        (OpKind::DeleteNode, OpKind::UpdateNode) => Some(ConflictKind::DeleteUpdate),
        (OpKind::UpdateNode, OpKind::DeleteNode) => Some(ConflictKind::UpdateDelete),
        (OpKind::MoveNode, OpKind::MoveNode) => Some(ConflictKind::Move),
        _ => None,
    }
}

/// Check a submitted operation against the most recent `lookback` log
/// entries, collecting every structural conflict.
///
/// Candidates by the same author are skipped; only same-target pairs
/// from the narrow kind table above are flagged. The bounded lookback
/// keeps detection O(1) per submission regardless of room age.
pub fn detect_conflicts(
    operation: &Operation,
    history: &VecDeque<Operation>,
    lookback: usize,
) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    let skip = history.len().saturating_sub(lookback);

    for prior in history.iter().skip(skip) {
        if prior.user_id == operation.user_id {
            continue;
        }
        if prior.target_node_id != operation.target_node_id {
            continue;
        }
        if let Some(kind) = classify(&operation.kind, &prior.kind) {
            conflicts.push(Conflict {
                kind,
                operation1: operation.clone(),
                operation2: prior.clone(),
            });
        }
    }

    conflicts
}
