use serde::{Deserialize, Serialize};

use crate::models::Operation;

/// Conflict classification tag.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    #[serde(rename = "delete-update-conflict")]
    DeleteUpdate,
    #[serde(rename = "update-delete-conflict")]
    UpdateDelete,
    #[serde(rename = "move-conflict")]
    Move,
}

/// A structural incompatibility between a submitted operation and a
/// recent one on the same target node by a different author.
///
/// Reported once to the submitter and then forgotten; never stored in
/// the log. Resolution is a client concern.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    /// The rejected submission.
    pub operation1: Operation,
    /// The prior logged operation it collides with.
    pub operation2: Operation,
}
