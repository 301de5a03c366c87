use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Operation kind tag.
///
/// The relay only special-cases the node kinds below for conflict
/// classification; anything else is carried through verbatim.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum OpKind {
    AddNode,
    DeleteNode,
    UpdateNode,
    MoveNode,
    Other(String),
}

impl From<String> for OpKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "add-node" => OpKind::AddNode,
            "delete-node" => OpKind::DeleteNode,
            "update-node" => OpKind::UpdateNode,
            "move-node" => OpKind::MoveNode,
            _ => OpKind::Other(tag),
        }
    }
}

impl From<OpKind> for String {
    fn from(kind: OpKind) -> Self {
        match kind {
            OpKind::AddNode => "add-node".to_string(),
            OpKind::DeleteNode => "delete-node".to_string(),
            OpKind::UpdateNode => "update-node".to_string(),
            OpKind::MoveNode => "move-node".to_string(),
            OpKind::Other(tag) => tag,
        }
    }
}

/// An accepted edit operation as stored in a room's log and broadcast
/// to peers. Immutable once accepted.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Server-assigned operation id.
    pub id: Uuid,
    /// Client-supplied id, echoed back in the acknowledgment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_op_id: Option<String>,
    pub kind: OpKind,
    pub target_node_id: String,
    /// Opaque payload; the relay never interprets it.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    pub user_id: String,
    pub user_name: String,
    /// Server-assigned receipt timestamp.
    pub timestamp: DateTime<Utc>,
}
