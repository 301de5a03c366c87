use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Conflict, Identity, OpKind, Operation};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateMessage {
    #[serde(default)]
    pub credential: String,
    pub identity: Option<Identity>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomMessage {
    pub room_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OperationMessage {
    pub kind: OpKind,
    pub target_node_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub client_op_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CursorMessage {
    #[serde(default)]
    pub target_node_id: Option<String>,
    #[serde(default)]
    pub position: Value,
}

/// Messages received from clients over the WebSocket.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ReceivedMessage {
    #[serde(rename = "authenticate")]
    Authenticate(AuthenticateMessage),
    #[serde(rename = "join-room")]
    JoinRoom(JoinRoomMessage),
    #[serde(rename = "operation")]
    Operation(OperationMessage),
    #[serde(rename = "cursor-position")]
    CursorPosition(CursorMessage),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedMessage {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedMessage {
    pub room_id: String,
    pub members: Vec<Identity>,
    pub history: Vec<Operation>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserLeftMessage {
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OperationAckMessage {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_op_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConflictMessage {
    pub operation: Operation,
    pub conflicts: Vec<Conflict>,
}

/// Cursor event as relayed to peers, stamped with the author and a
/// server timestamp.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CursorEventMessage {
    #[serde(default)]
    pub target_node_id: Option<String>,
    #[serde(default)]
    pub position: Value,
    pub user_id: String,
    pub user_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub message: String,
}

/// Messages sent to clients over the WebSocket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum SendMessage {
    #[serde(rename = "authenticated")]
    Authenticated(AuthenticatedMessage),
    #[serde(rename = "room-joined")]
    RoomJoined(RoomJoinedMessage),
    #[serde(rename = "user-joined")]
    UserJoined(Identity),
    #[serde(rename = "user-left")]
    UserLeft(UserLeftMessage),
    #[serde(rename = "operation")]
    Operation(Operation),
    #[serde(rename = "operation-ack")]
    OperationAck(OperationAckMessage),
    #[serde(rename = "conflict")]
    Conflict(ConflictMessage),
    #[serde(rename = "cursor-position")]
    CursorPosition(CursorEventMessage),
    #[serde(rename = "error")]
    Error(ErrorMessage),
}
