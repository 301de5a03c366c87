use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for an error
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

/// Relay-level failures scoped to a single connection or room.
///
/// None of these are fatal to the process; they are reported to the
/// offending client as an event and the connection keeps running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Missing or malformed credential/identity. The client may retry.
    AuthenticationFailed(String),
    /// Operation or cursor submitted outside the Joined state.
    NotInRoom,
    /// A joined connection's room vanished without a leave event
    /// (e.g. reclaimed by the sweeper). The client should re-join.
    RoomNotFound(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::AuthenticationFailed(reason) => {
                write!(f, "Authentication failed: {}", reason)
            }
            RelayError::NotInRoom => write!(f, "Not in a room"),
            RelayError::RoomNotFound(room_id) => write!(f, "Room not found: {}", room_id),
        }
    }
}

impl std::error::Error for RelayError {}
