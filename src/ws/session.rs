use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{
    AuthenticateMessage, AuthenticatedMessage, ConflictMessage, CursorMessage, ErrorMessage,
    Identity, JoinRoomMessage, OperationAckMessage, OperationMessage, ReceivedMessage, RelayError,
    RoomJoinedMessage, SendMessage,
};
use crate::relay::registry::{RoomRegistry, SubmitOutcome};
use crate::relay::room::RoomEvent;

/// Connection lifecycle.
///
/// `Unbound → Authenticated → Joined → Closed`; `Closed` is terminal.
enum ConnState {
    Unbound,
    Authenticated(Identity),
    Joined { identity: Identity, room_id: String },
    Closed,
}

/// What a handled client message produced: direct replies for this
/// connection, and a replacement room subscription when the
/// connection joined a room.
pub struct Reply {
    pub messages: Vec<SendMessage>,
    pub subscription: Option<broadcast::Receiver<RoomEvent>>,
}

impl Reply {
    fn messages(messages: Vec<SendMessage>) -> Self {
        Self {
            messages,
            subscription: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::messages(vec![SendMessage::Error(ErrorMessage {
            message: message.into(),
        })])
    }
}

/// Per-connection protocol state machine.
///
/// Owns the connection's side of every relay interaction; the socket
/// pump in `handler` only parses frames and writes replies.
pub struct Session {
    conn_id: Uuid,
    state: ConnState,
    registry: Arc<RoomRegistry>,
}

impl Session {
    pub fn new(conn_id: Uuid, registry: Arc<RoomRegistry>) -> Self {
        Self {
            conn_id,
            state: ConnState::Unbound,
            registry,
        }
    }

    pub async fn handle(&mut self, message: ReceivedMessage) -> Reply {
        match message {
            ReceivedMessage::Authenticate(auth) => self.handle_authenticate(auth),
            ReceivedMessage::JoinRoom(join) => self.handle_join(join).await,
            ReceivedMessage::Operation(op) => self.handle_operation(op).await,
            ReceivedMessage::CursorPosition(cursor) => self.handle_cursor(cursor).await,
        }
    }

    fn handle_authenticate(&mut self, auth: AuthenticateMessage) -> Reply {
        if !matches!(self.state, ConnState::Unbound) {
            return Reply::error("Already authenticated");
        }

        let checked = if auth.credential.is_empty() {
            Err("Missing credential")
        } else {
            match auth.identity {
                None => Err("Missing identity"),
                Some(identity) if !identity.is_well_formed() => Err("Malformed identity"),
                Some(identity) => Ok(identity),
            }
        };

        let identity = match checked {
            Ok(identity) => identity,
            Err(reason) => {
                // The connection stays Unbound; the client may retry.
                warn!(
                    "Authentication failed for connection {}: {}",
                    self.conn_id,
                    RelayError::AuthenticationFailed(reason.to_string())
                );
                return Reply::messages(vec![SendMessage::Authenticated(AuthenticatedMessage {
                    success: false,
                    error: Some(reason.to_string()),
                })]);
            }
        };
        info!(
            "Connection {} authenticated as {}",
            self.conn_id, identity.login
        );
        self.state = ConnState::Authenticated(identity);
        Reply::messages(vec![SendMessage::Authenticated(AuthenticatedMessage {
            success: true,
            error: None,
        })])
    }

    async fn handle_join(&mut self, join: JoinRoomMessage) -> Reply {
        let identity = match &self.state {
            ConnState::Authenticated(identity) => identity.clone(),
            ConnState::Joined { identity, room_id } => {
                let identity = identity.clone();
                // A connection is a member of at most one room; leave
                // the previous one before joining the target.
                if *room_id != join.room_id {
                    self.registry.leave(room_id, self.conn_id).await;
                }
                identity
            }
            ConnState::Unbound | ConnState::Closed => {
                return Reply::error("Not authenticated");
            }
        };

        let joined = self
            .registry
            .join(&join.room_id, self.conn_id, identity.clone())
            .await;
        self.state = ConnState::Joined {
            identity,
            room_id: join.room_id.clone(),
        };

        Reply {
            messages: vec![SendMessage::RoomJoined(RoomJoinedMessage {
                room_id: join.room_id,
                members: joined.members,
                history: joined.history,
            })],
            subscription: Some(joined.receiver),
        }
    }

    async fn handle_operation(&mut self, message: OperationMessage) -> Reply {
        let (identity, room_id) = match &self.state {
            ConnState::Joined { identity, room_id } => (identity.clone(), room_id.clone()),
            _ => return Reply::error(RelayError::NotInRoom.to_string()),
        };

        match self
            .registry
            .submit(&room_id, self.conn_id, &identity, message)
            .await
        {
            Ok(SubmitOutcome::Accepted(operation)) => {
                Reply::messages(vec![SendMessage::OperationAck(OperationAckMessage {
                    id: operation.id,
                    client_op_id: operation.client_op_id,
                })])
            }
            Ok(SubmitOutcome::Conflicted {
                operation,
                conflicts,
            }) => Reply::messages(vec![SendMessage::Conflict(ConflictMessage {
                operation,
                conflicts,
            })]),
            Err(e) => {
                warn!("Operation from connection {} failed: {}", self.conn_id, e);
                Reply::error(e.to_string())
            }
        }
    }

    async fn handle_cursor(&mut self, message: CursorMessage) -> Reply {
        let (identity, room_id) = match &self.state {
            ConnState::Joined { identity, room_id } => (identity.clone(), room_id.clone()),
            _ => return Reply::error(RelayError::NotInRoom.to_string()),
        };

        match self
            .registry
            .relay_cursor(&room_id, self.conn_id, &identity, message)
            .await
        {
            Ok(()) => Reply::messages(Vec::new()),
            Err(e) => Reply::error(e.to_string()),
        }
    }

    /// Run the leave path and seal the session. Called exactly once,
    /// on transport close or explicit disconnect.
    pub async fn close(&mut self) {
        if let ConnState::Joined { room_id, .. } = &self.state {
            self.registry.leave(&room_id.clone(), self.conn_id).await;
        }
        self.state = ConnState::Closed;
    }
}
