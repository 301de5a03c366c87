use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Identity, Operation, SendMessage};

/// Capacity of a room's broadcast channel.
const BROADCAST_CAPACITY: usize = 100;

/// A single event fanned out to the members of a room.
///
/// Carries the originating connection id so each member's receive pump
/// can drop the origin's own echo, and the payload pre-serialized so
/// it is encoded once per event rather than once per member.
#[derive(Clone, Debug)]
pub struct RoomEvent {
    pub origin: Uuid,
    pub content: String,
}

/// Live state of one collaboration room.
///
/// Always accessed through the registry's per-room mutex; the methods
/// here assume the caller holds it.
pub struct Room {
    pub id: String,
    pub members: HashMap<Uuid, Identity>,
    pub history: VecDeque<Operation>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Set under the room lock when the room is deleted. A join that
    /// finds this flag must retry against a fresh room.
    pub closed: bool,
    tx: broadcast::Sender<RoomEvent>,
}

impl Room {
    pub fn new(id: &str) -> Self {
        let (tx, _rx) = broadcast::channel::<RoomEvent>(BROADCAST_CAPACITY);
        let now = Utc::now();
        Self {
            id: id.to_string(),
            members: HashMap::new(),
            history: VecDeque::new(),
            created_at: now,
            last_activity: now,
            closed: false,
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.tx.subscribe()
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Fan a message out to every subscribed member. The origin's own
    /// pump filters it back out on the receiving side.
    pub fn broadcast(&self, origin: Uuid, message: &SendMessage) {
        let event = RoomEvent {
            origin,
            content: serde_json::to_string(message).unwrap(),
        };
        if let Err(e) = self.tx.send(event) {
            // No live receivers, e.g. the sole member broadcasting.
            debug!("No receivers for broadcast in room {}: {}", self.id, e);
        }
    }

    /// Append an accepted operation, discarding the oldest entries
    /// when the cap is exceeded.
    pub fn append(&mut self, operation: Operation, cap: usize) {
        self.history.push_back(operation);
        while self.history.len() > cap {
            self.history.pop_front();
        }
    }

    pub fn members_snapshot(&self) -> Vec<Identity> {
        self.members.values().cloned().collect()
    }

    pub fn history_snapshot(&self) -> Vec<Operation> {
        self.history.iter().cloned().collect()
    }
}
