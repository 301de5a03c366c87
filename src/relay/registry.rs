use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{
    CursorEventMessage, CursorMessage, Identity, Operation, OperationMessage, RelayError,
    SendMessage, UserLeftMessage,
};
use crate::relay::conflict::detect_conflicts;
use crate::relay::room::{Room, RoomEvent};

/// What the joining connection gets back: the member list including
/// itself, a replay of the room's log, and its broadcast subscription.
pub struct JoinedRoom {
    pub members: Vec<Identity>,
    pub history: Vec<Operation>,
    pub receiver: broadcast::Receiver<RoomEvent>,
}

/// Result of a conflict-checked submission.
pub enum SubmitOutcome {
    /// Appended to the log and broadcast to the other members.
    Accepted(Operation),
    /// Rejected: not appended, not broadcast. The submitter decides
    /// whether to resubmit after resolving.
    Conflicted {
        operation: Operation,
        conflicts: Vec<crate::models::Conflict>,
    },
}

/// Owns all live rooms.
///
/// The outer map lock is only ever held to fetch, insert or remove
/// room arcs; every room mutation happens under that room's own mutex,
/// so work on distinct rooms never serializes. Deletion marks the room
/// `closed` under its mutex before unlinking it from the map, which
/// lets a racing join detect the corpse and retry against a fresh
/// room instead of resurrecting a half-deleted one.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    history_cap: usize,
    conflict_lookback: usize,
}

impl RoomRegistry {
    pub fn new(history_cap: usize, conflict_lookback: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            history_cap,
            conflict_lookback,
        }
    }

    /// Fetch the room arc, creating an empty room on first join.
    async fn get_or_create(&self, room_id: &str) -> Arc<Mutex<Room>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new(room_id))))
            .clone()
    }

    async fn get(&self, room_id: &str) -> Result<Arc<Mutex<Room>>, RelayError> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| RelayError::RoomNotFound(room_id.to_string()))
    }

    /// Unlink a closed room from the map, unless the slot has already
    /// been taken over by a fresh room with the same id.
    async fn unlink(&self, room_id: &str, room: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        if let Some(current) = rooms.get(room_id) {
            if Arc::ptr_eq(current, room) {
                rooms.remove(room_id);
            }
        }
    }

    /// Add a member, replaying the full log to the joiner and telling
    /// the other members about it.
    pub async fn join(&self, room_id: &str, conn_id: Uuid, identity: Identity) -> JoinedRoom {
        loop {
            let room = self.get_or_create(room_id).await;
            let mut guard = room.lock().await;
            if guard.closed {
                // Lost the race against a deletion; purge the corpse
                // and retry against a fresh room.
                drop(guard);
                self.unlink(room_id, &room).await;
                continue;
            }

            guard.members.insert(conn_id, identity.clone());
            guard.touch();
            guard.broadcast(conn_id, &SendMessage::UserJoined(identity));
            // Subscribe after the join broadcast so the joiner's own
            // announcement never reaches its own pump.
            let receiver = guard.subscribe();
            info!("Connection {} joined room {}", conn_id, room_id);

            return JoinedRoom {
                members: guard.members_snapshot(),
                history: guard.history_snapshot(),
                receiver,
            };
        }
    }

    /// Remove a member; the room is deleted on the leave that empties
    /// it, log and all.
    pub async fn leave(&self, room_id: &str, conn_id: Uuid) {
        let room = match self.get(room_id).await {
            Ok(room) => room,
            Err(_) => return,
        };
        let emptied = {
            let mut guard = room.lock().await;
            if guard.closed {
                return;
            }
            let identity = match guard.members.remove(&conn_id) {
                Some(identity) => identity,
                None => return,
            };
            if guard.members.is_empty() {
                guard.closed = true;
                true
            } else {
                guard.touch();
                guard.broadcast(
                    conn_id,
                    &SendMessage::UserLeft(UserLeftMessage {
                        user_id: identity.id,
                    }),
                );
                false
            }
        };
        if emptied {
            info!("Room {} emptied, deleting", room_id);
            self.unlink(room_id, &room).await;
        } else {
            debug!("Connection {} left room {}", conn_id, room_id);
        }
    }

    /// Conflict-check a submitted operation and, when clean, append it
    /// to the log and broadcast it to the other members.
    pub async fn submit(
        &self,
        room_id: &str,
        conn_id: Uuid,
        identity: &Identity,
        message: OperationMessage,
    ) -> Result<SubmitOutcome, RelayError> {
        let room = self.get(room_id).await?;
        let mut guard = room.lock().await;
        if guard.closed {
            return Err(RelayError::RoomNotFound(room_id.to_string()));
        }

        let operation = Operation {
            id: Uuid::new_v4(),
            client_op_id: message.client_op_id,
            kind: message.kind,
            target_node_id: message.target_node_id,
            payload: message.payload,
            user_id: identity.id.clone(),
            user_name: identity.login.clone(),
            timestamp: Utc::now(),
        };

        let conflicts = detect_conflicts(&operation, &guard.history, self.conflict_lookback);
        if !conflicts.is_empty() {
            debug!(
                "Rejected operation on {} in room {}: {} conflict(s)",
                operation.target_node_id,
                room_id,
                conflicts.len()
            );
            return Ok(SubmitOutcome::Conflicted {
                operation,
                conflicts,
            });
        }

        guard.append(operation.clone(), self.history_cap);
        guard.touch();
        guard.broadcast(conn_id, &SendMessage::Operation(operation.clone()));
        Ok(SubmitOutcome::Accepted(operation))
    }

    /// Relay a cursor update to the other members. Never logged.
    pub async fn relay_cursor(
        &self,
        room_id: &str,
        conn_id: Uuid,
        identity: &Identity,
        message: CursorMessage,
    ) -> Result<(), RelayError> {
        let room = self.get(room_id).await?;
        let guard = room.lock().await;
        if guard.closed {
            return Err(RelayError::RoomNotFound(room_id.to_string()));
        }
        guard.broadcast(
            conn_id,
            &SendMessage::CursorPosition(CursorEventMessage {
                target_node_id: message.target_node_id,
                position: message.position,
                user_id: identity.id.clone(),
                user_name: identity.login.clone(),
                timestamp: Utc::now(),
            }),
        );
        Ok(())
    }

    /// Reclaim every room that is empty or idle past the timeout.
    /// Returns the number of rooms deleted.
    pub async fn sweep(&self, idle_timeout: Duration) -> usize {
        self.sweep_at(Utc::now(), idle_timeout).await
    }

    async fn sweep_at(&self, now: DateTime<Utc>, idle_timeout: Duration) -> usize {
        let snapshot: Vec<(String, Arc<Mutex<Room>>)> = {
            let rooms = self.rooms.read().await;
            rooms
                .iter()
                .map(|(id, room)| (id.clone(), room.clone()))
                .collect()
        };

        let mut reclaimed = 0;
        for (room_id, room) in snapshot {
            let close = {
                let mut guard = room.lock().await;
                if guard.closed {
                    // A concurrent leave already claimed this one.
                    false
                } else {
                    let idle_secs = (now - guard.last_activity).num_seconds();
                    // Idle rooms are reclaimed even with members still
                    // recorded; stale bookkeeping must not pin memory.
                    if guard.members.is_empty() || idle_secs >= idle_timeout.as_secs() as i64 {
                        guard.closed = true;
                        true
                    } else {
                        false
                    }
                }
            };
            if close {
                info!("Sweeper reclaiming room {}", room_id);
                self.unlink(&room_id, &room).await;
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Close every room. Called once on shutdown.
    pub async fn close_all(&self) {
        let mut rooms = self.rooms.write().await;
        for (room_id, room) in rooms.drain() {
            let mut guard = room.lock().await;
            guard.closed = true;
            debug!("Closed room {} on shutdown", room_id);
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Aggregate counters for the diagnostics endpoint.
    pub async fn stats(&self) -> RegistryStats {
        let snapshot: Vec<Arc<Mutex<Room>>> =
            self.rooms.read().await.values().cloned().collect();
        let mut stats = RegistryStats::default();
        for room in snapshot {
            let guard = room.lock().await;
            if guard.closed {
                continue;
            }
            stats.n_rooms += 1;
            stats.n_members += guard.members.len() as u32;
            stats.n_logged_ops += guard.history.len() as u64;
        }
        stats
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryStats {
    pub n_rooms: u32,
    pub n_members: u32,
    pub n_logged_ops: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OpKind;
    use serde_json::Value;
    use tokio::sync::broadcast::error::TryRecvError;

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.to_string(),
            login: id.to_string(),
            name: None,
            avatar_url: None,
        }
    }

    fn op_message(kind: OpKind, node: &str) -> OperationMessage {
        OperationMessage {
            kind,
            target_node_id: node.to_string(),
            payload: Value::Null,
            client_op_id: None,
        }
    }

    fn parse(event: &RoomEvent) -> SendMessage {
        serde_json::from_str(&event.content).unwrap()
    }

    #[tokio::test]
    async fn first_join_creates_room_with_empty_history() {
        let registry = RoomRegistry::new(1000, 10);
        let conn = Uuid::new_v4();
        let joined = registry.join("doc-7", conn, identity("1")).await;
        assert_eq!(joined.members.len(), 1);
        assert!(joined.history.is_empty());
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn second_join_sees_members_and_notifies_peers() {
        let registry = RoomRegistry::new(1000, 10);
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        let mut joined_a = registry.join("doc-7", conn_a, identity("1")).await;
        let joined_b = registry.join("doc-7", conn_b, identity("2")).await;

        assert_eq!(joined_b.members.len(), 2);

        // A is told about B; the event is tagged with B's connection
        // so B's own pump would drop it.
        let event = joined_a.receiver.try_recv().unwrap();
        assert_eq!(event.origin, conn_b);
        match parse(&event) {
            SendMessage::UserJoined(who) => assert_eq!(who.id, "2"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn accepted_operation_is_logged_broadcast_and_acked() {
        let registry = RoomRegistry::new(1000, 10);
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        registry.join("doc-7", conn_a, identity("1")).await;
        let mut joined_b = registry.join("doc-7", conn_b, identity("2")).await;

        let outcome = registry
            .submit("doc-7", conn_a, &identity("1"), op_message(OpKind::UpdateNode, "n1"))
            .await
            .unwrap();
        let accepted = match outcome {
            SubmitOutcome::Accepted(op) => op,
            SubmitOutcome::Conflicted { .. } => panic!("expected acceptance"),
        };
        assert_eq!(accepted.user_id, "1");

        let event = joined_b.receiver.try_recv().unwrap();
        assert_eq!(event.origin, conn_a);
        match parse(&event) {
            SendMessage::Operation(op) => assert_eq!(op.id, accepted.id),
            other => panic!("unexpected event: {:?}", other),
        }

        // Replay on a later join matches the log.
        let joined_c = registry.join("doc-7", Uuid::new_v4(), identity("3")).await;
        assert_eq!(joined_c.history.len(), 1);
        assert_eq!(joined_c.history[0].id, accepted.id);
    }

    #[tokio::test]
    async fn conflicting_operation_is_not_logged_or_broadcast() {
        let registry = RoomRegistry::new(1000, 10);
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        registry.join("doc-7", conn_a, identity("1")).await;
        let mut joined_b = registry.join("doc-7", conn_b, identity("2")).await;

        registry
            .submit("doc-7", conn_a, &identity("1"), op_message(OpKind::UpdateNode, "n1"))
            .await
            .unwrap();
        let _ = joined_b.receiver.try_recv().unwrap();

        let outcome = registry
            .submit("doc-7", conn_b, &identity("2"), op_message(OpKind::DeleteNode, "n1"))
            .await
            .unwrap();
        match outcome {
            SubmitOutcome::Conflicted { conflicts, .. } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].operation2.user_id, "1");
            }
            SubmitOutcome::Accepted(_) => panic!("expected conflict"),
        }

        // Nothing reached the peers and the log is unchanged.
        assert!(matches!(joined_b.receiver.try_recv(), Err(TryRecvError::Empty)));
        let rejoin = registry.join("doc-7", Uuid::new_v4(), identity("3")).await;
        assert_eq!(rejoin.history.len(), 1);
    }

    #[tokio::test]
    async fn log_is_trimmed_oldest_first() {
        let registry = RoomRegistry::new(3, 0);
        let conn = Uuid::new_v4();
        registry.join("doc-7", conn, identity("1")).await;
        for i in 0..5 {
            registry
                .submit(
                    "doc-7",
                    conn,
                    &identity("1"),
                    op_message(OpKind::AddNode, &format!("n{i}")),
                )
                .await
                .unwrap();
        }
        let rejoin = registry.join("doc-7", Uuid::new_v4(), identity("2")).await;
        assert_eq!(rejoin.history.len(), 3);
        assert_eq!(rejoin.history[0].target_node_id, "n2");
        assert_eq!(rejoin.history[2].target_node_id, "n4");
    }

    #[tokio::test]
    async fn last_leave_deletes_room_and_log() {
        let registry = RoomRegistry::new(1000, 10);
        let conn = Uuid::new_v4();
        registry.join("doc-7", conn, identity("1")).await;
        registry
            .submit("doc-7", conn, &identity("1"), op_message(OpKind::AddNode, "n1"))
            .await
            .unwrap();

        registry.leave("doc-7", conn).await;
        assert_eq!(registry.room_count().await, 0);

        // A fresh join starts from an empty log.
        let rejoined = registry.join("doc-7", Uuid::new_v4(), identity("2")).await;
        assert!(rejoined.history.is_empty());
    }

    #[tokio::test]
    async fn leave_notifies_remaining_members() {
        let registry = RoomRegistry::new(1000, 10);
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        let mut joined_a = registry.join("doc-7", conn_a, identity("1")).await;
        registry.join("doc-7", conn_b, identity("2")).await;
        let _ = joined_a.receiver.try_recv().unwrap(); // B's user-joined

        registry.leave("doc-7", conn_b).await;
        match parse(&joined_a.receiver.try_recv().unwrap()) {
            SendMessage::UserLeft(left) => assert_eq!(left.user_id, "2"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_first_joins_share_one_room() {
        let registry = Arc::new(RoomRegistry::new(1000, 10));
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .join("doc-7", Uuid::new_v4(), identity(&i.to_string()))
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.room_count().await, 1);
        let stats = registry.stats().await;
        assert_eq!(stats.n_members, 16);
    }

    #[tokio::test]
    async fn sweep_reclaims_idle_room_with_stale_members() {
        let registry = RoomRegistry::new(1000, 10);
        let conn = Uuid::new_v4();
        registry.join("doc-7", conn, identity("1")).await;

        // Not yet idle: the room survives.
        assert_eq!(registry.sweep(Duration::from_secs(1800)).await, 0);

        // Pretend half an hour passed.
        let later = Utc::now() + chrono::Duration::seconds(1801);
        assert_eq!(registry.sweep_at(later, Duration::from_secs(1800)).await, 1);
        assert_eq!(registry.room_count().await, 0);

        // A submission from the stale member now fails.
        let result = registry
            .submit("doc-7", conn, &identity("1"), op_message(OpKind::AddNode, "n1"))
            .await;
        assert_eq!(
            result.err().map(|e| e.to_string()),
            Some("Room not found: doc-7".to_string())
        );
    }

    #[tokio::test]
    async fn sweep_reclaims_empty_room_regardless_of_age() {
        let registry = RoomRegistry::new(1000, 10);
        {
            // Simulate bookkeeping failure: a room left behind with no
            // members and no immediate deletion.
            let room = registry.get_or_create("ghost").await;
            room.lock().await.touch();
        }
        assert_eq!(registry.sweep(Duration::from_secs(1800)).await, 1);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn join_after_sweep_lands_on_fresh_room() {
        let registry = RoomRegistry::new(1000, 10);
        let conn = Uuid::new_v4();
        registry.join("doc-7", conn, identity("1")).await;
        let later = Utc::now() + chrono::Duration::seconds(7200);
        registry.sweep_at(later, Duration::from_secs(1800)).await;

        let rejoined = registry.join("doc-7", Uuid::new_v4(), identity("2")).await;
        assert_eq!(rejoined.members.len(), 1);
        assert!(rejoined.history.is_empty());
    }

    #[tokio::test]
    async fn join_retries_past_a_closed_corpse_left_in_the_map() {
        let registry = RoomRegistry::new(1000, 10);
        // Close the room under its own lock without unlinking it, as a
        // deletion caught mid-flight would.
        let corpse = registry.get_or_create("doc-7").await;
        corpse.lock().await.closed = true;

        let joined = registry.join("doc-7", Uuid::new_v4(), identity("1")).await;
        assert_eq!(joined.members.len(), 1);
        let current = registry.get("doc-7").await.unwrap();
        assert!(!Arc::ptr_eq(&current, &corpse));
    }

    #[tokio::test]
    async fn cursor_updates_are_relayed_but_never_logged() {
        let registry = RoomRegistry::new(1000, 10);
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        registry.join("doc-7", conn_a, identity("1")).await;
        let mut joined_b = registry.join("doc-7", conn_b, identity("2")).await;

        registry
            .relay_cursor(
                "doc-7",
                conn_a,
                &identity("1"),
                CursorMessage {
                    target_node_id: Some("n1".to_string()),
                    position: serde_json::json!({"x": 3}),
                },
            )
            .await
            .unwrap();

        let event = joined_b.receiver.try_recv().unwrap();
        assert_eq!(event.origin, conn_a);
        match parse(&event) {
            SendMessage::CursorPosition(cursor) => {
                assert_eq!(cursor.user_id, "1");
                assert_eq!(cursor.target_node_id.as_deref(), Some("n1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let rejoin = registry.join("doc-7", Uuid::new_v4(), identity("3")).await;
        assert!(rejoin.history.is_empty());
    }

    #[tokio::test]
    async fn close_all_empties_the_registry() {
        let registry = RoomRegistry::new(1000, 10);
        registry.join("doc-1", Uuid::new_v4(), identity("1")).await;
        registry.join("doc-2", Uuid::new_v4(), identity("2")).await;
        registry.close_all().await;
        assert_eq!(registry.room_count().await, 0);
    }
}
