use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::relay::registry::RoomRegistry;

/// Spawn the background reclamation task.
///
/// Runs for the life of the process; each tick deletes empty rooms and
/// rooms idle past the timeout. A safety net behind the immediate
/// empty-room deletion on leave, and the only thing that reclaims
/// rooms pinned by stale membership bookkeeping.
pub fn spawn_sweeper(
    registry: Arc<RoomRegistry>,
    interval: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reclaimed = registry.sweep(idle_timeout).await;
            if reclaimed > 0 {
                info!("Sweeper reclaimed {} room(s)", reclaimed);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::time::pause;
    use uuid::Uuid;

    use crate::models::{Identity, OpKind, OperationMessage, RelayError};

    #[tokio::test]
    async fn sweeper_reclaims_idle_rooms_and_stale_members_get_room_not_found() {
        pause();
        let registry = Arc::new(RoomRegistry::new(1000, 10));
        // Zero idle timeout: every room counts as idle at the next tick.
        let handle = spawn_sweeper(registry.clone(), Duration::from_secs(60), Duration::ZERO);

        let conn = Uuid::new_v4();
        let member = Identity {
            id: "1".to_string(),
            login: "a".to_string(),
            name: None,
            avatar_url: None,
        };
        registry.join("doc-7", conn, member.clone()).await;
        assert_eq!(registry.room_count().await, 1);

        // Sleeping on the paused clock parks this task, which lets the
        // timer driver fire the sweeper's 60 s tick along the way.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.room_count().await, 0);

        // The stale member's next submission surfaces the loss.
        let result = registry
            .submit(
                "doc-7",
                conn,
                &member,
                OperationMessage {
                    kind: OpKind::AddNode,
                    target_node_id: "n1".to_string(),
                    payload: Value::Null,
                    client_op_id: None,
                },
            )
            .await;
        assert!(matches!(result, Err(RelayError::RoomNotFound(_))));
        handle.abort();
    }
}
