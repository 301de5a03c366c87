use axum::{extract::State, Json};
use std::sync::{Arc, Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

use crate::models::DiagnosticsResponse;
use crate::relay::registry::RoomRegistry;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Relay diagnostics: room/member counters plus process stats
pub async fn diagnostics(State(registry): State<Arc<RoomRegistry>>) -> Json<DiagnosticsResponse> {
    // Aggregate counters from the registry
    let stats = registry.stats().await;

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Members: {}, Rooms: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        stats.n_members,
        stats.n_rooms
    );

    Json(DiagnosticsResponse {
        n_members: stats.n_members,
        n_rooms: stats.n_rooms,
        n_logged_ops: stats.n_logged_ops,
        cpu_usage,
        memory_alloc,
        memory_total,
        memory_free,
    })
}
