use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;

/// `POST /api/heartbeat/run` — trigger an out-of-band tick (reentrancy
/// still guarded inside `HeartbeatPipeline::tick`).
pub async fn run_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.heartbeat.tick().await;
    Json(json!({ "ran": true }))
}

/// `GET /api/heartbeat/audit` — the last up-to-50 audit entries.
pub async fn audit_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let audit: Vec<vesper_heartbeat::AuditEntry> =
        vesper_core::persist::read_json(&state.data_dir.join("heartbeat-audit.json")).unwrap_or_default().unwrap_or_default();
    Json(json!({ "audit": audit }))
}
