use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;

/// `GET /api/status` — high-level daemon status: uptime, channel
/// connectivity, and session/cron counts, covering the wider set of
/// subsystems this daemon runs rather than just provider health.
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime_secs = (chrono::Utc::now() - state.started_at).num_seconds().max(0);
    let channel_statuses: Vec<Value> = state
        .channels
        .lock()
        .await
        .statuses()
        .into_iter()
        .map(|(name, status)| json!({"channel": name, "status": format!("{status:?}")}))
        .collect();
    let crons = state.cron_store.lock().await.list().len();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime_secs,
        "channels": channel_statuses,
        "cron_jobs": crons,
    }))
}

/// `GET /api/gateway` — supervisor identity/metadata.
pub async fn gateway_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "data_dir": state.data_dir.display().to_string(),
        "started_at": state.started_at.to_rfc3339(),
    }))
}

/// `GET /api/gateway/log` — recent log lines from the in-memory ring.
pub async fn gateway_log_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "lines": state.log_ring.snapshot() }))
}
