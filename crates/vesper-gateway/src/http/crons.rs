use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::app::AppState;

/// `GET /api/crons` — the configured job list.
pub async fn list_crons_handler(State(state): State<Arc<AppState>>) -> Json<Vec<vesper_cron::CronJob>> {
    let store = state.cron_store.lock().await;
    Json(store.list().to_vec())
}
