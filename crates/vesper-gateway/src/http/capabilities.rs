use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;

/// `GET /api/capabilities` — everything this daemon can currently do: tool
/// names, known channels, configured provider roles.
pub async fn capabilities_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cfg = state.config.lock().await;
    Json(json!({
        "tools": state.tools.all_names(),
        "roles": cfg.providers.roles.keys().collect::<Vec<_>>(),
        "channels": cfg.channels.telegram.as_ref().map(|_| vec!["telegram"]).unwrap_or_default(),
    }))
}

/// `GET /api/skills` — placeholder index; the skill library is a future
/// extension to the identity composer's context layer, not yet wired with
/// its own directory in this daemon.
pub async fn skills_handler() -> Json<Value> {
    Json(json!({ "skills": Vec::<String>::new() }))
}

/// `GET /api/custom-tools` — loaded custom tools plus quarantined load
/// failures (`custom-tools/`, `custom-tools-quarantine/`).
pub async fn custom_tools_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let quarantined: Vec<Value> = state
        .tools
        .quarantined()
        .iter()
        .map(|q| json!({"name": q.name, "source_path": q.source_path, "reason": q.reason}))
        .collect();
    Json(json!({
        "loaded": state.tools.custom_names(),
        "quarantined": quarantined,
    }))
}
