use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;

/// A session ID must be a bare filename component — reject anything that
/// could escape `data_dir/sessions/` (path-traversal guard).
fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/') && !id.contains('\\') && id != "." && id != ".."
}

/// `GET /api/sessions` — summaries of every persisted session.
pub async fn list_sessions_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Value>> {
    let dir = state.data_dir.join("sessions");
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Json(out);
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Ok(bytes) = std::fs::read(&path) {
            if let Ok(session) = serde_json::from_slice::<vesper_session::Session>(&bytes) {
                out.push(json!({
                    "id": session.id,
                    "role": session.role.as_str(),
                    "message_count": session.messages.len(),
                    "created_at": session.metadata.created_at,
                    "updated_at": session.metadata.updated_at,
                    "total_cost_usd": session.metadata.cost.total_usd,
                }));
            }
        }
    }
    Json(out)
}

/// `GET /api/sessions/:id` — full persisted session record.
pub async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<vesper_session::Session>, (StatusCode, String)> {
    if !is_safe_id(&id) {
        return Err((StatusCode::BAD_REQUEST, "invalid session id".to_string()));
    }
    let path = state.data_dir.join("sessions").join(format!("{id}.json"));
    let bytes = std::fs::read(&path).map_err(|_| (StatusCode::NOT_FOUND, "session not found".to_string()))?;
    let session: vesper_session::Session =
        serde_json::from_slice(&bytes).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(session))
}
