use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;

use crate::app::AppState;

/// `GET /api/config` — current effective configuration.
pub async fn get_config_handler(State(state): State<Arc<AppState>>) -> Json<VesperConfigView> {
    let cfg = state.config.lock().await.clone();
    Json(VesperConfigView(cfg))
}

/// `POST /api/config` — deep-merge a patch into the live config, persist it,
/// and broadcast the new value so subsystems (the heartbeat timer, in
/// particular) observe it without a restart.
pub async fn post_config_handler(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<Value>,
) -> Result<Json<VesperConfigView>, (StatusCode, String)> {
    let mut cfg = state.config.lock().await;
    cfg.apply_patch(patch, &state.config_path, &state.config_changes)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(VesperConfigView(cfg.clone())))
}

/// Thin serde wrapper so handlers can return `VesperConfig` without the
/// gateway crate needing its own duplicate response type.
pub struct VesperConfigView(vesper_core::config::VesperConfig);

impl serde::Serialize for VesperConfigView {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}
