use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use vesper_core::collaborators::CredentialStore;

use crate::app::AppState;

/// `GET /api/creds/:name` — whether a credential is set. Values are never
/// written into any persisted artifact by the core, and are never echoed
/// back over this surface either.
pub async fn get_cred_handler(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Json<Value> {
    Json(json!({ "name": name, "set": state.credentials.get(&name).is_some() }))
}

#[derive(Deserialize)]
pub struct SetCredBody {
    pub value: String,
}

pub async fn post_cred_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<SetCredBody>,
) -> Json<Value> {
    state.credentials.set(&name, &body.value);
    Json(json!({ "name": name, "set": true }))
}

pub async fn delete_cred_handler(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Json<Value> {
    state.credentials.remove(&name);
    Json(json!({ "name": name, "set": false }))
}
