use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use vesper_core::cost::CostLedgerData;
use vesper_core::persist::read_json;

use crate::app::AppState;

/// `GET /api/costs` — the 30-day rolling cost ledger, read straight off
/// disk (the ledger is already persisted atomically on every call, so this
/// is always at most one turn stale).
pub async fn costs_handler(State(state): State<Arc<AppState>>) -> Json<CostLedgerData> {
    let data: CostLedgerData = read_json(&state.data_dir.join("cost-log.json")).unwrap_or_default().unwrap_or_default();
    Json(data)
}
