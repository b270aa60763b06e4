//! Shared gateway state and router assembly: one `Arc<AppState>` handed to
//! every handler, a `DashMap` for anything keyed by a runtime identity,
//! axum + `tower_http::trace::TraceLayer` for the router itself.

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{watch, Mutex as AsyncMutex};

use vesper_channel::ChannelManager;
use vesper_core::config::VesperConfig;
use vesper_cron::CronStore;
use vesper_heartbeat::HeartbeatPipeline;
use vesper_session::SessionEngine;
use vesper_tools::ToolRegistry;

use crate::credentials::FileCredentialStore;

pub struct AppState {
    pub config: AsyncMutex<VesperConfig>,
    pub config_changes: watch::Sender<VesperConfig>,
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub engine: Arc<SessionEngine>,
    pub tools: Arc<ToolRegistry>,
    pub cron_store: Arc<AsyncMutex<CronStore>>,
    pub heartbeat: Arc<HeartbeatPipeline>,
    pub credentials: Arc<FileCredentialStore>,
    pub channels: AsyncMutex<ChannelManager>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub log_ring: crate::log_ring::LogRing,
}

/// Assemble the full Axum router for the loopback control panel.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(crate::http::status::status_handler))
        .route("/api/gateway", get(crate::http::status::gateway_handler))
        .route("/api/gateway/log", get(crate::http::status::gateway_log_handler))
        .route(
            "/api/config",
            get(crate::http::config::get_config_handler).post(crate::http::config::post_config_handler),
        )
        .route(
            "/api/creds/{name}",
            get(crate::http::creds::get_cred_handler)
                .post(crate::http::creds::post_cred_handler)
                .delete(crate::http::creds::delete_cred_handler),
        )
        .route("/api/sessions", get(crate::http::sessions::list_sessions_handler))
        .route("/api/sessions/{id}", get(crate::http::sessions::get_session_handler))
        .route("/api/chat/new", post(crate::http::chat::new_chat_handler))
        .route("/api/chat/context", post(crate::http::chat::context_handler))
        .route("/api/chat", post(crate::http::chat::chat_handler))
        .route("/api/heartbeat/run", post(crate::http::heartbeat::run_handler))
        .route("/api/heartbeat/audit", get(crate::http::heartbeat::audit_handler))
        .route("/api/costs", get(crate::http::costs::costs_handler))
        .route("/api/crons", get(crate::http::crons::list_crons_handler))
        .route("/api/capabilities", get(crate::http::capabilities::capabilities_handler))
        .route("/api/skills", get(crate::http::capabilities::skills_handler))
        .route("/api/custom-tools", get(crate::http::capabilities::custom_tools_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
