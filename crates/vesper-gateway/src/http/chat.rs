//! `/api/chat*` — the panel's own chat surface, independent of any channel
//! poller. `TurnEvent` updates are streamed over
//! `axum::response::sse::Sse`, fed by an `async_stream::stream!`.

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vesper_core::types::Role;
use vesper_session::TurnEvent;

use crate::app::AppState;

#[derive(Deserialize)]
pub struct NewChatBody {
    #[serde(default)]
    pub role: Option<String>,
}

/// `POST /api/chat/new` — create a fresh, empty session.
pub async fn new_chat_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewChatBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let role = match &body.role {
        Some(r) => Role::from_str(r).map_err(|e| (StatusCode::BAD_REQUEST, e))?,
        None => Role::Default,
    };
    let id = state.engine.create_session(role, None);
    Ok(Json(json!({ "session_id": id })))
}

#[derive(Deserialize)]
pub struct ContextBody {
    pub session_id: String,
    pub contexts: Vec<String>,
}

/// `POST /api/chat/context` — replace a session's loaded-context list. Takes
/// effect on the session's next turn, where the full `Session` record
/// (including `contexts`) is persisted as a unit.
pub async fn context_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ContextBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if !state.engine.has_session(&body.session_id) {
        return Err((StatusCode::NOT_FOUND, "session not found".to_string()));
    }
    let arc = state.engine.load_or_create(&body.session_id, Role::Default);
    let mut session = arc.lock().await;
    session.contexts = body.contexts;
    Ok(Json(json!({ "session_id": body.session_id, "contexts": session.contexts })))
}

#[derive(Deserialize)]
pub struct ChatBody {
    pub session_id: String,
    pub message: String,
}

/// `POST /api/chat` — run one turn against an existing session, streaming
/// `{type: text|tool_start|tool_result|done|error, ...}` frames over SSE.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, mut rx) = mpsc::channel::<TurnEvent>(64);
    let engine = state.engine.clone();
    let session_id = body.session_id.clone();
    let message = body.message.clone();

    tokio::spawn(async move {
        if !engine.has_session(&session_id) {
            let _ = tx.send(TurnEvent::Error("session not found".to_string())).await;
            return;
        }
        engine.send_stream(&session_id, &message, CancellationToken::new(), tx).await;
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let frame = turn_event_to_frame(event);
            yield Ok(Event::default().data(frame.to_string()));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn turn_event_to_frame(event: TurnEvent) -> serde_json::Value {
    match event {
        TurnEvent::TextDelta(text) => json!({"type": "text", "text": text}),
        TurnEvent::ToolStart { id, name } => json!({"type": "tool_start", "id": id, "name": name}),
        TurnEvent::ToolResult { id, name, is_error } => {
            json!({"type": "tool_result", "id": id, "name": name, "is_error": is_error})
        }
        TurnEvent::Done(outcome) => json!({
            "type": "done",
            "content": outcome.content,
            "model": outcome.model,
            "stop_reason": outcome.stop_reason,
        }),
        TurnEvent::Error(message) => json!({"type": "error", "message": message}),
    }
}
