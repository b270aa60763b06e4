//! The session engine — the tool-use loop shared by `send` and
//! `send_stream`. Tool calls within one round execute in parallel via
//! `futures_util::future::join_all`, and every round is billed through the
//! cost ledger and checked against a per-session cost ceiling / deadline
//! before the next round begins.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vesper_core::collaborators::{GraphExtractor, Journal};
use vesper_core::cost::{local_date_string, CostLedger};
use vesper_core::persist::{atomic_write_json, read_json};
use vesper_core::types::Role;
use vesper_provider::provider::{ChatRequest, ChatResponse};
use vesper_provider::registry::ProviderRegistry;
use vesper_provider::stream::StreamEvent;
use vesper_tools::{Tool, ToolCtx, ToolRegistry, ToolResult};

use crate::compact::compact_if_needed;
use crate::error::{Result, SessionError};
use crate::identity::{IdentityComposer, PromptInputs};
use crate::types::{Message, Outfit, Session, SessionLimits, ToolCallRecord, ToolResultPair};

fn refusal_text(spend: f64, limit: f64) -> String {
    format!(
        "I've spent ${spend:.2} of today's ${limit:.2} budget, so I can't take any more actions until it resets. Let me know if this is urgent."
    )
}

/// Events emitted by `send_stream`, mirroring `{text|tool_start|tool_result}`.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    TextDelta(String),
    ToolStart { id: String, name: String },
    ToolResult { id: String, name: String, is_error: bool },
    Done(TurnOutcome),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
}

#[derive(Default)]
struct SideEffects {
    contexts_to_load: Vec<String>,
    outfit_change: Option<Option<String>>,
}

struct EngineToolCtx {
    session_id: String,
    engine: Arc<SessionEngine>,
    side_effects: AsyncMutex<SideEffects>,
}

#[async_trait::async_trait]
impl ToolCtx for EngineToolCtx {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn load_context(&self, name: &str) -> std::result::Result<(), String> {
        self.side_effects.lock().await.contexts_to_load.push(name.to_string());
        Ok(())
    }

    async fn set_outfit(&self, name: Option<&str>) -> std::result::Result<(), String> {
        self.side_effects.lock().await.outfit_change = Some(name.map(|s| s.to_string()));
        Ok(())
    }

    async fn spawn_subagent(&self, prompt: &str) -> std::result::Result<String, String> {
        let mut sub = Session::new(Role::Quick);
        sub.limits = SessionLimits::sub_agent();
        let outcome = self
            .engine
            .run_turn_standalone(&mut sub, prompt, CancellationToken::new())
            .await
            .map_err(|e| e.to_string())?;
        Ok(outcome.content)
    }
}

pub struct SessionEngine {
    providers: Arc<ProviderRegistry>,
    tools: Arc<ToolRegistry>,
    cost_ledger: Arc<AsyncMutex<CostLedger>>,
    identity: Arc<IdentityComposer>,
    journal: Arc<dyn Journal>,
    graph: Arc<dyn GraphExtractor>,
    sessions: DashMap<String, Arc<AsyncMutex<Session>>>,
    outfits: std::collections::BTreeMap<String, Outfit>,
    data_dir: PathBuf,
}

impl SessionEngine {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
        cost_ledger: Arc<AsyncMutex<CostLedger>>,
        identity: Arc<IdentityComposer>,
        journal: Arc<dyn Journal>,
        graph: Arc<dyn GraphExtractor>,
        data_dir: PathBuf,
    ) -> Self {
        Self::with_outfits(providers, tools, cost_ledger, identity, journal, graph, data_dir, std::collections::BTreeMap::new())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_outfits(
        providers: Arc<ProviderRegistry>,
        tools: Arc<ToolRegistry>,
        cost_ledger: Arc<AsyncMutex<CostLedger>>,
        identity: Arc<IdentityComposer>,
        journal: Arc<dyn Journal>,
        graph: Arc<dyn GraphExtractor>,
        data_dir: PathBuf,
        outfits: std::collections::BTreeMap<String, Outfit>,
    ) -> Self {
        Self { providers, tools, cost_ledger, identity, journal, graph, sessions: DashMap::new(), outfits, data_dir }
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("sessions").join(format!("{id}.json"))
    }

    fn archive_path(&self, id: &str) -> PathBuf {
        self.data_dir.join("sessions").join(format!("{id}.history.jsonl"))
    }

    /// Create a new, empty session held only in memory and registered in
    /// the session store; not yet written to disk (the first `send` will
    /// persist it).
    pub fn create_session(&self, role: Role, limits: Option<SessionLimits>) -> String {
        let mut session = Session::new(role);
        if let Some(l) = limits {
            session.limits = l;
        }
        let id = session.id.clone();
        self.sessions.insert(id.clone(), Arc::new(AsyncMutex::new(session)));
        id
    }

    pub fn forget_session(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.sessions.contains_key(id) || self.session_path(id).exists()
    }

    /// Resolve a session handle, loading it from disk on first touch if it
    /// isn't already resident in memory.
    pub fn load_or_create(&self, id: &str, role: Role) -> Arc<AsyncMutex<Session>> {
        if let Some(existing) = self.sessions.get(id) {
            return existing.clone();
        }
        let loaded = read_json::<Session>(&self.session_path(id)).ok().flatten();
        let session = loaded.unwrap_or_else(|| {
            let mut s = Session::new(role);
            s.id = id.to_string();
            s
        });
        let arc = Arc::new(AsyncMutex::new(session));
        self.sessions.insert(id.to_string(), arc.clone());
        arc
    }

    pub async fn snapshot(&self, id: &str) -> Option<Session> {
        let arc = self.sessions.get(id)?.clone();
        Some(arc.lock().await.clone())
    }

    fn session_arc(&self, id: &str) -> Result<Arc<AsyncMutex<Session>>> {
        self.sessions.get(id).map(|e| e.clone()).ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Buffered entry point: run one full turn and return the final text.
    pub async fn send(self: &Arc<Self>, session_id: &str, text: &str, cancel: CancellationToken) -> Result<TurnOutcome> {
        let session_arc = self.session_arc(session_id)?;
        let mut session = session_arc.lock().await;
        self.run_turn(session_id, &mut session, text, cancel, true, None).await
    }

    /// Streaming entry point: emits `TurnEvent`s as the turn progresses,
    /// then sends exactly one `Done` or `Error` before closing.
    pub async fn send_stream(
        self: &Arc<Self>,
        session_id: &str,
        text: &str,
        cancel: CancellationToken,
        events: mpsc::Sender<TurnEvent>,
    ) {
        let session_arc = match self.session_arc(session_id) {
            Ok(a) => a,
            Err(e) => {
                let _ = events.send(TurnEvent::Error(e.to_string())).await;
                return;
            }
        };
        let mut session = session_arc.lock().await;
        match self.run_turn(session_id, &mut session, text, cancel, true, Some(events.clone())).await {
            Ok(outcome) => {
                let _ = events.send(TurnEvent::Done(outcome)).await;
            }
            Err(e) => {
                let _ = events.send(TurnEvent::Error(e.to_string())).await;
            }
        }
    }

    /// Used by `ToolCtx::spawn_subagent` for a disposable sub-session that
    /// is never registered in the store or persisted to disk.
    async fn run_turn_standalone(self: &Arc<Self>, session: &mut Session, text: &str, cancel: CancellationToken) -> Result<TurnOutcome> {
        let id = session.id.clone();
        self.run_turn(&id, session, text, cancel, false, None).await
    }

    /// Runs one turn against a freshly constructed, never-registered
    /// session and returns both the outcome and the full message list
    /// (including any tool-call/tool-result turns), without persisting
    /// anything to disk. Used by the heartbeat ACT tier, which inspects
    /// tool results for error strings but must never save its scratch
    /// session.
    pub async fn run_disposable_turn(
        self: &Arc<Self>,
        role: Role,
        limits: SessionLimits,
        prompt: &str,
    ) -> Result<(TurnOutcome, Vec<Message>)> {
        let mut session = Session::new(role);
        session.limits = limits;
        let outcome = self.run_turn_standalone(&mut session, prompt, CancellationToken::new()).await?;
        Ok((outcome, session.messages))
    }

    async fn run_turn(
        self: &Arc<Self>,
        session_id: &str,
        session: &mut Session,
        text: &str,
        cancel: CancellationToken,
        persist: bool,
        events: Option<mpsc::Sender<TurnEvent>>,
    ) -> Result<TurnOutcome> {
        // Step 1: append the user turn.
        session.messages.push(Message::UserText { text: text.to_string() });
        session.touch();

        let today = local_date_string(chrono::Utc::now());

        // Step 2: consult the cost ledger; refuse outright if over budget.
        let budget = self.cost_ledger.lock().await.budget_check(&today);
        if !budget.ok {
            warn!(session = session_id, spend = budget.spend, limit = budget.limit, "refusing turn, over daily budget");
            let refusal = refusal_text(budget.spend, budget.limit);
            session.messages.push(Message::AssistantText { text: refusal.clone() });
            let outcome = TurnOutcome {
                content: refusal,
                model: self.providers.model_for(session.role.as_str()),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: "refused".to_string(),
            };
            if persist {
                self.persist(session_id, session)?;
            }
            return Ok(outcome);
        }

        let role = session.role.as_str().to_string();
        let tool_allow = session.outfit.as_ref().and_then(|o| o.tools.clone());
        let tool_defs = self.tools.definitions(tool_allow.as_ref());
        let tool_names = self.tools.all_names();
        let custom_names = self.tools.custom_names();

        let ctx = Arc::new(EngineToolCtx {
            session_id: session_id.to_string(),
            engine: Arc::clone(self),
            side_effects: AsyncMutex::new(SideEffects::default()),
        });

        let max_rounds = session.limits.max_tool_rounds;
        let mut last_response: Option<ChatResponse> = None;
        let mut final_outcome: Option<TurnOutcome> = None;

        for round in 0..max_rounds {
            if cancel.is_cancelled() {
                debug!(session = session_id, round, "turn cancelled before round start");
                append_marker(&mut session.messages, "\n[Cancelled]");
                final_outcome = Some(TurnOutcome {
                    content: last_text(&session.messages),
                    model: self.providers.model_for(&role),
                    tokens_in: 0,
                    tokens_out: 0,
                    stop_reason: "cancelled".to_string(),
                });
                break;
            }

            // Step 3: build the system prompt fresh for this round.
            let elapsed_ms = session.started_at.map(|s| s.elapsed().as_millis() as u64).unwrap_or(0);
            let tiers = self
                .identity
                .compose(PromptInputs {
                    default_role_model: &self.providers.model_for("default"),
                    today_spend_usd: budget.spend,
                    loaded_contexts: &session.contexts,
                    outfit: session.outfit.as_ref(),
                    task_plan: session.task_plan.as_ref(),
                    limits: &session.limits,
                    elapsed_ms,
                    spent_usd: session.metadata.cost.total_usd,
                    tool_names: &tool_names,
                    custom_tool_names: &custom_names,
                    user_turn: text,
                })
                .await;

            let raw_messages: Vec<serde_json::Value> = session.messages.iter().map(Message::to_raw_json).collect();
            let req = ChatRequest {
                model: self.providers.model_for(&role),
                system: tiers.to_plain_text(),
                system_prompt: Some(tiers),
                messages: Vec::new(),
                max_tokens: 4096,
                stream: false,
                tools: tool_defs.clone(),
                raw_messages: Some(raw_messages),
            };

            debug!(session = session_id, round, "tool loop iteration");

            // Step 4a/4b: invoke chat (streamed if a caller is listening) and bill usage.
            let response = if let Some(tx) = &events {
                self.stream_round(&role, &req, &today, tx).await?
            } else {
                self.providers.chat(&role, &req, &self.cost_ledger, &today).await?
            };

            let cost = self
                .cost_ledger
                .lock()
                .await
                .estimate_cost(&self.providers.provider_name_for(&role), &response.model, response.tokens_in as u64, response.tokens_out as u64);
            session.record_usage(response.tokens_in as u64, response.tokens_out as u64, cost);

            // Step 4c: cost ceiling / deadline enforcement.
            if let Some(ceiling) = session.limits.cost_ceiling_usd {
                if session.metadata.cost.total_usd >= ceiling {
                    push_assistant(&mut session.messages, &response);
                    append_marker(&mut session.messages, "\n[Cost ceiling reached]");
                    final_outcome = Some(outcome_for(&response, "cost_ceiling"));
                    last_response = Some(response);
                    break;
                }
            }
            if let Some(deadline_ms) = session.limits.deadline_ms {
                let elapsed_ms = session.started_at.map(|s| s.elapsed().as_millis() as u64).unwrap_or(0);
                if elapsed_ms >= deadline_ms {
                    push_assistant(&mut session.messages, &response);
                    append_marker(&mut session.messages, "\n[Time limit reached]");
                    final_outcome = Some(outcome_for(&response, "deadline"));
                    last_response = Some(response);
                    break;
                }
            }

            // Step 4d: no tool calls — final answer.
            if response.tool_calls.is_empty() || response.stop_reason != "tool_use" {
                info!(
                    session = session_id,
                    round,
                    tokens_in = response.tokens_in,
                    tokens_out = response.tokens_out,
                    model = %response.model,
                    "turn complete — no more tool calls"
                );
                session.messages.push(Message::AssistantText { text: response.content.clone() });
                final_outcome = Some(outcome_for(&response, &response.stop_reason.clone()));
                last_response = Some(response);
                break;
            }

            // Step 4e: execute all tool calls in parallel, then append the
            // assistant-with-tool-calls turn and the tool-result turn.
            let calls: Vec<ToolCallRecord> = response
                .tool_calls
                .iter()
                .map(|c| ToolCallRecord { id: c.id.clone(), name: c.name.clone(), arguments: c.input.clone() })
                .collect();

            if let Some(tx) = &events {
                for call in &calls {
                    let _ = tx.send(TurnEvent::ToolStart { id: call.id.clone(), name: call.name.clone() }).await;
                }
            }

            let tools = Arc::clone(&self.tools);
            let ctx_for_round = Arc::clone(&ctx);
            let results: Vec<(ToolCallRecord, ToolResult)> = join_all(calls.iter().cloned().map(|call| {
                let tools = Arc::clone(&tools);
                let ctx = Arc::clone(&ctx_for_round);
                async move {
                    let result = match tools.get(&call.name) {
                        Some(tool) => tool.execute(call.arguments.clone(), ctx.as_ref()).await,
                        None => ToolResult::error(format!("unknown tool: {}", call.name)),
                    };
                    (call, result)
                }
            }))
            .await;

            if let Some(tx) = &events {
                for (call, result) in &results {
                    let _ = tx
                        .send(TurnEvent::ToolResult { id: call.id.clone(), name: call.name.clone(), is_error: result.is_error })
                        .await;
                }
            }

            session.messages.push(Message::AssistantWithToolCalls {
                text: if response.content.is_empty() { None } else { Some(response.content.clone()) },
                calls,
            });

            let pairs: Vec<ToolResultPair> = results
                .into_iter()
                .map(|(call, result)| ToolResultPair { tool_call_id: call.id, content: result.content })
                .collect();
            session.messages.push(Message::UserToolResults { pairs });

            self.apply_side_effects(&ctx, session).await;

            last_response = Some(response);
        }

        let outcome = match final_outcome {
            Some(o) => o,
            None => {
                warn!(session = session_id, max_rounds, "tool loop hit maximum rounds");
                append_marker(&mut session.messages, "\n[Max tool rounds reached]");
                match &last_response {
                    Some(r) => outcome_for(r, "max_rounds"),
                    None => return Err(SessionError::MaxRoundsExceeded(max_rounds)),
                }
            }
        };

        // Step 5: compaction.
        let archive_path = self.archive_path(session_id);
        compact_if_needed(
            session_id,
            &mut session.messages,
            &archive_path,
            self.providers.as_ref(),
            &self.cost_ledger,
            &today,
            self.journal.as_ref(),
            &self.graph,
        )
        .await;

        // Step 6: persist atomically.
        if persist {
            self.persist(session_id, session)?;
        }

        Ok(outcome)
    }

    async fn stream_round(&self, role: &str, req: &ChatRequest, today: &str, tx: &mpsc::Sender<TurnEvent>) -> Result<ChatResponse> {
        let (inner_tx, mut inner_rx) = mpsc::channel(64);
        let providers = Arc::clone(&self.providers);
        let role_owned = role.to_string();
        let req_owned = req.clone();
        let today_owned = today.to_string();
        let ledger = Arc::clone(&self.cost_ledger);

        let drive = tokio::spawn(async move { providers.chat_stream(&role_owned, &req_owned, &ledger, &today_owned, inner_tx).await });

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut final_model = String::new();
        let mut tokens_in = 0u32;
        let mut tokens_out = 0u32;
        let mut stop_reason = "end_turn".to_string();

        while let Some(event) = inner_rx.recv().await {
            match event {
                StreamEvent::TextDelta { text } => {
                    content.push_str(&text);
                    let _ = tx.send(TurnEvent::TextDelta(text)).await;
                }
                StreamEvent::ToolUse { id, name, input } => {
                    tool_calls.push(vesper_provider::provider::ToolCall { id, name, input });
                    stop_reason = "tool_use".to_string();
                }
                StreamEvent::Done { model, tokens_in: ti, tokens_out: to, stop_reason: sr } => {
                    final_model = model;
                    tokens_in = ti;
                    tokens_out = to;
                    stop_reason = sr;
                }
                StreamEvent::Error { message } => {
                    return Err(SessionError::Provider(vesper_provider::provider::ProviderError::Parse(message)));
                }
            }
        }

        drive.await.map_err(|e| SessionError::Provider(vesper_provider::provider::ProviderError::Unavailable(e.to_string())))??;

        Ok(ChatResponse { content, model: final_model, tokens_in, tokens_out, stop_reason, tool_calls })
    }

    async fn apply_side_effects(&self, ctx: &EngineToolCtx, session: &mut Session) {
        let mut effects = ctx.side_effects.lock().await;
        for name in effects.contexts_to_load.drain(..) {
            if !session.contexts.contains(&name) {
                session.contexts.push(name);
            }
        }
        if let Some(change) = effects.outfit_change.take() {
            match change {
                Some(name) => match self.outfits.get(&name) {
                    Some(outfit) => session.outfit = Some(outfit.clone()),
                    None => warn!(outfit = name, "unknown outfit requested, leaving active outfit unchanged"),
                },
                None => session.outfit = None,
            }
        }
    }

    fn persist(&self, session_id: &str, session: &Session) -> Result<()> {
        let path = self.session_path(session_id);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        atomic_write_json(&path, session)?;
        Ok(())
    }
}

fn outcome_for(response: &ChatResponse, stop_reason: &str) -> TurnOutcome {
    TurnOutcome {
        content: response.content.clone(),
        model: response.model.clone(),
        tokens_in: response.tokens_in,
        tokens_out: response.tokens_out,
        stop_reason: stop_reason.to_string(),
    }
}

fn push_assistant(messages: &mut Vec<Message>, response: &ChatResponse) {
    if response.tool_calls.is_empty() {
        messages.push(Message::AssistantText { text: response.content.clone() });
    } else {
        let calls = response
            .tool_calls
            .iter()
            .map(|c| ToolCallRecord { id: c.id.clone(), name: c.name.clone(), arguments: c.input.clone() })
            .collect();
        messages.push(Message::AssistantWithToolCalls {
            text: if response.content.is_empty() { None } else { Some(response.content.clone()) },
            calls,
        });
    }
}

fn append_marker(messages: &mut Vec<Message>, marker: &str) {
    match messages.last_mut() {
        Some(Message::AssistantText { text }) => text.push_str(marker),
        Some(Message::AssistantWithToolCalls { text, .. }) => {
            text.get_or_insert_with(String::new).push_str(marker);
        }
        _ => messages.push(Message::AssistantText { text: marker.trim_start().to_string() }),
    }
}

fn last_text(messages: &[Message]) -> String {
    match messages.last() {
        Some(Message::AssistantText { text }) => text.clone(),
        Some(Message::AssistantWithToolCalls { text, .. }) => text.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vesper_core::collaborators::{JournalSection, MemoryRecall, VaultSearch};
    use vesper_core::config::{CostConfig, ProvidersConfig, RoleProviderConfig};
    use vesper_provider::provider::{ChatResponse, LlmProvider, ProviderError, SystemPromptTiers, ToolCall, ToolDefinition};
    use vesper_tools::ToolResult;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullJournal;
    #[async_trait]
    impl Journal for NullJournal {
        async fn ensure_today(&self) -> std::io::Result<()> {
            Ok(())
        }
        async fn append_entry(&self, _t: &str, _s: JournalSection) -> std::io::Result<()> {
            Ok(())
        }
        async fn read_today(&self) -> std::io::Result<String> {
            Ok(String::new())
        }
        async fn check_off_task(&self, _l: &str) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct NullVault;
    #[async_trait]
    impl VaultSearch for NullVault {
        async fn find_recent(&self, _d: &str, _m: u64) -> Vec<String> {
            Vec::new()
        }
        async fn search(&self, _q: &str, _m: usize) -> Vec<String> {
            Vec::new()
        }
    }

    struct NullMemory;
    #[async_trait]
    impl MemoryRecall for NullMemory {
        async fn recall(&self, _u: &str) -> Option<String> {
            None
        }
    }

    struct NullGraph;
    #[async_trait]
    impl GraphExtractor for NullGraph {
        async fn extract(&self, _s: &str, _m: &str, _d: serde_json::Value) {}
    }

    /// A scripted provider that calls one tool on its first turn, then
    /// finishes with plain text — covers the seed happy-path scenario.
    struct ScriptedProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, _req: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(ChatResponse {
                    content: "let me check".to_string(),
                    model: "scripted-model".to_string(),
                    tokens_in: 10,
                    tokens_out: 5,
                    stop_reason: "tool_use".to_string(),
                    tool_calls: vec![ToolCall { id: "t1".into(), name: "echo".into(), input: serde_json::json!({"text": "hi"}) }],
                })
            } else {
                Ok(ChatResponse {
                    content: "done".to_string(),
                    model: "scripted-model".to_string(),
                    tokens_in: 8,
                    tokens_out: 4,
                    stop_reason: "end_turn".to_string(),
                    tool_calls: vec![],
                })
            }
        }
    }

    struct EchoTool;
    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, input: serde_json::Value, _ctx: &dyn ToolCtx) -> ToolResult {
            ToolResult::success(input.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string())
        }
    }

    fn test_engine(dir: &std::path::Path) -> Arc<SessionEngine> {
        let mut roles = BTreeMap::new();
        roles.insert(
            "default".to_string(),
            RoleProviderConfig { kind: "scripted".to_string(), model: "scripted-model".to_string(), credential_key: None, base_url: None },
        );
        roles.insert(
            "quick".to_string(),
            RoleProviderConfig { kind: "scripted".to_string(), model: "scripted-model".to_string(), credential_key: None, base_url: None },
        );
        let mut provider_map: BTreeMap<String, Arc<dyn LlmProvider>> = BTreeMap::new();
        provider_map.insert("scripted:".to_string(), Arc::new(ScriptedProvider { calls: Arc::new(AtomicUsize::new(0)) }));
        let providers = ProviderRegistry::for_testing(ProvidersConfig { roles }, provider_map);

        let mut tools = ToolRegistry::new();
        let quarantine_dir = dir.join("quarantine");
        let tool_path = dir.join("echo.tool");
        std::fs::write(&tool_path, "stub").unwrap();
        tools.load_custom(&tool_path, Ok(Arc::new(EchoTool)), &quarantine_dir);

        let ledger = CostLedger::load(dir.join("cost.json"), CostConfig::default()).unwrap();
        let identity = IdentityComposer::new(
            Arc::new(NullJournal),
            Arc::new(NullVault),
            Arc::new(NullMemory),
            vec!["I am Vesper.".into()],
            "terse".into(),
            "## Rules".into(),
            None,
            None,
        );

        Arc::new(SessionEngine::new(
            Arc::new(providers),
            Arc::new(tools),
            Arc::new(AsyncMutex::new(ledger)),
            Arc::new(identity),
            Arc::new(NullJournal),
            Arc::new(NullGraph),
            dir.to_path_buf(),
        ))
    }

    /// Builds the same test engine as `test_engine`, but with the cost
    /// ledger pre-seeded by the caller and with the scripted provider's
    /// call counter handed back so a test can assert the provider was
    /// never invoked (the over-budget refusal path in `run_turn` must
    /// short-circuit before any `chat`/`send` call).
    fn test_engine_with_ledger(dir: &std::path::Path, ledger: CostLedger) -> (Arc<SessionEngine>, Arc<AtomicUsize>) {
        let mut roles = BTreeMap::new();
        roles.insert(
            "default".to_string(),
            RoleProviderConfig { kind: "scripted".to_string(), model: "scripted-model".to_string(), credential_key: None, base_url: None },
        );
        roles.insert(
            "quick".to_string(),
            RoleProviderConfig { kind: "scripted".to_string(), model: "scripted-model".to_string(), credential_key: None, base_url: None },
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let mut provider_map: BTreeMap<String, Arc<dyn LlmProvider>> = BTreeMap::new();
        provider_map.insert("scripted:".to_string(), Arc::new(ScriptedProvider { calls: calls.clone() }));
        let providers = ProviderRegistry::for_testing(ProvidersConfig { roles }, provider_map);

        let tools = ToolRegistry::new();
        let identity = IdentityComposer::new(
            Arc::new(NullJournal),
            Arc::new(NullVault),
            Arc::new(NullMemory),
            vec!["I am Vesper.".into()],
            "terse".into(),
            "## Rules".into(),
            None,
            None,
        );

        let engine = Arc::new(SessionEngine::new(
            Arc::new(providers),
            Arc::new(tools),
            Arc::new(AsyncMutex::new(ledger)),
            Arc::new(identity),
            Arc::new(NullJournal),
            Arc::new(NullGraph),
            dir.to_path_buf(),
        ));
        (engine, calls)
    }

    #[tokio::test]
    async fn tool_loop_happy_path_executes_tool_then_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let id = engine.create_session(Role::Default, None);

        let outcome = engine.send(&id, "please check something", CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.content, "done");
        assert_eq!(outcome.stop_reason, "end_turn");

        let snap = engine.snapshot(&id).await.unwrap();
        // user turn, assistant-with-tool-calls, tool results, final assistant text
        assert_eq!(snap.messages.len(), 4);
        assert!(matches!(snap.messages[1], Message::AssistantWithToolCalls { .. }));
        assert!(matches!(snap.messages[2], Message::UserToolResults { .. }));
        assert!(matches!(snap.messages[3], Message::AssistantText { .. }));

        // Turn was billed to the requesting role on both rounds.
        assert!(snap.metadata.cost.call_count >= 2);
    }

    #[tokio::test]
    async fn turn_persists_session_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let id = engine.create_session(Role::Default, None);
        engine.send(&id, "hello", CancellationToken::new()).await.unwrap();

        let path = dir.path().join("sessions").join(format!("{id}.json"));
        assert!(path.exists());
    }

    #[test]
    fn append_marker_appends_to_trailing_assistant_text() {
        let mut messages = vec![Message::AssistantText { text: "hello".into() }];
        append_marker(&mut messages, "\n[marker]");
        match &messages[0] {
            Message::AssistantText { text } => assert!(text.ends_with("[marker]")),
            _ => panic!("expected assistant text"),
        }
    }

    #[tokio::test]
    async fn create_and_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let id = engine.create_session(Role::Default, None);
        let snap = engine.snapshot(&id).await.unwrap();
        assert_eq!(snap.id, id);
        assert_eq!(snap.messages.len(), 0);
    }

    #[tokio::test]
    async fn unknown_session_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let result = engine.send("does-not-exist", "hi", CancellationToken::new()).await;
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn over_budget_turn_is_refused_without_calling_the_provider() {
        let dir = tempfile::tempdir().unwrap();
        let today = local_date_string(chrono::Utc::now());

        // Default daily limit is $2.00; seed today's spend to $2.01 via
        // 134,000 output tokens at the default $15/Mtok rate.
        let mut ledger = CostLedger::load(dir.path().join("cost.json"), CostConfig::default()).unwrap();
        ledger.record(&today, "default", "scripted", "scripted-model", 0, 134_000).unwrap();
        assert!((ledger.today_spend(&today) - 2.01).abs() < 1e-9);

        let (engine, calls) = test_engine_with_ledger(dir.path(), ledger);
        let id = engine.create_session(Role::Default, None);

        let outcome = engine.send(&id, "hi", CancellationToken::new()).await.unwrap();

        assert!(outcome.content.contains("2.01"), "refusal should mention today's spend: {}", outcome.content);
        assert!(outcome.content.contains("2.00"), "refusal should mention the daily limit: {}", outcome.content);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "provider must not be called when over budget");

        let snap = engine.snapshot(&id).await.unwrap();
        assert_eq!(snap.messages.len(), 2); // user turn + refusal
    }
}
