//! The three-tier heartbeat tick, built from the session engine's
//! disposable-turn and persistent-session primitives, in the same
//! step-numbered-comment style `vesper_session::engine::run_turn` uses for
//! its own multi-step algorithm.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use tracing::{error, warn};

use vesper_core::collaborators::Journal;
use vesper_core::config::HeartbeatConfig;
use vesper_core::cost::local_date_string;
use vesper_core::persist::{atomic_write_json, read_json};
use vesper_core::types::Role;
use vesper_session::{Message, SessionEngine, SessionLimits};

use crate::error::Result;
use crate::sources::{
    normalized_event_key, scan_github, scan_inbox, scan_tasks, synthesize_idle_event, GithubSource,
};
use crate::types::{
    truncate, AuditEntry, HandledEvent, HeartbeatEvent, HeartbeatState, Outcome, Route, ToolCallAudit,
};

const MAX_AUDIT_ENTRIES: usize = 50;
const HEARTBEAT_SESSION_KEY: &str = "heartbeat-escalation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Ignore,
    Log,
    Alert,
    Act,
    Escalate,
}

impl Action {
    fn parse(s: &str) -> Option<Action> {
        match s.to_ascii_uppercase().as_str() {
            "IGNORE" => Some(Action::Ignore),
            "LOG" => Some(Action::Log),
            "ALERT" => Some(Action::Alert),
            "ACT" => Some(Action::Act),
            "ESCALATE" => Some(Action::Escalate),
            _ => None,
        }
    }
}

pub struct HeartbeatPipeline {
    engine: Arc<SessionEngine>,
    journal: Arc<dyn Journal>,
    github: Arc<dyn GithubSource>,
    config: HeartbeatConfig,
    data_dir: PathBuf,
    in_flight: AtomicBool,
}

impl HeartbeatPipeline {
    pub fn new(
        engine: Arc<SessionEngine>,
        journal: Arc<dyn Journal>,
        github: Arc<dyn GithubSource>,
        config: HeartbeatConfig,
        data_dir: PathBuf,
    ) -> Self {
        Self { engine, journal, github, config, data_dir, in_flight: AtomicBool::new(false) }
    }

    fn state_path(&self) -> PathBuf {
        self.data_dir.join("heartbeat-state.json")
    }

    fn audit_path(&self) -> PathBuf {
        self.data_dir.join("heartbeat-audit.json")
    }

    /// Reentrancy-guarded: a tick fired while one is already in flight is
    /// dropped silently, never queued.
    pub async fn tick(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("heartbeat tick already in flight, dropping this one");
            return;
        }
        if let Err(e) = self.tick_inner().await {
            error!(error = %e, code = e.code(), "heartbeat tick failed");
        }
        self.in_flight.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(&self) -> Result<()> {
        let now = Utc::now();
        let today = local_date_string(now);

        let _ = self.journal.ensure_today().await;
        let mut state: HeartbeatState = read_json(&self.state_path())?.unwrap_or_default();
        state.prune_handled_events(&today);

        // --- step 2: sources ---
        let mut events = Vec::new();

        if let Some(dir) = &self.config.inbox_dir {
            let since = state.last_inbox_check.as_ref().and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
            let since_systime: Option<SystemTime> = since.map(|dt| SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(dt.timestamp().max(0) as u64));
            events.extend(scan_inbox(dir, since_systime));
        }
        state.last_inbox_check = Some(now.to_rfc3339());

        let journal_text = self.journal.read_today().await.unwrap_or_default();
        events.extend(scan_tasks(&journal_text));

        let notifications = self.github.list_notifications().await;
        events.extend(scan_github(&notifications, &state.seen_github));
        for (id, _) in &notifications {
            state.remember_github(id.clone());
        }

        // --- step 3: idle awareness ---
        if events.is_empty() {
            if let Some(idle) = synthesize_idle_event(state.last_user_contact, now, Some(&journal_text), None, 0) {
                events.push(idle);
            }
        }

        // --- step 4: annotate & skip ---
        for event in &mut events {
            let key = normalized_event_key(&event.summary);
            if let Some(handled) = state.handled_events.get(&key) {
                event.prior_outcome = Some(crate::types::PriorOutcome {
                    date: handled.date.clone(),
                    outcome: handled.outcome,
                    attempts: handled.attempts,
                });
            }
        }

        if events.is_empty() {
            state.last_run = Some(now.to_rfc3339());
            atomic_write_json(&self.state_path(), &state)?;
            return Ok(());
        }

        // --- step 5: tier 1 triage ---
        let mut actions = vec![None::<Action>; events.len()];
        let mut to_triage = Vec::new();
        for (i, event) in events.iter().enumerate() {
            match event.route {
                Some(Route::Main) => actions[i] = Some(Action::Escalate),
                Some(Route::Act) => actions[i] = Some(Action::Act),
                None => to_triage.push(i),
            }
        }

        if !to_triage.is_empty() {
            let triaged = self.triage(&events, &to_triage).await;
            for (slot, idx) in to_triage.iter().enumerate() {
                actions[*idx] = Some(triaged.get(slot).copied().unwrap_or(Action::Log));
            }
        }

        let act_indices: Vec<usize> = (0..events.len()).filter(|i| actions[*i] == Some(Action::Act)).collect();
        let mut escalate_indices: Vec<usize> = (0..events.len()).filter(|i| actions[*i] == Some(Action::Escalate)).collect();

        // --- step 6: tier 2 (ACT) ---
        let mut act_outcome = Outcome::Acted;
        if !act_indices.is_empty() {
            let act_events: Vec<&HeartbeatEvent> = act_indices.iter().map(|i| &events[*i]).collect();
            match self.run_act_tier(&act_events, &journal_text).await {
                Ok(escalate_reason) => {
                    if let Some(_reason) = escalate_reason {
                        act_outcome = Outcome::ActCrashed;
                        escalate_indices.extend(act_indices.iter().copied());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "ACT tier crashed");
                    act_outcome = Outcome::ActCrashed;
                    escalate_indices.extend(act_indices.iter().copied());
                }
            }
        }

        // --- step 7: tier 3 (ESCALATE) ---
        escalate_indices.sort_unstable();
        escalate_indices.dedup();
        let mut escalation_failed = false;
        if !escalate_indices.is_empty() {
            let escalate_events: Vec<&HeartbeatEvent> = escalate_indices.iter().map(|i| &events[*i]).collect();
            if let Err(e) = self.run_escalate_tier(&escalate_events).await {
                warn!(error = %e, "ESCALATE tier crashed");
                escalation_failed = true;
            }
        }

        // --- step 8: bookkeeping ---
        let mut any_idle_handled = false;
        for (i, event) in events.iter().enumerate() {
            let in_escalate = escalate_indices.contains(&i);
            let in_act = act_indices.contains(&i) && !in_escalate;
            let outcome = if in_escalate {
                if escalation_failed { Outcome::EscalationFailed } else { Outcome::Escalated }
            } else if in_act {
                act_outcome
            } else {
                match actions[i] {
                    Some(Action::Alert) => Outcome::Alerted,
                    _ => Outcome::Ignored,
                }
            };

            let key = normalized_event_key(&event.summary);
            let attempts = state.handled_events.get(&key).map(|h| h.attempts + 1).unwrap_or(1);
            state.handled_events.insert(
                key,
                HandledEvent { date: today.clone(), outcome, attempts, last_attempt: now.to_rfc3339() },
            );

            if let Some(original) = &event.original_text {
                if matches!(outcome, Outcome::Acted | Outcome::Escalated) {
                    let _ = self.journal.check_off_task(original).await;
                }
            }

            if event.event_type == crate::types::EventType::Idle && matches!(outcome, Outcome::Acted | Outcome::Escalated | Outcome::Alerted) {
                any_idle_handled = true;
            }
        }

        if any_idle_handled {
            state.last_user_contact = Some(now.to_rfc3339());
        }

        state.last_run = Some(now.to_rfc3339());
        atomic_write_json(&self.state_path(), &state)?;
        Ok(())
    }

    async fn triage(&self, events: &[HeartbeatEvent], indices: &[usize]) -> Vec<Action> {
        let listing: Vec<serde_json::Value> = indices
            .iter()
            .enumerate()
            .map(|(slot, i)| {
                let e = &events[*i];
                serde_json::json!({
                    "index": slot,
                    "summary": e.summary,
                    "prior": e.prior_outcome.as_ref().map(|p| p.outcome.as_str()),
                })
            })
            .collect();

        let prompt = format!(
            "Classify each heartbeat event below. Respond with a JSON array of \
             {{\"event\": <index>, \"action\": one of IGNORE|LOG|ALERT|ACT|ESCALATE, \"reason\": <string>}}.\n\
             Events with a prior outcome of \"ignored\" and no new information should generally stay IGNORE.\n\n{}",
            serde_json::to_string_pretty(&listing).unwrap_or_default()
        );

        let session_id = self.engine.create_session(Role::Router, Some(SessionLimits::sub_agent()));
        let outcome = self.engine.send(&session_id, &prompt, tokio_util::sync::CancellationToken::new()).await;
        self.engine.forget_session(&session_id);

        let content = match outcome {
            Ok(o) => o.content,
            Err(e) => {
                warn!(error = %e, "triage call failed, defaulting all events to LOG");
                return vec![Action::Log; indices.len()];
            }
        };

        parse_triage_response(&content, indices.len())
    }

    /// Runs the disposable ACT-tier session. Returns `Ok(Some(reason))` if
    /// the events should bubble to escalation (tool errors, or the
    /// assistant's final text starts with `ESCALATE:`), `Ok(None)` on a
    /// clean run.
    async fn run_act_tier(&self, events: &[&HeartbeatEvent], journal_text: &str) -> Result<Option<String>> {
        let summaries: Vec<&str> = events.iter().map(|e| e.summary.as_str()).collect();
        let prompt = format!(
            "Act on the following events using the tools available to you. \
             Today's journal:\n{journal_text}\n\nEvents:\n- {}\n\n\
             If you cannot safely resolve these, reply starting with \"ESCALATE:\" and explain why.",
            summaries.join("\n- ")
        );

        let (outcome, messages) = self.engine.run_disposable_turn(Role::Quick, SessionLimits::sub_agent(), &prompt).await?;

        let mut tool_calls = Vec::new();
        let mut tool_errors = false;
        let mut results_by_id: std::collections::HashMap<String, String> = std::collections::HashMap::new();

        for msg in &messages {
            if let Message::AssistantWithToolCalls { calls, .. } = msg {
                for call in calls {
                    tool_calls.push((call.id.clone(), call.name.clone(), call.arguments.clone()));
                }
            }
            if let Message::UserToolResults { pairs } = msg {
                for pair in pairs {
                    if looks_like_tool_error(&pair.content) {
                        tool_errors = true;
                    }
                    results_by_id.insert(pair.tool_call_id.clone(), pair.content.clone());
                }
            }
        }

        let tool_call_audits: Vec<ToolCallAudit> = tool_calls
            .into_iter()
            .map(|(id, name, args)| {
                let result = results_by_id.get(&id).map(|c| truncate(c, 500)).unwrap_or_default();
                ToolCallAudit { tool: name, args, result }
            })
            .collect();

        self.append_audit(AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            tier: "act".to_string(),
            model: outcome.model.clone(),
            events: summaries.iter().map(|s| s.to_string()).collect(),
            tool_calls: tool_call_audits,
            response: truncate(&outcome.content, 500),
            tool_errors,
        })?;

        let escalate_prefix = outcome.content.trim_start().starts_with("ESCALATE:");
        if tool_errors || escalate_prefix {
            Ok(Some(format!("ACT failed: {}", truncate(&outcome.content, 200))))
        } else {
            Ok(None)
        }
    }

    async fn run_escalate_tier(&self, events: &[&HeartbeatEvent]) -> Result<()> {
        let summaries: Vec<&str> = events.iter().map(|e| e.summary.as_str()).collect();
        let prompt = format!(
            "The following events were escalated for your attention. Notify the user if there's \
             anything meaningful to report:\n- {}",
            summaries.join("\n- ")
        );

        // Resuming on first use: `load_or_create` registers the persistent
        // heartbeat session under a fixed key so every tick's escalation
        // continues the same conversation.
        self.engine.load_or_create(HEARTBEAT_SESSION_KEY, Role::Default);
        let outcome = self.engine.send(HEARTBEAT_SESSION_KEY, &prompt, tokio_util::sync::CancellationToken::new()).await?;

        self.append_audit(AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            tier: "escalate".to_string(),
            model: outcome.model,
            events: summaries.iter().map(|s| s.to_string()).collect(),
            tool_calls: Vec::new(),
            response: truncate(&outcome.content, 500),
            tool_errors: false,
        })?;
        Ok(())
    }

    fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        let mut log: Vec<AuditEntry> = read_json(&self.audit_path())?.unwrap_or_default();
        log.push(entry);
        if log.len() > MAX_AUDIT_ENTRIES {
            let overflow = log.len() - MAX_AUDIT_ENTRIES;
            log.drain(0..overflow);
        }
        atomic_write_json(&self.audit_path(), &log)?;
        Ok(())
    }
}

/// The ACT-tier error heuristic: a tool result counts as an error if it
/// case-insensitively contains any of `error`, `not found`, `failed`,
/// `no such file`. Brittle by nature — a future refinement could add a
/// structured error channel from executors instead.
fn looks_like_tool_error(content: &str) -> bool {
    let lower = content.to_ascii_lowercase();
    ["error", "not found", "failed", "no such file"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn parse_triage_response(content: &str, expected: usize) -> Vec<Action> {
    let Ok(parsed) = serde_json::from_str::<Vec<serde_json::Value>>(content.trim()) else {
        return vec![Action::Log; expected];
    };

    let mut actions = vec![Action::Log; expected];
    for item in parsed {
        let Some(idx) = item.get("event").and_then(|v| v.as_u64()).map(|v| v as usize) else {
            continue;
        };
        if idx >= expected {
            continue;
        }
        if let Some(action_str) = item.get("action").and_then(|v| v.as_str()) {
            if let Some(action) = Action::parse(action_str) {
                actions[idx] = action;
            }
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;
    use vesper_core::collaborators::{GraphExtractor, JournalSection, MemoryRecall, VaultSearch};
    use vesper_core::config::{CostConfig, ProvidersConfig, RoleProviderConfig};
    use vesper_core::cost::CostLedger;
    use vesper_provider::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
    use vesper_provider::registry::ProviderRegistry;
    use vesper_session::identity::IdentityComposer;
    use vesper_tools::ToolRegistry;

    #[test]
    fn parse_triage_response_defaults_on_bad_json() {
        let actions = parse_triage_response("not json", 2);
        assert_eq!(actions, vec![Action::Log, Action::Log]);
    }

    #[test]
    fn parse_triage_response_maps_by_index() {
        let raw = r#"[{"event":1,"action":"ESCALATE","reason":"x"},{"event":0,"action":"ACT","reason":"y"}]"#;
        let actions = parse_triage_response(raw, 2);
        assert_eq!(actions, vec![Action::Act, Action::Escalate]);
    }

    #[test]
    fn parse_triage_response_ignores_out_of_range_index() {
        let raw = r#"[{"event":5,"action":"ACT","reason":"y"}]"#;
        let actions = parse_triage_response(raw, 2);
        assert_eq!(actions, vec![Action::Log, Action::Log]);
    }

    struct InMemoryJournal {
        content: StdMutex<String>,
    }

    #[async_trait]
    impl Journal for InMemoryJournal {
        async fn ensure_today(&self) -> std::io::Result<()> {
            Ok(())
        }
        async fn append_entry(&self, text: &str, _section: JournalSection) -> std::io::Result<()> {
            self.content.lock().unwrap().push_str(text);
            Ok(())
        }
        async fn read_today(&self) -> std::io::Result<String> {
            Ok(self.content.lock().unwrap().clone())
        }
        async fn check_off_task(&self, original_line: &str) -> std::io::Result<()> {
            let mut guard = self.content.lock().unwrap();
            let checked = original_line.replacen("- [ ]", "- [x]", 1);
            *guard = guard.replace(original_line, &checked);
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

    struct NullGithub;
    #[async_trait]
    impl crate::sources::GithubSource for NullGithub {
        async fn list_notifications(&self) -> Vec<(String, String)> {
            Vec::new()
        }
    }

    /// Classifies the two untriaged events from the seed scenario: the
    /// inbox event always gets ACT, anything else (the untagged task) gets
    /// ESCALATE.
    struct RouterProvider;
    #[async_trait]
    impl LlmProvider for RouterProvider {
        fn name(&self) -> &str {
            "router-stub"
        }
        async fn send(&self, req: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            let text = &req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            let mut items = Vec::new();
            if text.contains("New inbox file") {
                items.push(serde_json::json!({"event": 0, "action": "ACT", "reason": "inbox event"}));
            }
            if text.contains("Open task") {
                items.push(serde_json::json!({"event": if text.contains("New inbox file") { 1 } else { 0 }, "action": "ESCALATE", "reason": "needs a human"}));
            }
            Ok(ChatResponse {
                content: serde_json::to_string(&items).unwrap(),
                model: "router-model".to_string(),
                tokens_in: 5,
                tokens_out: 5,
                stop_reason: "end_turn".to_string(),
                tool_calls: vec![],
            })
        }
    }

    struct ActProvider {
        calls: AtomicUsize,
    }
    #[async_trait]
    impl LlmProvider for ActProvider {
        fn name(&self) -> &str {
            "act-stub"
        }
        async fn send(&self, _req: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                content: "Handled without issue.".to_string(),
                model: "act-model".to_string(),
                tokens_in: 5,
                tokens_out: 5,
                stop_reason: "end_turn".to_string(),
                tool_calls: vec![],
            })
        }
    }

    struct EscalateProvider {
        calls: AtomicUsize,
    }
    #[async_trait]
    impl LlmProvider for EscalateProvider {
        fn name(&self) -> &str {
            "escalate-stub"
        }
        async fn send(&self, _req: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                content: "Notified the user.".to_string(),
                model: "escalate-model".to_string(),
                tokens_in: 5,
                tokens_out: 5,
                stop_reason: "end_turn".to_string(),
                tool_calls: vec![],
            })
        }
    }

    fn test_pipeline(dir: &std::path::Path, journal: Arc<InMemoryJournal>) -> HeartbeatPipeline {
        let mut roles = BTreeMap::new();
        roles.insert(
            "router".to_string(),
            RoleProviderConfig { kind: "router-stub".to_string(), model: "router-model".to_string(), credential_key: None, base_url: None },
        );
        roles.insert(
            "quick".to_string(),
            RoleProviderConfig { kind: "act-stub".to_string(), model: "act-model".to_string(), credential_key: None, base_url: None },
        );
        roles.insert(
            "default".to_string(),
            RoleProviderConfig { kind: "escalate-stub".to_string(), model: "escalate-model".to_string(), credential_key: None, base_url: None },
        );

        let mut provider_map: BTreeMap<String, Arc<dyn LlmProvider>> = BTreeMap::new();
        provider_map.insert("router-stub:".to_string(), Arc::new(RouterProvider));
        provider_map.insert("act-stub:".to_string(), Arc::new(ActProvider { calls: AtomicUsize::new(0) }));
        provider_map.insert("escalate-stub:".to_string(), Arc::new(EscalateProvider { calls: AtomicUsize::new(0) }));
        let providers = ProviderRegistry::for_testing(ProvidersConfig { roles }, provider_map);

        let tools = ToolRegistry::new();
        let ledger = CostLedger::load(dir.join("cost.json"), CostConfig::default()).unwrap();
        let identity = IdentityComposer::new(
            journal.clone(),
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
            journal.clone(),
            Arc::new(NullGraph),
            dir.to_path_buf(),
        ));

        HeartbeatPipeline::new(engine, journal, Arc::new(NullGithub), HeartbeatConfig::default(), dir.to_path_buf())
    }

    #[tokio::test]
    async fn three_tier_routing_splits_inbox_and_task_events() {
        let dir = tempfile::tempdir().unwrap();
        let inbox_dir = dir.path().join("inbox");
        std::fs::create_dir_all(&inbox_dir).unwrap();
        std::fs::write(inbox_dir.join("note.md"), "hello").unwrap();

        let journal = Arc::new(InMemoryJournal {
            content: StdMutex::new(
                "- [ ] restart the worker #act\n- [ ] reply to the landlord\n".to_string(),
            ),
        });

        let mut pipeline = test_pipeline(dir.path(), journal.clone());
        pipeline.config.inbox_dir = Some(inbox_dir);

        pipeline.tick().await;

        let final_journal = journal.content.lock().unwrap().clone();
        assert!(final_journal.contains("- [x] restart the worker #act"));
        assert!(final_journal.contains("- [x] reply to the landlord"));

        let state: HeartbeatState = read_json(&pipeline.state_path()).unwrap().unwrap();
        assert_eq!(state.handled_events.len(), 3);
        let outcomes: Vec<Outcome> = state.handled_events.values().map(|h| h.outcome).collect();
        assert!(outcomes.contains(&Outcome::Acted));
        assert!(outcomes.contains(&Outcome::Escalated));

        let audit: Vec<AuditEntry> = read_json(&pipeline.audit_path()).unwrap().unwrap();
        assert!(audit.iter().any(|e| e.tier == "act"));
        assert!(audit.iter().any(|e| e.tier == "escalate"));
    }
}
