//! Per-channel message handling. A `ChannelPoller` is driven by an
//! adapter's own inbound loop (e.g. Telegram long-polling); conversations
//! are handled **sequentially** by calling `handle_message` once per
//! inbound message in receipt order — the poller itself holds no internal
//! concurrency, so per-conversation ordering is always preserved.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use vesper_core::types::Role;
use vesper_session::{SessionEngine, TurnEvent};

use crate::allow;
use crate::channel::Channel;
use crate::format::{escape_markdown_v2, split_chunks_smart};
use crate::session_map::ConversationMap;
use crate::types::{InboundMessage, MessageFormat};

/// Outbound edits are coalesced and rate-limited to roughly once per this
/// interval.
const EDIT_INTERVAL: Duration = Duration::from_millis(1200);
/// Default per-message length limit; Telegram's hard cap is 4096, 4090
/// leaves safety margin for markdown escaping overhead.
const CHUNK_MAX: usize = 4090;

pub struct ChannelPoller {
    channel: Arc<dyn Channel>,
    engine: Arc<SessionEngine>,
    sessions: Arc<ConversationMap>,
    allowlist: Vec<String>,
    role: Role,
}

impl ChannelPoller {
    pub fn new(
        channel: Arc<dyn Channel>,
        engine: Arc<SessionEngine>,
        sessions: Arc<ConversationMap>,
        allowlist: Vec<String>,
        role: Role,
    ) -> Self {
        Self { channel, engine, sessions, allowlist, role }
    }

    pub async fn handle_message(&self, inbound: InboundMessage) {
        // Step 1: allowlist.
        if !allow::is_allowed(&self.allowlist, inbound.sender_name.as_deref().unwrap_or(""), &inbound.sender_id) {
            return;
        }

        let trimmed = inbound.content.trim();
        if trimmed.eq_ignore_ascii_case("/new") || trimmed.eq_ignore_ascii_case("/clear") {
            if let Err(e) = self.sessions.invalidate(&inbound.conversation_id) {
                warn!(error = %e, "failed to invalidate conversation mapping");
            }
            let _ = self.channel.send_text(&inbound.conversation_id, "Starting a fresh conversation.", MessageFormat::PlainText).await;
            return;
        }

        // Step 2: resolve/create the session.
        let session_id = match self.sessions.resolve_or_create(&inbound.conversation_id, &self.engine, self.role) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, code = e.code(), "failed to resolve conversation session");
                return;
            }
        };

        // Step 3: staleness-driven prompt rebuild bookkeeping. The engine
        // itself always recomputes the system prompt fresh per turn; this
        // only advances the bookkeeping timestamp.
        if self.sessions.is_prompt_stale(&inbound.conversation_id, chrono::Utc::now()) {
            self.sessions.note_prompt_rebuilt(&inbound.conversation_id);
        }

        // Step 4: typing indicator + streamed, coalesced, rate-limited reply.
        let _ = self.channel.send_typing(&inbound.conversation_id).await;

        let (tx, mut rx) = mpsc::channel(64);
        let engine = self.engine.clone();
        let sid = session_id.clone();
        let text = inbound.content.clone();
        let drive = tokio::spawn(async move {
            engine.send_stream(&sid, &text, CancellationToken::new(), tx).await;
        });

        let placeholder_id = self.channel.send_text(&inbound.conversation_id, "…", MessageFormat::PlainText).await.ok();
        let mut buffer = String::new();
        let mut last_edit = Instant::now() - EDIT_INTERVAL;
        let mut final_text: Option<String> = None;

        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::TextDelta(delta) => {
                    buffer.push_str(&delta);
                    if last_edit.elapsed() >= EDIT_INTERVAL {
                        if let Some(id) = &placeholder_id {
                            let _ = self.channel.edit_text(&inbound.conversation_id, id, &buffer, MessageFormat::PlainText).await;
                        }
                        last_edit = Instant::now();
                    }
                }
                TurnEvent::Done(outcome) => final_text = Some(outcome.content),
                TurnEvent::Error(e) => warn!(error = %e, "channel turn failed"),
                TurnEvent::ToolStart { .. } | TurnEvent::ToolResult { .. } => {}
            }
        }
        let _ = drive.await;

        // Step 5: final delivery with rich-formatting-then-plain fallback,
        // chunked and placeholder-deleted if it exceeds the length limit.
        let text = final_text.unwrap_or(buffer);
        self.deliver_final(&inbound.conversation_id, placeholder_id, &text).await;
    }

    async fn deliver_final(&self, conversation_id: &str, placeholder_id: Option<String>, text: &str) {
        let chunks = split_chunks_smart(text, CHUNK_MAX);

        if chunks.len() == 1 {
            if let Some(id) = &placeholder_id {
                if self.try_edit_rich(conversation_id, id, &chunks[0]).await.is_ok() {
                    return;
                }
            }
            let _ = self.try_send_rich(conversation_id, &chunks[0]).await;
            return;
        }

        if let Some(id) = &placeholder_id {
            let _ = self.channel.delete_message(conversation_id, id).await;
        }
        for chunk in &chunks {
            let _ = self.try_send_rich(conversation_id, chunk).await;
        }
    }

    async fn try_edit_rich(&self, conversation_id: &str, message_id: &str, text: &str) -> Result<(), crate::error::ChannelError> {
        let rich = escape_markdown_v2(text);
        if self.channel.edit_text(conversation_id, message_id, &rich, MessageFormat::Markdown).await.is_ok() {
            return Ok(());
        }
        self.channel.edit_text(conversation_id, message_id, text, MessageFormat::PlainText).await
    }

    async fn try_send_rich(&self, conversation_id: &str, text: &str) -> Result<String, crate::error::ChannelError> {
        let rich = escape_markdown_v2(text);
        match self.channel.send_text(conversation_id, &rich, MessageFormat::Markdown).await {
            Ok(id) => Ok(id),
            Err(_) => self.channel.send_text(conversation_id, text, MessageFormat::PlainText).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;
    use vesper_core::collaborators::NullCollaborators;
    use vesper_core::config::{CostConfig, ProvidersConfig, RoleProviderConfig};
    use vesper_core::cost::CostLedger;
    use vesper_provider::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
    use vesper_provider::registry::ProviderRegistry;
    use vesper_session::identity::IdentityComposer;
    use vesper_session::SessionEngine;
    use vesper_tools::ToolRegistry;

    #[derive(Debug, Clone)]
    enum Recorded {
        Send(String, String),
        Edit(String, String, String),
        Delete(String, String),
    }

    struct FakeChannel {
        calls: StdMutex<Vec<Recorded>>,
        next_id: AtomicUsize,
    }

    impl FakeChannel {
        fn new() -> Self {
            Self { calls: StdMutex::new(Vec::new()), next_id: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl Channel for FakeChannel {
        fn name(&self) -> &str {
            "fake"
        }
        async fn connect(&self) -> Result<(), crate::error::ChannelError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), crate::error::ChannelError> {
            Ok(())
        }
        fn status(&self) -> crate::types::ChannelStatus {
            crate::types::ChannelStatus::Connected
        }
        async fn send_typing(&self, _conversation_id: &str) -> Result<(), crate::error::ChannelError> {
            Ok(())
        }
        async fn send_text(&self, conversation_id: &str, text: &str, _format: MessageFormat) -> Result<String, crate::error::ChannelError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
            self.calls.lock().unwrap().push(Recorded::Send(conversation_id.to_string(), text.to_string()));
            Ok(id)
        }
        async fn edit_text(&self, conversation_id: &str, message_id: &str, text: &str, _format: MessageFormat) -> Result<(), crate::error::ChannelError> {
            self.calls.lock().unwrap().push(Recorded::Edit(conversation_id.to_string(), message_id.to_string(), text.to_string()));
            Ok(())
        }
        async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<(), crate::error::ChannelError> {
            self.calls.lock().unwrap().push(Recorded::Delete(conversation_id.to_string(), message_id.to_string()));
            Ok(())
        }
    }

    struct StubProvider;
    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        async fn send(&self, _req: &ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: "hello from vesper".to_string(),
                model: "stub-model".to_string(),
                tokens_in: 5,
                tokens_out: 3,
                stop_reason: "end_turn".to_string(),
                tool_calls: vec![],
            })
        }
    }

    fn test_engine(dir: &std::path::Path) -> Arc<SessionEngine> {
        let mut roles = BTreeMap::new();
        roles.insert(
            "default".to_string(),
            RoleProviderConfig { kind: "stub".to_string(), model: "stub-model".to_string(), credential_key: None, base_url: None },
        );
        let mut provider_map: BTreeMap<String, Arc<dyn LlmProvider>> = BTreeMap::new();
        provider_map.insert("stub:".to_string(), Arc::new(StubProvider));
        let providers = ProviderRegistry::for_testing(ProvidersConfig { roles }, provider_map);
        let ledger = CostLedger::load(dir.join("cost.json"), CostConfig::default()).unwrap();
        let identity = IdentityComposer::new(
            Arc::new(NullCollaborators),
            Arc::new(NullCollaborators),
            Arc::new(NullCollaborators),
            vec!["I am Vesper.".into()],
            "terse".into(),
            "## Rules".into(),
            None,
            None,
        );
        Arc::new(SessionEngine::new(
            Arc::new(providers),
            Arc::new(ToolRegistry::new()),
            Arc::new(AsyncMutex::new(ledger)),
            Arc::new(identity),
            Arc::new(NullCollaborators),
            Arc::new(NullCollaborators),
            dir.to_path_buf(),
        ))
    }

    fn test_poller(dir: &std::path::Path, channel: Arc<FakeChannel>, allowlist: Vec<String>) -> ChannelPoller {
        let engine = test_engine(dir);
        let sessions = Arc::new(ConversationMap::load(dir.join("fake-sessions.json")).unwrap());
        ChannelPoller::new(channel, engine, sessions, allowlist, Role::Default)
    }

    fn inbound(conversation_id: &str, sender_id: &str, content: &str) -> InboundMessage {
        InboundMessage {
            channel: "fake".to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: Some("alice".to_string()),
            content: content.to_string(),
            timestamp: "2026-07-29T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn disallowed_sender_is_silently_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(FakeChannel::new());
        let poller = test_poller(dir.path(), channel.clone(), vec!["42".to_string()]);

        poller.handle_message(inbound("c1", "999", "hi")).await;

        assert!(channel.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_command_invalidates_conversation_and_confirms() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(FakeChannel::new());
        let poller = test_poller(dir.path(), channel.clone(), vec!["*".to_string()]);

        poller.handle_message(inbound("c1", "1", "hello")).await;
        let sent_before = channel.calls.lock().unwrap().len();
        assert!(sent_before > 0);

        poller.handle_message(inbound("c1", "1", "/new")).await;

        let calls = channel.calls.lock().unwrap();
        match calls.last().unwrap() {
            Recorded::Send(_, text) => assert!(text.contains("fresh conversation")),
            other => panic!("expected a send, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn normal_message_sends_placeholder_then_final_reply() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(FakeChannel::new());
        let poller = test_poller(dir.path(), channel.clone(), vec!["*".to_string()]);

        poller.handle_message(inbound("c1", "1", "hello there")).await;

        let calls = channel.calls.lock().unwrap();
        assert!(calls.iter().any(|c| matches!(c, Recorded::Send(_, text) if text == "…")));
        assert!(calls.iter().any(|c| match c {
            Recorded::Edit(_, _, text) => text.contains("hello from vesper"),
            _ => false,
        }));
    }
}
