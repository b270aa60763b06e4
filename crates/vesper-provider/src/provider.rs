use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::stream::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: ChatMessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// The three system-prompt cache tiers assembled by the identity composer
/// (static identity/rules, user-specific context, per-turn volatile block).
/// Dialect-specific serialization (Anthropic cache-control breakpoints vs.
/// a single plain `system` string) is confined to the provider module, per
/// the separation the design calls for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemPromptTiers {
    pub static_tier: String,
    pub user_tier: String,
    pub volatile_tier: String,
}

impl SystemPromptTiers {
    pub fn to_plain_text(&self) -> String {
        [&self.static_tier, &self.user_tier, &self.volatile_tier]
            .into_iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Anthropic content-block form with `cache_control` breakpoints on the
    /// first two (more stable) tiers; the volatile tier is uncached and last.
    pub fn to_anthropic_blocks(&self) -> Vec<serde_json::Value> {
        let mut blocks = Vec::new();
        if !self.static_tier.is_empty() {
            blocks.push(serde_json::json!({
                "type": "text",
                "text": self.static_tier,
                "cache_control": {"type": "ephemeral"},
            }));
        }
        if !self.user_tier.is_empty() {
            blocks.push(serde_json::json!({
                "type": "text",
                "text": self.user_tier,
                "cache_control": {"type": "ephemeral"},
            }));
        }
        if !self.volatile_tier.is_empty() {
            blocks.push(serde_json::json!({
                "type": "text",
                "text": self.volatile_tier,
            }));
        }
        blocks
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub system_prompt: Option<SystemPromptTiers>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub stream: bool,
    pub tools: Vec<ToolDefinition>,
    /// Pre-built dialect-neutral content-block messages (used by the tool
    /// loop once a conversation contains tool_use/tool_result blocks). When
    /// set, `messages` is ignored by the provider.
    pub raw_messages: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Rate limiting is the one case the router should not retry past its
    /// own backoff — the caller already knows how long to wait.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ProviderError::RateLimited { .. } | ProviderError::Cancelled)
    }
}

/// Uniform capability interface over heterogeneous model APIs. Each
/// implementation owns one wire dialect (A-dialect or O-dialect); the
/// session engine never branches on provider kind directly.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Default streaming implementation falls back to `send` and replays it
    /// as a single text delta plus `Done` — correct for providers with no
    /// native streaming support.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.send(req).await?;
        if !resp.content.is_empty() {
            let _ = tx
                .send(StreamEvent::TextDelta {
                    text: resp.content.clone(),
                })
                .await;
        }
        for call in &resp.tool_calls {
            let _ = tx
                .send(StreamEvent::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                })
                .await;
        }
        let _ = tx
            .send(StreamEvent::Done {
                model: resp.model,
                tokens_in: resp.tokens_in,
                tokens_out: resp.tokens_out,
                stop_reason: resp.stop_reason,
            })
            .await;
        Ok(())
    }
}
