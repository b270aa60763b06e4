use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: false }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { content: message.into(), is_error: true }
    }
}

/// Narrow capability view handed to tools that need to act on their hosting
/// session (load a context, switch outfit, spawn a sub-agent). The session
/// implements this trait and passes `&dyn ToolCtx` by borrow, which breaks
/// the session/tool ownership cycle without weak references.
#[async_trait]
pub trait ToolCtx: Send + Sync {
    fn session_id(&self) -> &str;

    /// Merge a named context's content into the active system prompt.
    async fn load_context(&self, name: &str) -> Result<(), String>;

    /// Switch the session's active outfit by name. `None` clears it.
    async fn set_outfit(&self, name: Option<&str>) -> Result<(), String>;

    /// Spawn a short-lived sub-agent session with a task prompt and strict
    /// cost/round limits, returning its final text.
    async fn spawn_subagent(&self, prompt: &str) -> Result<String, String>;
}

/// Trait that all tools must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, input: serde_json::Value, ctx: &dyn ToolCtx) -> ToolResult;
}
