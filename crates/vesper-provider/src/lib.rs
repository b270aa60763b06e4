pub mod anthropic;
pub mod anthropic_stream;
pub mod openai;
pub mod openai_stream;
pub mod provider;
pub mod registry;
pub mod stream;

pub use provider::{
    ChatMessageRole, ChatRequest, ChatResponse, LlmProvider, Message, ProviderError,
    SystemPromptTiers, ToolCall, ToolDefinition,
};
pub use registry::ProviderRegistry;
pub use stream::StreamEvent;
