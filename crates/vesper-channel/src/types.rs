//! Wire types shared by every channel adapter.

use serde::{Deserialize, Serialize};

/// A message received from an external channel (Telegram, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    /// Platform-native conversation identifier (chat ID, thread, …).
    pub conversation_id: String,
    /// Platform-native identifier for the sender.
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub timestamp: String,
}

/// Formatting hint for outbound message content.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    #[default]
    PlainText,
    Markdown,
}

/// Runtime connection state of a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Connected,
    Connecting,
    Disconnected,
    Error(String),
}
