//! A raw Telegram Bot API transport built on `reqwest` long-polling, the
//! same HTTP client every other outbound call in the workspace already uses.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::poller::ChannelPoller;
use crate::types::{ChannelStatus, InboundMessage, MessageFormat};

const API_BASE: &str = "https://api.telegram.org";
/// Per-call timeout for responses; long-poll windows add their own timeout
/// on top of this.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TelegramTransport {
    http: reqwest::Client,
    token: String,
    status: RwLock<ChannelStatus>,
}

impl TelegramTransport {
    pub fn new(token: String) -> Self {
        Self { http: reqwest::Client::new(), token, status: RwLock::new(ChannelStatus::Connecting) }
    }

    fn url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }

    /// Long-polls `getUpdates`, advancing `offset` past the highest update
    /// ID seen so Telegram doesn't redeliver it. Swallows transport errors
    /// and returns an empty batch rather than propagating — the poll loop
    /// just retries on the next iteration.
    pub async fn poll_updates(&self, offset: &mut i64, timeout_secs: u64) -> Vec<InboundMessage> {
        let resp = self
            .http
            .get(self.url("getUpdates"))
            .query(&[("timeout", timeout_secs.to_string()), ("offset", offset.to_string())])
            .timeout(Duration::from_secs(timeout_secs + 10))
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "telegram getUpdates failed");
                return Vec::new();
            }
        };

        let body: GetUpdatesResponse = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "telegram getUpdates returned unparseable body");
                return Vec::new();
            }
        };

        let mut inbound = Vec::new();
        for update in body.result {
            *offset = (*offset).max(update.update_id + 1);
            let Some(message) = update.message else { continue };
            let Some(from) = message.from else { continue };
            if from.is_bot {
                continue;
            }
            let Some(text) = message.text else { continue };
            inbound.push(InboundMessage {
                channel: "telegram".to_string(),
                conversation_id: message.chat.id.to_string(),
                sender_id: from.id.to_string(),
                sender_name: from.username,
                content: text,
                timestamp: chrono::Utc::now().to_rfc3339(),
            });
        }
        inbound
    }

    /// Drives the long-polling loop until the process exits, handing every
    /// inbound message to `poller` sequentially. Never returns under normal
    /// operation; the caller is expected to spawn this as its own task.
    pub async fn run_poll_loop(self: Arc<Self>, poller: Arc<ChannelPoller>, timeout_secs: u64) {
        let mut offset = 0i64;
        loop {
            let updates = self.poll_updates(&mut offset, timeout_secs).await;
            for msg in updates {
                poller.handle_message(msg).await;
            }
        }
    }
}

#[async_trait]
impl Channel for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let resp = self
            .http
            .get(self.url("getMe"))
            .timeout(RESPONSE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ChannelError::Transport(format!("getMe returned {}", resp.status())));
        }
        *self.status.write().unwrap() = ChannelStatus::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        *self.status.write().unwrap() = ChannelStatus::Disconnected;
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        self.status.read().unwrap().clone()
    }

    async fn send_typing(&self, conversation_id: &str) -> Result<(), ChannelError> {
        self.http
            .post(self.url("sendChatAction"))
            .json(&serde_json::json!({"chat_id": conversation_id, "action": "typing"}))
            .timeout(RESPONSE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn send_text(&self, conversation_id: &str, text: &str, format: MessageFormat) -> Result<String, ChannelError> {
        let mut body = serde_json::json!({"chat_id": conversation_id, "text": text});
        if format == MessageFormat::Markdown {
            body["parse_mode"] = serde_json::Value::String("MarkdownV2".to_string());
        }
        let resp = self
            .http
            .post(self.url("sendMessage"))
            .json(&body)
            .timeout(RESPONSE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let parsed: SendMessageResponse = resp.json().await.map_err(|e| ChannelError::Transport(e.to_string()))?;
        if !parsed.ok {
            return Err(ChannelError::Transport(parsed.description.unwrap_or_else(|| "sendMessage failed".to_string())));
        }
        let message_id = parsed.result.map(|m| m.message_id).ok_or_else(|| ChannelError::Transport("missing message_id".to_string()))?;
        Ok(message_id.to_string())
    }

    async fn edit_text(&self, conversation_id: &str, message_id: &str, text: &str, format: MessageFormat) -> Result<(), ChannelError> {
        let mut body = serde_json::json!({"chat_id": conversation_id, "message_id": message_id, "text": text});
        if format == MessageFormat::Markdown {
            body["parse_mode"] = serde_json::Value::String("MarkdownV2".to_string());
        }
        let resp = self
            .http
            .post(self.url("editMessageText"))
            .json(&body)
            .timeout(RESPONSE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let parsed: SendMessageResponse = resp.json().await.map_err(|e| ChannelError::Transport(e.to_string()))?;
        if !parsed.ok {
            return Err(ChannelError::Transport(parsed.description.unwrap_or_else(|| "editMessageText failed".to_string())));
        }
        Ok(())
    }

    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<(), ChannelError> {
        self.http
            .post(self.url("deleteMessage"))
            .json(&serde_json::json!({"chat_id": conversation_id, "message_id": message_id}))
            .timeout(RESPONSE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<UpdateMessage>,
}

#[derive(Debug, Deserialize)]
struct UpdateMessage {
    chat: Chat,
    from: Option<User>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    ok: bool,
    description: Option<String>,
    result: Option<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}
