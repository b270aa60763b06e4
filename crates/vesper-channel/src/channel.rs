//! The common channel adapter interface, carrying the send/edit/delete
//! primitives the poller's streamed, edit-in-place replies need.

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::types::{ChannelStatus, MessageFormat};

/// Common interface implemented by every channel adapter (Telegram, …).
///
/// Implementations must be `Send + Sync` so an `Arc<dyn Channel>` can be
/// shared between [`crate::manager::ChannelManager`] (connection lifecycle)
/// and a [`crate::poller::ChannelPoller`]'s own long-polling task at the
/// same time. `connect`/`disconnect` take `&self`: every real transport
/// tracks its status through interior mutability, so no implementation
/// needs exclusive access.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier for this channel (e.g. `"telegram"`).
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), ChannelError>;
    async fn disconnect(&self) -> Result<(), ChannelError>;
    fn status(&self) -> ChannelStatus;

    async fn send_typing(&self, conversation_id: &str) -> Result<(), ChannelError>;

    /// Sends a new message, returning a platform-native message ID that can
    /// later be passed to `edit_text`/`delete_message`.
    async fn send_text(&self, conversation_id: &str, text: &str, format: MessageFormat) -> Result<String, ChannelError>;

    /// Edits a previously sent message in place.
    async fn edit_text(&self, conversation_id: &str, message_id: &str, text: &str, format: MessageFormat) -> Result<(), ChannelError>;

    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<(), ChannelError>;
}
