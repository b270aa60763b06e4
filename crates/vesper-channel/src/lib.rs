pub mod allow;
pub mod channel;
pub mod error;
pub mod format;
pub mod manager;
pub mod poller;
pub mod session_map;
pub mod telegram;
pub mod types;

pub use channel::Channel;
pub use error::{ChannelError, Result};
pub use manager::ChannelManager;
pub use poller::ChannelPoller;
pub use session_map::ConversationMap;
pub use telegram::TelegramTransport;
pub use types::{ChannelStatus, InboundMessage, MessageFormat};
