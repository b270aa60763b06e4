pub mod capabilities;
pub mod chat;
pub mod config;
pub mod costs;
pub mod creds;
pub mod crons;
pub mod heartbeat;
pub mod sessions;
pub mod status;
