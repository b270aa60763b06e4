//! The heartbeat and channel-poller loops the supervisor drives alongside
//! the HTTP panel and `vesper_cron::CronScheduler`. `CronScheduler` already
//! owns its own `tokio::select!` loop; heartbeat has none (its pipeline is
//! a bare `tick()`), so the interval-plus-hot-reload loop lives here, using
//! the same `watch::Receiver<bool>` shutdown shape for consistency.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use vesper_channel::{ChannelManager, ChannelPoller, ConversationMap, TelegramTransport};
use vesper_core::collaborators::CredentialStore;
use vesper_core::config::VesperConfig;
use vesper_core::types::Role;
use vesper_heartbeat::HeartbeatPipeline;
use vesper_session::SessionEngine;

/// Drives `heartbeat.tick()` on a timer, with an initial run after ~5s,
/// and hot-reloads the interval when the panel changes
/// `heartbeat.interval_secs`.
pub async fn run_heartbeat_timer(
    heartbeat: Arc<HeartbeatPipeline>,
    mut config_changes: watch::Receiver<VesperConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::time::sleep(Duration::from_secs(5)).await;
    heartbeat.tick().await;

    let mut interval_secs = config_changes.borrow().heartbeat.interval_secs;
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.tick().await; // consume the immediate first tick; we already ran one above

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                heartbeat.tick().await;
            }
            changed = config_changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let new_secs = config_changes.borrow().heartbeat.interval_secs;
                if new_secs != interval_secs {
                    info!(old = interval_secs, new = new_secs, "heartbeat interval changed, rescheduling timer");
                    interval_secs = new_secs;
                    ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
                    ticker.tick().await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("heartbeat timer shutting down");
                    break;
                }
            }
        }
    }
}

/// Start every configured channel's poller loop. A channel missing its
/// credential is logged and skipped, never fatal to the rest of startup.
pub async fn start_channels(
    config: &VesperConfig,
    data_dir: &std::path::Path,
    engine: Arc<SessionEngine>,
    credentials: &dyn CredentialStore,
) -> ChannelManager {
    let mut manager = ChannelManager::new();

    if let Some(telegram_cfg) = &config.channels.telegram {
        if telegram_cfg.enabled {
            match credentials.get(&telegram_cfg.credential_key) {
                Some(token) => {
                    match ConversationMap::load(data_dir.join("telegram-sessions.json")) {
                        Ok(map) => {
                            let sessions = Arc::new(map);
                            let transport = Arc::new(TelegramTransport::new(token));
                            let poller = Arc::new(ChannelPoller::new(
                                transport.clone(),
                                engine.clone(),
                                sessions,
                                telegram_cfg.allowlist.clone(),
                                Role::Default,
                            ));
                            let poll_timeout = telegram_cfg.poll_timeout_secs;
                            tokio::spawn({
                                let transport = transport.clone();
                                async move {
                                    transport.run_poll_loop(poller, poll_timeout).await;
                                }
                            });
                            manager.register(transport);
                        }
                        Err(err) => {
                            warn!(channel = "telegram", %err, "failed to load conversation map, skipping channel");
                        }
                    }
                }
                None => {
                    warn!(key = %telegram_cfg.credential_key, "telegram enabled but credential missing, skipping");
                }
            }
        }
    }

    manager.connect_all().await;
    manager
}
