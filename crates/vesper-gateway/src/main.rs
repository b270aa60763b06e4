use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use vesper_core::collaborators::NullCollaborators;
use vesper_core::config::VesperConfig;
use vesper_core::cost::CostLedger;
use vesper_cron::{CronScheduler, CronStore};
use vesper_heartbeat::{HeartbeatPipeline, NullGithubSource};
use vesper_provider::registry::ProviderRegistry;
use vesper_session::{IdentityComposer, SessionEngine};
use vesper_tools::ToolRegistry;

mod app;
mod credentials;
mod http;
mod log_ring;
mod migrate;
mod pidfile;
mod supervisor;

use credentials::FileCredentialStore;
use log_ring::LogRing;

/// Same `~/.vesper` default `vesper_core::config::GatewayConfig` uses
/// internally; duplicated here because the overrides file path has to be
/// known before a `VesperConfig` exists to read it from.
fn bootstrap_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vesper")
}

fn init_tracing(log_ring: LogRing) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vesper_gateway=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    let ring_layer = tracing_subscriber::fmt::layer().with_ansi(false).with_target(false).with_writer(log_ring);

    tracing_subscriber::registry().with(stdout_layer).with(ring_layer).with(env_filter).init();
}

/// Read `identity/*.md` fragments in sorted file-name order. No corpus
/// precedent for this exact directory; it follows the identity composer's
/// own "always-loaded identity fragments" wording directly.
fn load_identity_fragments(data_dir: &std::path::Path) -> Vec<String> {
    let dir = data_dir.join("identity");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return vec![default_identity_fragment()];
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).filter(|p| p.extension().map(|e| e == "md").unwrap_or(false)).collect();
    paths.sort();
    let fragments: Vec<String> = paths.into_iter().filter_map(|p| std::fs::read_to_string(p).ok()).collect();
    if fragments.is_empty() {
        vec![default_identity_fragment()]
    } else {
        fragments
    }
}

fn default_identity_fragment() -> String {
    "You are Vesper, a long-lived personal agent. You act carefully, state what you did, and ask before anything irreversible.".to_string()
}

fn read_or_default(path: &std::path::Path, default: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|_| default.to_string())
}

const DEFAULT_PERSONALITY: &str = "Direct, terse, and warm. No filler, no apologizing for asking clarifying questions.";
const DEFAULT_RULES: &str = "## Rules\n- Never fabricate tool results.\n- Ask before destructive or irreversible actions.\n- Keep replies proportional to what was asked.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_ring = LogRing::new();
    init_tracing(log_ring.clone());

    let bootstrap_dir = bootstrap_data_dir();
    let bootstrap_overrides = bootstrap_dir.join("config.json");
    let mut config = VesperConfig::load(&bootstrap_overrides).unwrap_or_else(|e| {
        warn!(error = %e, "config load failed, using compiled defaults");
        VesperConfig::default()
    });

    let data_dir = config.gateway.data_dir.clone();
    let overrides_path = data_dir.join("config.json");

    // 1. Migrate data directory (one-time, idempotent).
    migrate::migrate_data_dir(&data_dir)?;

    // 2. Evict a stale prior instance, then claim the PID file.
    let pid_path = pidfile::default_pid_path(&data_dir);
    pidfile::evict_stale_instance(&pid_path).await;
    pidfile::write_pid_file(&pid_path)?;

    let credentials = Arc::new(FileCredentialStore::load(data_dir.join("credentials.json")));

    let providers = {
        let creds = credentials.clone();
        ProviderRegistry::new(config.providers.clone(), &move |name| creds.get(name))?
    };

    let tools = Arc::new(ToolRegistry::new());
    let cost_ledger = Arc::new(AsyncMutex::new(CostLedger::load(data_dir.join("cost-log.json"), config.cost.clone())?));

    let identity = Arc::new(IdentityComposer::new(
        Arc::new(NullCollaborators),
        Arc::new(NullCollaborators),
        Arc::new(NullCollaborators),
        load_identity_fragments(&data_dir),
        read_or_default(&data_dir.join("personality.md"), DEFAULT_PERSONALITY),
        read_or_default(&data_dir.join("rules.md"), DEFAULT_RULES),
        Some(data_dir.join("contexts")),
        Some(data_dir.join("skills")),
    ));

    let engine = Arc::new(SessionEngine::new(
        Arc::new(providers),
        tools.clone(),
        cost_ledger,
        identity,
        Arc::new(NullCollaborators),
        Arc::new(NullCollaborators),
        data_dir.clone(),
    ));

    let cron_store = Arc::new(AsyncMutex::new(CronStore::load(data_dir.join("crons.json"))?));
    let heartbeat = Arc::new(HeartbeatPipeline::new(
        engine.clone(),
        Arc::new(NullCollaborators),
        Arc::new(NullGithubSource),
        config.heartbeat.clone(),
        data_dir.clone(),
    ));

    // 4. Start any configured channel pollers (non-fatal if credentials missing).
    let channels = supervisor::start_channels(&config, &data_dir, engine.clone(), credentials.as_ref()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (config_tx, config_rx) = watch::channel(config.clone());

    // 5. Start the heartbeat timer; an initial tick fires after ~5s (inside the timer itself).
    tokio::spawn(supervisor::run_heartbeat_timer(heartbeat.clone(), config_rx, shutdown_rx.clone()));

    // 6. Start the cron timer at the configured cadence; trigger one initial tick after ~10s.
    let scheduler = Arc::new(CronScheduler::new(engine.clone(), cron_store.clone(), config.cron_tick_secs.max(1)));
    {
        let scheduler = scheduler.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            scheduler.run(shutdown_rx).await;
        });
    }

    let state = Arc::new(app::AppState {
        config: AsyncMutex::new(config.clone()),
        config_changes: config_tx,
        config_path: overrides_path,
        data_dir: data_dir.clone(),
        engine: engine.clone(),
        tools,
        cron_store,
        heartbeat,
        credentials,
        channels: AsyncMutex::new(channels),
        started_at: chrono::Utc::now(),
        log_ring,
    });

    let router = app::build_router(state.clone());

    // 3. Start the HTTP panel bound to loopback.
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "vesper gateway listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown_signal());

    if let Err(e) = server.await {
        error!(error = %e, "http server exited with error");
    }

    // 7. Graceful shutdown: stop timers, cancel pollers, remove the PID file.
    let _ = shutdown_tx.send(true);
    state.channels.lock().await.disconnect_all().await;
    pidfile::remove_pid_file(&pid_path);
    info!("vesper gateway shut down cleanly");

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
