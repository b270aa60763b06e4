//! Per-minute tick loop, driven by a `tokio::select!` over an interval and
//! a shutdown signal; firing a job spawns a disposable chat session against
//! a JSON-file job store.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Local;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vesper_core::types::Role;
use vesper_session::SessionEngine;

use crate::expr::CronExpr;
use crate::store::CronStore;

/// Drives `CronStore` jobs against `SessionEngine` once per wall-clock
/// minute. Jobs with an unparseable `schedule` are logged and skipped
/// every tick rather than aborting the loop.
pub struct CronScheduler {
    engine: Arc<SessionEngine>,
    store: Arc<Mutex<CronStore>>,
    tick: std::time::Duration,
    /// Debounce: the minute boundary (`YYYY-MM-DDTHH:MM`, local) each job
    /// last fired on, so two ticks landing in the same minute never
    /// double-fire a job.
    last_fired_minute: Mutex<BTreeMap<String, String>>,
}

impl CronScheduler {
    pub fn new(engine: Arc<SessionEngine>, store: Arc<Mutex<CronStore>>, tick_secs: u64) -> Self {
        Self {
            engine,
            store,
            tick: std::time::Duration::from_secs(tick_secs),
            last_fired_minute: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("cron scheduler started");
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cron scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn tick_once(&self) {
        let now = Local::now();
        let minute_key = now.format("%Y-%m-%dT%H:%M").to_string();

        // Snapshot due jobs, then drop the store lock before running any of
        // them — a job's session turn may take seconds and must not stall
        // other callers of the store.
        let due: Vec<(String, String, String, String)> = {
            let store = self.store.lock().await;
            store
                .list()
                .iter()
                .filter(|j| j.enabled)
                .filter_map(|j| match CronExpr::parse(&j.schedule) {
                    Ok(expr) if expr.matches(now) => {
                        Some((j.id.clone(), j.prompt.clone(), j.role.clone(), j.schedule.clone()))
                    }
                    Ok(_) => None,
                    Err(e) => {
                        warn!(job_id = %j.id, error = %e, code = e.code(), "cron job has unparseable schedule, skipping");
                        None
                    }
                })
                .collect()
        };

        for (id, prompt, role, _schedule) in due {
            let mut fired = self.last_fired_minute.lock().await;
            if fired.get(&id).map(|m| m == &minute_key).unwrap_or(false) {
                continue;
            }
            fired.insert(id.clone(), minute_key.clone());
            drop(fired);

            self.fire(&id, &prompt, &role, now.to_rfc3339()).await;
        }
    }

    async fn fire(&self, job_id: &str, prompt: &str, role: &str, at_iso: String) {
        let role = Role::from_str(role).unwrap_or(Role::Quick);
        let session_id = self.engine.create_session(role, None);
        let result = self
            .engine
            .send(&session_id, prompt, CancellationToken::new())
            .await;
        self.engine.forget_session(&session_id);

        let error = match &result {
            Ok(_) => None,
            Err(e) => {
                error!(job_id, error = %e, "cron job turn failed");
                Some(e.to_string())
            }
        };

        let mut store = self.store.lock().await;
        if let Err(e) = store.record_run(job_id, &at_iso, error) {
            error!(job_id, error = %e, code = e.code(), "failed to record cron job run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CronJob;
    use std::path::PathBuf;
    use vesper_core::collaborators::NullCollaborators;
    use vesper_core::config::ProvidersConfig;
    use vesper_core::cost::CostLedger;
    use vesper_provider::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
    use vesper_provider::registry::ProviderRegistry;
    use vesper_provider::stream::StreamEvent;
    use vesper_session::identity::IdentityComposer;
    use vesper_tools::ToolRegistry;

    struct StubProvider;

    #[async_trait::async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: "done".into(),
                model: "stub-model".into(),
                tokens_in: 1,
                tokens_out: 1,
                stop_reason: "end_turn".into(),
                tool_calls: Vec::new(),
            })
        }
        async fn send_stream(
            &self,
            _req: &ChatRequest,
            _tx: tokio::sync::mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn test_engine(dir: &std::path::Path) -> Arc<SessionEngine> {
        let mut providers = BTreeMap::new();
        providers.insert(
            "stub:".to_string(),
            Arc::new(StubProvider) as Arc<dyn LlmProvider>,
        );
        let mut roles = ProvidersConfig::default();
        for cfg in roles.roles.values_mut() {
            cfg.kind = "stub".to_string();
        }
        let registry = Arc::new(ProviderRegistry::for_testing(roles, providers));
        let ledger = Arc::new(tokio::sync::Mutex::new(
            CostLedger::load(dir.join("cost-log.json"), Default::default()).unwrap(),
        ));
        let identity = Arc::new(IdentityComposer::new(
            Arc::new(NullCollaborators),
            Arc::new(NullCollaborators),
            Arc::new(NullCollaborators),
            Vec::new(),
            String::new(),
            String::new(),
            None,
            None,
        ));
        Arc::new(SessionEngine::new(
            registry,
            Arc::new(ToolRegistry::new()),
            ledger,
            identity,
            Arc::new(NullCollaborators),
            Arc::new(NullCollaborators),
            dir.to_path_buf(),
        ))
    }

    #[tokio::test]
    async fn fires_once_per_minute_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let store_path: PathBuf = dir.path().join("crons.json");
        let mut store = CronStore::load(store_path).unwrap();
        let mut job = CronJob::new("test", "* * * * *", "say hi");
        job.role = "stub".to_string();
        let id = job.id.clone();
        store.add(job).unwrap();
        let store = Arc::new(Mutex::new(store));

        let scheduler = Arc::new(CronScheduler::new(engine, store.clone(), 60));

        // First tick at a matching minute fires.
        scheduler.tick_once().await;
        assert_eq!(store.lock().await.get(&id).unwrap().run_count, 1);

        // A second tick landing in the same wall-clock minute must not
        // double-fire even though the expression still matches.
        scheduler.tick_once().await;
        assert_eq!(store.lock().await.get(&id).unwrap().run_count, 1);
    }
}
