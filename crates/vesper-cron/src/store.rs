//! Cron job persistence — a flat `crons.json` file, using
//! `vesper_core::persist`'s atomic write-temp-then-rename helper.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vesper_core::persist::{atomic_write_json, read_json};

use crate::error::{CronError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub schedule: String,
    pub prompt: String,
    pub enabled: bool,
    pub role: String,
    pub last_run_iso: Option<String>,
    pub run_count: u64,
    pub last_error: Option<String>,
}

impl CronJob {
    pub fn new(name: impl Into<String>, schedule: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            name: name.into(),
            schedule: schedule.into(),
            prompt: prompt.into(),
            enabled: true,
            role: "quick".to_string(),
            last_run_iso: None,
            run_count: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CronStoreData {
    jobs: Vec<CronJob>,
}

pub struct CronStore {
    path: PathBuf,
    data: CronStoreData,
}

impl CronStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let data = read_json(&path)?.unwrap_or_default();
        Ok(Self { path, data })
    }

    pub fn list(&self) -> &[CronJob] {
        &self.data.jobs
    }

    pub fn add(&mut self, job: CronJob) -> Result<()> {
        self.data.jobs.push(job);
        self.persist()
    }

    pub fn remove(&mut self, id: &str) -> Result<()> {
        let before = self.data.jobs.len();
        self.data.jobs.retain(|j| j.id != id);
        if self.data.jobs.len() == before {
            return Err(CronError::NotFound(id.to_string()));
        }
        self.persist()
    }

    pub fn get(&self, id: &str) -> Option<&CronJob> {
        self.data.jobs.iter().find(|j| j.id == id)
    }

    /// Record the outcome of a fired job: advances `run_count`
    /// unconditionally and sets either a cleared or populated `last_error`.
    pub fn record_run(&mut self, id: &str, at_iso: &str, error: Option<String>) -> Result<()> {
        let job = self
            .data
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;
        job.last_run_iso = Some(at_iso.to_string());
        job.run_count += 1;
        job.last_error = error;
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        Ok(atomic_write_json(&self.path, &self.data)?)
    }
}
