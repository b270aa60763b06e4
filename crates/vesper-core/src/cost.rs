//! Cost ledger — per-role token→USD conversion, daily rollup, 30-day
//! retention, budget-gate query. Persisted atomically on every update.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::CostConfig;
use crate::error::Result;
use crate::persist::{atomic_write_json, read_json};

const RETENTION_DAYS: usize = 30;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoleTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DayEntry {
    pub total_usd: f64,
    pub call_count: u64,
    pub per_role: BTreeMap<String, RoleTotals>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostLedgerData {
    /// Keyed by local date "YYYY-MM-DD".
    pub days: BTreeMap<String, DayEntry>,
    /// (provider, model) -> (input $/Mtok, output $/Mtok), serialized as "provider:model".
    pub rates: BTreeMap<String, (f64, f64)>,
}

pub struct BudgetStatus {
    pub ok: bool,
    pub spend: f64,
    pub limit: f64,
    pub warning: bool,
}

pub struct CostLedger {
    path: PathBuf,
    data: CostLedgerData,
    config: CostConfig,
}

impl CostLedger {
    pub fn load(path: PathBuf, config: CostConfig) -> Result<Self> {
        let data = read_json(&path)?.unwrap_or_default();
        Ok(Self { path, data, config })
    }

    fn rate_for(&self, provider: &str, model: &str) -> (f64, f64) {
        self.data
            .rates
            .get(&format!("{}:{}", provider, model))
            .copied()
            .unwrap_or((
                self.config.default_input_price_per_mtok,
                self.config.default_output_price_per_mtok,
            ))
    }

    /// Record one call's usage. `today` is the caller-supplied local date
    /// string so tests can control the bucket without depending on the
    /// wall clock.
    pub fn record(
        &mut self,
        today: &str,
        role: &str,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<()> {
        let (in_rate, out_rate) = self.rate_for(provider, model);
        let cost = (input_tokens as f64 / 1_000_000.0) * in_rate
            + (output_tokens as f64 / 1_000_000.0) * out_rate;

        let entry = self.data.days.entry(today.to_string()).or_default();
        entry.total_usd += cost;
        entry.call_count += 1;
        let role_totals = entry.per_role.entry(role.to_string()).or_default();
        role_totals.input_tokens += input_tokens;
        role_totals.output_tokens += output_tokens;
        role_totals.cost_usd += cost;

        self.evict_old_days();
        self.persist()
    }

    fn evict_old_days(&mut self) {
        while self.data.days.len() > RETENTION_DAYS {
            // Evict lexicographically smallest key (oldest date, since
            // dates are formatted YYYY-MM-DD and sort lexicographically).
            if let Some(oldest) = self.data.days.keys().next().cloned() {
                self.data.days.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn persist(&self) -> Result<()> {
        atomic_write_json(&self.path, &self.data)
    }

    pub fn today_spend(&self, today: &str) -> f64 {
        self.data.days.get(today).map(|d| d.total_usd).unwrap_or(0.0)
    }

    pub fn budget_check(&self, today: &str) -> BudgetStatus {
        let spend = self.today_spend(today);
        BudgetStatus {
            ok: spend < self.config.daily_limit_usd,
            spend,
            limit: self.config.daily_limit_usd,
            warning: spend >= self.config.warn_threshold_usd,
        }
    }

    pub fn day(&self, date: &str) -> Option<&DayEntry> {
        self.data.days.get(date)
    }

    /// Marginal USD cost of one call, without recording it. Callers that
    /// need the per-call figure for display (e.g. a session's running cost
    /// summary) use this instead of re-deriving the rate table themselves.
    pub fn estimate_cost(&self, provider: &str, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let (in_rate, out_rate) = self.rate_for(provider, model);
        (input_tokens as f64 / 1_000_000.0) * in_rate + (output_tokens as f64 / 1_000_000.0) * out_rate
    }
}

/// Local calendar date as `YYYY-MM-DD`, used to key ledger buckets.
pub fn local_date_string(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> (tempfile::TempDir, CostLedger) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cost-log.json");
        let ledger = CostLedger::load(path, CostConfig::default()).unwrap();
        (dir, ledger)
    }

    #[test]
    fn records_and_sums_per_role() {
        let (_dir, mut ledger) = ledger();
        ledger
            .record("2026-01-01", "default", "anthropic", "claude-sonnet-4-5", 1_000_000, 1_000_000)
            .unwrap();
        ledger
            .record("2026-01-01", "quick", "anthropic", "claude-haiku-4-5", 1_000_000, 1_000_000)
            .unwrap();

        let day = ledger.day("2026-01-01").unwrap();
        assert_eq!(day.call_count, 2);
        let expected_total: f64 = day.per_role.values().map(|r| r.cost_usd).sum();
        assert!((day.total_usd - expected_total).abs() < 1e-9);
    }

    #[test]
    fn budget_check_flags_over_limit() {
        let (_dir, mut ledger) = ledger();
        // Push spend above the default $2.00 daily limit.
        ledger
            .record("2026-01-01", "default", "anthropic", "claude-sonnet-4-5", 1_000_000_000, 0)
            .unwrap();
        let status = ledger.budget_check("2026-01-01");
        assert!(!status.ok);
        assert!(status.warning);
    }

    #[test]
    fn retention_evicts_oldest_day() {
        let (_dir, mut ledger) = ledger();
        for day in 1..=35u32 {
            let date = format!("2026-01-{:02}", day.min(31));
            let date = if day > 31 {
                format!("2026-02-{:02}", day - 31)
            } else {
                date
            };
            ledger
                .record(&date, "default", "anthropic", "claude-sonnet-4-5", 1, 1)
                .unwrap();
        }
        assert!(ledger.data.days.len() <= RETENTION_DAYS);
    }

    #[test]
    fn persists_atomically_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cost-log.json");
        {
            let mut ledger = CostLedger::load(path.clone(), CostConfig::default()).unwrap();
            ledger
                .record("2026-01-01", "default", "anthropic", "claude-sonnet-4-5", 500, 500)
                .unwrap();
        }
        let reloaded = CostLedger::load(path, CostConfig::default()).unwrap();
        assert_eq!(reloaded.day("2026-01-01").unwrap().call_count, 1);
    }
}
