//! Layered configuration: compiled-in defaults, deep-merged with a user
//! overrides file, deep-merged with `VESPER_`-prefixed environment
//! variables. Write-through: panel mutations persist to the overrides file
//! atomically and broadcast a change event to subscribers.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Json};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Result, VesperError};
use crate::persist::atomic_write_json;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleProviderConfig {
    pub kind: String,
    pub model: String,
    pub credential_key: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvidersConfig {
    /// role -> provider config. Must always contain "default".
    pub roles: std::collections::BTreeMap<String, RoleProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        let mut roles = std::collections::BTreeMap::new();
        roles.insert(
            "default".to_string(),
            RoleProviderConfig {
                kind: "anthropic".to_string(),
                model: "claude-sonnet-4-5".to_string(),
                credential_key: Some("anthropic_api_key".to_string()),
                base_url: None,
            },
        );
        roles.insert(
            "quick".to_string(),
            RoleProviderConfig {
                kind: "anthropic".to_string(),
                model: "claude-haiku-4-5".to_string(),
                credential_key: Some("anthropic_api_key".to_string()),
                base_url: None,
            },
        );
        Self { roles }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub inbox_dir: Option<PathBuf>,
    pub sources: Vec<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15 * 60,
            inbox_dir: None,
            sources: vec!["inbox".to_string(), "tasks".to_string(), "github".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostConfig {
    pub daily_limit_usd: f64,
    pub warn_threshold_usd: f64,
    pub default_input_price_per_mtok: f64,
    pub default_output_price_per_mtok: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: 2.00,
            warn_threshold_usd: 1.50,
            default_input_price_per_mtok: 3.0,
            default_output_price_per_mtok: 15.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelegramConfig {
    pub enabled: bool,
    /// Telegram user IDs (as strings) allowed to talk to the bot. Empty
    /// means deny-by-default: nobody is allowed until configured.
    pub allowlist: Vec<String>,
    /// Name under which the bot token is stored in the credential vault.
    pub credential_key: String,
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowlist: Vec::new(),
            credential_key: "telegram_bot_token".to_string(),
            poll_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VesperConfig {
    pub gateway: GatewayConfig,
    pub providers: ProvidersConfig,
    pub heartbeat: HeartbeatConfig,
    pub cron_tick_secs: u64,
    pub cost: CostConfig,
    pub channels: ChannelsConfig,
}

fn default_cron_tick_secs() -> u64 {
    60
}

impl VesperConfig {
    /// Load layered config: compiled defaults, deep-merged with the
    /// on-disk overrides file (if present), deep-merged with
    /// `VESPER_`-prefixed environment variables.
    pub fn load(overrides_path: &Path) -> Result<Self> {
        let defaults = serde_json::to_value(Self::defaults())
            .map_err(VesperError::Serialization)?;

        let merged = match std::fs::read_to_string(overrides_path) {
            Ok(raw) => {
                let overrides: serde_json::Value = serde_json::from_str(&raw)?;
                let mut base = defaults;
                deep_merge(&mut base, &overrides);
                base
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => defaults,
            Err(e) => return Err(VesperError::Io(e)),
        };

        let figment = Figment::new()
            .merge(Json::string(&merged.to_string()))
            .merge(Env::prefixed("VESPER_").split("_"));

        figment
            .extract()
            .map_err(|e| VesperError::ConfigMissing(e.to_string()))
    }

    fn defaults() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            providers: ProvidersConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            cron_tick_secs: default_cron_tick_secs(),
            cost: CostConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }

    /// Deep-merge `patch` into this config and persist atomically to
    /// `overrides_path`, then broadcast the new value to `changes`.
    pub fn apply_patch(
        &mut self,
        patch: serde_json::Value,
        overrides_path: &Path,
        changes: &watch::Sender<VesperConfig>,
    ) -> Result<()> {
        let mut current = serde_json::to_value(&*self)?;
        deep_merge(&mut current, &patch);
        *self = serde_json::from_value(current.clone())
            .map_err(|e| VesperError::ConfigMissing(e.to_string()))?;
        atomic_write_json(overrides_path, &current)?;
        let _ = changes.send(self.clone());
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs_home().join(".vesper")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Recursively merge `src` into `dst`. Object keys recurse; any other
/// value (scalar, array, or type mismatch) is replaced wholesale by `src`.
///
/// Grounded in the recursive table-merge used for layered config files
/// elsewhere in the example pack, adapted here to operate on
/// `serde_json::Value` instead of YAML mappings.
pub fn deep_merge(dst: &mut serde_json::Value, src: &serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(dst_map), serde_json::Value::Object(src_map)) => {
            for (key, src_val) in src_map {
                let entry = dst_map
                    .entry(key.clone())
                    .or_insert(serde_json::Value::Null);
                deep_merge(entry, src_val);
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = json!({"a": 1});
        let src = json!({"a": 2});
        deep_merge(&mut dst, &src);
        assert_eq!(dst, json!({"a": 2}));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = json!({"a": 1, "b": 2});
        let src = json!({"a": 9});
        deep_merge(&mut dst, &src);
        assert_eq!(dst, json!({"a": 9, "b": 2}));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = json!({"outer": {"a": 1, "b": 2}});
        let src = json!({"outer": {"b": 3, "c": 4}});
        deep_merge(&mut dst, &src);
        assert_eq!(dst, json!({"outer": {"a": 1, "b": 3, "c": 4}}));
    }

    #[test]
    fn merge_is_idempotent() {
        let defaults = json!({"outer": {"a": 1}});
        let overrides = json!({"outer": {"a": 2, "b": 3}});
        let mut once = defaults.clone();
        deep_merge(&mut once, &overrides);
        let mut twice = once.clone();
        deep_merge(&mut twice, &overrides);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_with_empty_overrides_is_noop() {
        let defaults = json!({"a": 1, "b": {"c": 2}});
        let mut merged = defaults.clone();
        deep_merge(&mut merged, &json!({}));
        assert_eq!(merged, defaults);
    }

    #[test]
    fn load_with_no_overrides_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = VesperConfig::load(&path).unwrap();
        assert_eq!(cfg.gateway.port, 8787);
    }

    #[test]
    fn load_merges_overrides_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, json!({"gateway": {"port": 9999}}).to_string()).unwrap();
        let cfg = VesperConfig::load(&path).unwrap();
        assert_eq!(cfg.gateway.port, 9999);
        // untouched default preserved
        assert_eq!(cfg.gateway.host, "127.0.0.1");
    }
}
