use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;
use vesper_core::config::{ProvidersConfig, RoleProviderConfig};
use vesper_core::cost::CostLedger;
use vesper_core::error::{Result, VesperError};

use crate::anthropic::AnthropicProvider;
use crate::openai::OpenAiProvider;
use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
use crate::stream::StreamEvent;

/// Resolves a requesting role to its configured provider, falling back to
/// the `default` role when the role is unconfigured or names an unknown
/// provider kind. Every `chat` call is billed to the *requesting* role,
/// never the role whose provider actually served it.
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn LlmProvider>>,
    roles: ProvidersConfig,
}

impl ProviderRegistry {
    pub fn new(roles: ProvidersConfig, credentials: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let mut providers: BTreeMap<String, Arc<dyn LlmProvider>> = BTreeMap::new();

        for cfg in roles.roles.values() {
            let key = format!("{}:{}", cfg.kind, cfg.base_url.as_deref().unwrap_or(""));
            if providers.contains_key(&key) {
                continue;
            }
            if let Some(provider) = build_provider(cfg, credentials) {
                providers.insert(key, provider);
            }
        }

        if providers.is_empty() {
            return Err(VesperError::ConfigMissing(
                "no usable provider could be constructed from any configured role".into(),
            ));
        }

        Ok(Self { providers, roles })
    }

    /// Build a registry directly from a prepared provider map, bypassing
    /// `build_provider`'s kind-based construction. Used by other crates'
    /// tests to inject a scripted `LlmProvider` under a role.
    pub fn for_testing(roles: ProvidersConfig, providers: BTreeMap<String, Arc<dyn LlmProvider>>) -> Self {
        Self { providers, roles }
    }

    fn role_config(&self, role: &str) -> &RoleProviderConfig {
        self.roles
            .roles
            .get(role)
            .or_else(|| self.roles.roles.get("default"))
            .expect("default role must always be present in ProvidersConfig")
    }

    fn provider_for(&self, role: &str) -> Arc<dyn LlmProvider> {
        let cfg = self.role_config(role);
        let key = format!("{}:{}", cfg.kind, cfg.base_url.as_deref().unwrap_or(""));
        self.providers.get(&key).cloned().unwrap_or_else(|| {
            warn!(role, kind = %cfg.kind, "role's provider unavailable, falling back to default");
            let default_cfg = self.role_config("default");
            let default_key = format!(
                "{}:{}",
                default_cfg.kind,
                default_cfg.base_url.as_deref().unwrap_or("")
            );
            self.providers
                .get(&default_key)
                .cloned()
                .or_else(|| self.providers.values().next().cloned())
                .expect("registry must contain at least one provider")
        })
    }

    pub fn model_for(&self, role: &str) -> String {
        self.role_config(role).model.clone()
    }

    /// Sends a request on behalf of `role` and records the resulting token
    /// usage against `role` in the cost ledger, regardless of which
    /// provider actually served the fallback.
    pub async fn chat(
        &self,
        role: &str,
        req: &ChatRequest,
        ledger: &tokio::sync::Mutex<CostLedger>,
        today: &str,
    ) -> std::result::Result<ChatResponse, ProviderError> {
        let provider = self.provider_for(role);
        let resp = provider.send(req).await?;
        let mut ledger = ledger.lock().await;
        let _ = ledger.record(
            today,
            role,
            provider.name(),
            &resp.model,
            resp.tokens_in as u64,
            resp.tokens_out as u64,
        );
        Ok(resp)
    }

    pub fn provider_name_for(&self, role: &str) -> String {
        self.provider_for(role).name().to_string()
    }

    /// Streaming counterpart to `chat`: relays every event from the
    /// resolved provider to `tx`, billing the requesting role once the
    /// provider's `Done` event carries final usage.
    pub async fn chat_stream(
        &self,
        role: &str,
        req: &ChatRequest,
        ledger: &tokio::sync::Mutex<CostLedger>,
        today: &str,
        tx: mpsc::Sender<StreamEvent>,
    ) -> std::result::Result<(), ProviderError> {
        let provider = self.provider_for(role);
        let provider_name = provider.name().to_string();
        let role = role.to_string();
        let today = today.to_string();

        let (inner_tx, mut inner_rx) = mpsc::channel(64);
        let relay = async {
            while let Some(event) = inner_rx.recv().await {
                if let StreamEvent::Done { ref model, tokens_in, tokens_out, .. } = event {
                    let mut ledger = ledger.lock().await;
                    let _ = ledger.record(&today, &role, &provider_name, model, tokens_in as u64, tokens_out as u64);
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        };

        let (send_res, _) = tokio::join!(provider.send_stream(req, inner_tx), relay);
        send_res
    }
}

fn build_provider(
    cfg: &RoleProviderConfig,
    credentials: &dyn Fn(&str) -> Option<String>,
) -> Option<Arc<dyn LlmProvider>> {
    let api_key = cfg
        .credential_key
        .as_deref()
        .and_then(|name| credentials(name))
        .unwrap_or_default();

    match cfg.kind.as_str() {
        "anthropic" => Some(Arc::new(AnthropicProvider::new(api_key, cfg.base_url.clone()))),
        "openai" => Some(Arc::new(OpenAiProvider::new(api_key, cfg.base_url.clone()))),
        other => {
            warn!(kind = other, "unknown provider kind, role will fall back to default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_core::config::VesperConfig;

    #[test]
    fn unknown_role_falls_back_to_default_provider() {
        let cfg = VesperConfig::default().providers;
        let registry = ProviderRegistry::new(cfg, &|_| Some("test-key".to_string())).unwrap();
        assert_eq!(registry.provider_name_for("nonexistent-role"), "anthropic");
        assert_eq!(registry.model_for("nonexistent-role"), registry.model_for("default"));
    }

    #[test]
    fn known_role_resolves_its_own_model() {
        let cfg = VesperConfig::default().providers;
        let registry = ProviderRegistry::new(cfg, &|_| Some("test-key".to_string())).unwrap();
        assert_ne!(registry.model_for("quick"), registry.model_for("default"));
    }
}
