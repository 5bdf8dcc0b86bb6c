//! Lazily-built provider clients, shared between raters.
//!
//! Two raters on the same provider entry (or on two entries with the same
//! credential and endpoint) get the same client. Clients are created on
//! first use and live as long as the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use judgekit_core::adapter::JudgeAdapter;
use judgekit_core::batch::BatchOrchestrator;
use judgekit_core::engine::Rater;
use judgekit_core::traits::{BatchBackend, CompletionProvider};

use crate::anthropic::AnthropicProvider;
use crate::config::{JudgekitConfig, ProviderConfig, ProviderKind, RaterMode};
use crate::error::ConfigError;
use crate::gemini::GeminiProvider;
use crate::openai::OpenAiProvider;

/// A constructed client. Providers with a batch API expose both halves.
#[derive(Clone)]
pub enum Client {
    Anthropic(Arc<AnthropicProvider>),
    Gemini(Arc<GeminiProvider>),
    OpenAi(Arc<OpenAiProvider>),
}

impl Client {
    pub fn completion(&self) -> Arc<dyn CompletionProvider> {
        match self {
            Client::Anthropic(p) => p.clone(),
            Client::Gemini(p) => p.clone(),
            Client::OpenAi(p) => p.clone(),
        }
    }

    pub fn batch(&self) -> Option<Arc<dyn BatchBackend>> {
        match self {
            Client::Anthropic(p) => Some(p.clone() as Arc<dyn BatchBackend>),
            Client::Gemini(p) => Some(p.clone() as Arc<dyn BatchBackend>),
            Client::OpenAi(_) => None,
        }
    }
}

/// SHA-256 over credential and endpoint, hex encoded. Keys never leave
/// this function in clear.
pub fn fingerprint(config: &ProviderConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.api_key().as_bytes());
    hasher.update([0u8]);
    hasher.update(config.base_url().unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn build(config: &ProviderConfig) -> Result<Client, ConfigError> {
    Ok(match config {
        ProviderConfig::Anthropic { api_key, base_url } => {
            Client::Anthropic(Arc::new(AnthropicProvider::new(api_key, base_url.clone())?))
        }
        ProviderConfig::Gemini { api_key, base_url } => {
            Client::Gemini(Arc::new(GeminiProvider::new(api_key, base_url.clone())?))
        }
        ProviderConfig::OpenAI {
            api_key,
            base_url,
            org_id,
        } => Client::OpenAi(Arc::new(OpenAiProvider::new(
            api_key,
            base_url.clone(),
            org_id.clone(),
        )?)),
    })
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<(ProviderKind, String), Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The client for `config`, built on first request.
    pub fn client(&self, config: &ProviderConfig) -> Result<Client, ConfigError> {
        let key = (config.kind(), fingerprint(config));
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| ConfigError::Invalid("client registry poisoned".into()))?;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        tracing::debug!(kind = ?key.0, "building provider client");
        let client = build(config)?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build every configured rater. Call after `validate_preconditions`.
    pub fn raters(&self, config: &JudgekitConfig) -> Result<Vec<Rater>, ConfigError> {
        let batch_config = config.batch.to_batch_config();
        config
            .raters
            .iter()
            .map(|rc| -> Result<Rater, ConfigError> {
                let provider = config.providers.get(&rc.provider).ok_or_else(|| {
                    ConfigError::UnknownProvider {
                        rater: rc.id.clone(),
                        provider: rc.provider.clone(),
                    }
                })?;
                let client = self.client(provider)?;
                match rc.mode {
                    RaterMode::Sync => Ok(Rater::sync(
                        JudgeAdapter::new(&rc.id, client.completion(), &rc.model)
                            .with_max_tokens(config.max_tokens),
                    )),
                    RaterMode::Batch => {
                        let backend = client.batch().ok_or_else(|| {
                            ConfigError::Invalid(format!(
                                "provider '{}' has no batch API",
                                rc.provider
                            ))
                        })?;
                        let orchestrator = BatchOrchestrator::new(backend, batch_config.clone());
                        Ok(Rater::batch(&rc.id, Arc::new(orchestrator), &rc.model))
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    const CONFIG: &str = r#"
[providers.claude-a]
type = "anthropic"
api_key = "same-key"

[providers.claude-b]
type = "anthropic"
api_key = "same-key"

[providers.gemini]
type = "gemini"
api_key = "other-key"

[providers.deepseek]
type = "openai"
api_key = "ds"
base_url = "https://api.deepseek.com"

[[raters]]
id = "claude"
provider = "claude-a"
model = "claude-haiku-4-5"
mode = "batch"

[[raters]]
id = "claude-sync"
provider = "claude-b"
model = "claude-haiku-4-5"

[[raters]]
id = "gemini"
provider = "gemini"
model = "gemini-2.5-pro"
mode = "batch"

[[raters]]
id = "deepseek"
provider = "deepseek"
model = "deepseek-chat"
"#;

    #[test]
    fn fingerprint_hides_key_and_separates_endpoints() {
        let config = parse_config(CONFIG).unwrap();
        let a = fingerprint(&config.providers["claude-a"]);
        assert_eq!(a.len(), 64);
        assert!(!a.contains("same-key"));
        assert_eq!(a, fingerprint(&config.providers["claude-b"]));

        let moved = ProviderConfig::Anthropic {
            api_key: "same-key".into(),
            base_url: Some("http://localhost:8080".into()),
        };
        assert_ne!(a, fingerprint(&moved));
    }

    #[test]
    fn clients_are_built_lazily_and_shared() {
        let config = parse_config(CONFIG).unwrap();
        let registry = ClientRegistry::new();
        assert!(registry.is_empty());

        let raters = registry.raters(&config).unwrap();
        let ids: Vec<&str> = raters.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["claude", "claude-sync", "gemini", "deepseek"]);
        // claude-a and claude-b share one client.
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn batch_mode_on_chat_only_provider_fails() {
        let mut config = parse_config(CONFIG).unwrap();
        config.raters[3].mode = RaterMode::Batch;
        let err = ClientRegistry::new().raters(&config).err().unwrap();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
