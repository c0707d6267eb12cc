//! Per-user provider resolution. Maps stored provider configurations onto
//! live clients, cached per user and replaced wholesale on refresh so
//! concurrent readers never observe a half-updated set.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::llm::providers::{GeminiProvider, OpenAiCompatProvider};
use crate::core::llm::{LlmConfig, LlmProvider, ProviderError, ProviderKind};
use crate::storage::{ProviderConfigRecord, Storage, StorageError};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const LOCAL_BASE_URL: &str = "http://localhost:1234/v1";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no provider configured for user {user_id}")]
    NoProviderConfigured { user_id: String },
    #[error("provider {provider_id} not found")]
    ProviderNotFound { provider_id: String },
    #[error("unsupported provider type: {kind}")]
    UnsupportedProvider { kind: &'static str },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Client(#[from] ProviderError),
}

/// A live client paired with the configuration row it was built from; the
/// row supplies default model and generation parameters.
#[derive(Clone)]
pub struct ResolvedProvider {
    pub client: Arc<dyn LlmProvider>,
    pub config: ProviderConfigRecord,
}

impl fmt::Debug for ResolvedProvider {
    // The client is a trait object; identify it by name and show the config.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedProvider")
            .field("client", &self.client.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResolvedProvider {
    /// Build call settings from the config row, optionally overriding the
    /// model (e.g. a pipeline run pinned to a specific model).
    pub fn llm_config(&self, model_override: Option<&str>) -> LlmConfig {
        LlmConfig {
            model: model_override
                .map(str::to_string)
                .unwrap_or_else(|| self.config.default_model.clone()),
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            top_p: Some(self.config.top_p),
        }
    }
}

struct UserProviders {
    /// Live clients keyed by config id.
    clients: HashMap<String, Arc<dyn LlmProvider>>,
    /// Enabled config rows in stable creation order.
    configs: Vec<ProviderConfigRecord>,
}

pub struct ProviderRegistry {
    storage: Arc<Storage>,
    cache: RwLock<HashMap<String, Arc<UserProviders>>>,
}

impl ProviderRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Instantiate clients for every enabled config of `user_id`, replacing
    /// any prior cached set atomically. Configs whose type has no shipped
    /// client are skipped with a warning so they cannot poison the rest of
    /// the set.
    pub async fn load_user_providers(&self, user_id: &str) -> Result<(), RegistryError> {
        let rows = self.storage.enabled_provider_configs(user_id).await?;
        let mut clients = HashMap::new();
        let mut configs = Vec::new();
        for config in rows {
            match build_client(&config) {
                Ok(client) => {
                    clients.insert(config.id.clone(), client);
                    configs.push(config);
                }
                Err(e) => {
                    warn!(
                        "skipping provider config {} for user {}: {}",
                        config.id, user_id, e
                    );
                }
            }
        }
        info!(
            "loaded {} provider client(s) for user {}",
            clients.len(),
            user_id
        );
        self.cache
            .write()
            .await
            .insert(user_id.to_string(), Arc::new(UserProviders { clients, configs }));
        Ok(())
    }

    /// Drop and rebuild the cached client set for a user. Must be called
    /// after any create/update/delete of that user's provider configs;
    /// in-flight requests may still finish on the old clients.
    pub async fn refresh_user_providers(&self, user_id: &str) -> Result<(), RegistryError> {
        self.load_user_providers(user_id).await
    }

    /// Resolve `(user, provider id?)` to a live client. With an explicit id
    /// the lookup is exact; otherwise the user's primary config wins, then
    /// the first enabled config in creation order.
    pub async fn get_provider(
        &self,
        user_id: &str,
        provider_id: Option<&str>,
    ) -> Result<ResolvedProvider, RegistryError> {
        let set = self.user_set(user_id).await?;

        let config = match provider_id {
            Some(id) => set
                .configs
                .iter()
                .find(|c| c.id == id)
                .ok_or_else(|| RegistryError::ProviderNotFound {
                    provider_id: id.to_string(),
                })?,
            None => set
                .configs
                .iter()
                .find(|c| c.is_primary)
                .or_else(|| set.configs.first())
                .ok_or_else(|| RegistryError::NoProviderConfigured {
                    user_id: user_id.to_string(),
                })?,
        };

        let client = set
            .clients
            .get(&config.id)
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound {
                provider_id: config.id.clone(),
            })?;

        Ok(ResolvedProvider {
            client,
            config: config.clone(),
        })
    }

    /// Probe every cached client of a user and return the names of the ones
    /// answering their liveness check.
    pub async fn list_available(&self, user_id: &str) -> Result<Vec<String>, RegistryError> {
        let set = self.user_set(user_id).await?;
        let mut available = Vec::new();
        for config in &set.configs {
            if let Some(client) = set.clients.get(&config.id) {
                if client.is_available().await {
                    available.push(config.name.clone());
                }
            }
        }
        Ok(available)
    }

    async fn user_set(&self, user_id: &str) -> Result<Arc<UserProviders>, RegistryError> {
        if let Some(set) = self.cache.read().await.get(user_id) {
            return Ok(set.clone());
        }
        self.load_user_providers(user_id).await?;
        self.cache
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| RegistryError::NoProviderConfigured {
                user_id: user_id.to_string(),
            })
    }
}

/// Construct a live client for one config row. Unknown or unimplemented
/// vendor types fail fast here.
fn build_client(config: &ProviderConfigRecord) -> Result<Arc<dyn LlmProvider>, RegistryError> {
    let base_url = |default: &str| {
        config
            .base_url
            .clone()
            .unwrap_or_else(|| default.to_string())
    };
    let client: Arc<dyn LlmProvider> = match config.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiCompatProvider::new(
            "openai",
            base_url(OPENAI_BASE_URL),
            config.api_key.clone(),
        )?),
        ProviderKind::Mistral => Arc::new(OpenAiCompatProvider::new(
            "mistral",
            base_url(MISTRAL_BASE_URL),
            config.api_key.clone(),
        )?),
        ProviderKind::Groq => Arc::new(OpenAiCompatProvider::new(
            "groq",
            base_url(GROQ_BASE_URL),
            config.api_key.clone(),
        )?),
        ProviderKind::Local => Arc::new(OpenAiCompatProvider::new(
            "local",
            base_url(LOCAL_BASE_URL),
            config.api_key.clone(),
        )?),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(
            config.api_key.clone(),
            config.base_url.clone(),
        )?),
        ProviderKind::Anthropic => {
            return Err(RegistryError::UnsupportedProvider { kind: "anthropic" });
        }
    };
    Ok(client)
}
