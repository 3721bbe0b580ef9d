use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::config::{ProviderConfig, ProviderConfigs, SecretConfig};

use super::{
    llm::{LlmConfig, LlmProvider, LlmResponse, TextStream},
    llms::{OpenAIChatProvider, SimpleExpertProvider},
    types::{ProviderError, ProviderResult, ProviderSecret},
    ProviderType,
};

// For Data in Registry
#[derive(Clone)]
pub struct ProviderInstance {
    pub config: ProviderConfig,
    pub provider: Arc<dyn LlmProvider>,
}

/// 名前付きLLMプロバイダーの管理
///
/// Implements [`LlmProvider`] itself by delegating to the primary provider,
/// so handlers never need to know which adapter is configured.
pub struct ProviderRegistry {
    configs: ProviderConfigs,
    secrets: SecretConfig,
    providers: Arc<DashMap<String, Arc<ProviderInstance>>>,
    primary_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(provider_configs: ProviderConfigs, secret_config: SecretConfig) -> Self {
        let primary_provider = Arc::new(RwLock::new(provider_configs.primary_provider.clone()));
        Self {
            configs: provider_configs,
            secrets: secret_config,
            providers: Arc::new(DashMap::new()),
            primary_provider,
        }
    }

    /// Creates and registers every configured provider.
    #[instrument(level = "debug", skip(self))]
    pub async fn register_providers(&self) -> ProviderResult<()> {
        for (name, config) in self.configs.providers.iter() {
            let provider = self.create_provider(name, config)?;
            self.register_provider_with(name, config, provider).await?;
        }
        Ok(())
    }

    fn create_provider(
        &self,
        name: &str,
        config: &ProviderConfig,
    ) -> ProviderResult<Arc<dyn LlmProvider>> {
        match config.provider_type {
            ProviderType::OpenAIChat => {
                // ローカルのOpenAI互換サーバーはキー無しでも動く
                let secret = self
                    .secrets
                    .providers
                    .get(name)
                    .cloned()
                    .map(ProviderSecret::from)
                    .unwrap_or_default();
                let mut provider = OpenAIChatProvider::new(name);
                provider.initialize(config, &secret)?;
                Ok(Arc::new(provider))
            }
            ProviderType::SimpleExpert => {
                let pairs = config
                    .provider_specific
                    .iter()
                    .filter_map(|(pattern, answer)| {
                        answer.as_str().map(|answer| (pattern.clone(), answer.to_string()))
                    });
                Ok(Arc::new(SimpleExpertProvider::from_pairs(name, pairs)))
            }
        }
    }

    pub async fn register_provider_with(
        &self,
        name: &str,
        config: &ProviderConfig,
        provider: Arc<dyn LlmProvider>,
    ) -> ProviderResult<()> {
        debug!(provider = name, "registering provider");
        let instance = ProviderInstance {
            provider,
            config: config.clone(),
        };
        self.providers.insert(name.to_string(), Arc::new(instance));
        Ok(())
    }

    /// デフォルトプロバイダーの設定
    #[instrument(level = "debug", skip(self))]
    pub async fn set_default_provider(&self, name: &str) -> ProviderResult<()> {
        if self.providers.contains_key(name) {
            let mut primary_provider = self.primary_provider.write().await;
            *primary_provider = Some(name.to_string());
            Ok(())
        } else {
            Err(ProviderError::ProviderNotFound(name.to_string()))
        }
    }

    pub async fn get_primary_provider_name(&self) -> ProviderResult<String> {
        self.primary_provider
            .read()
            .await
            .clone()
            .ok_or(ProviderError::PrimaryNameNotSet)
    }

    pub async fn get_primary_provider(&self) -> ProviderResult<Arc<ProviderInstance>> {
        let name = self.get_primary_provider_name().await?;
        self.get_provider(&name)
    }

    pub fn get_provider(&self, name: &str) -> ProviderResult<Arc<ProviderInstance>> {
        self.providers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProviderError::ProviderNotFound(name.to_string()))
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[async_trait]
impl LlmProvider for ProviderRegistry {
    #[instrument(level = "debug", skip(self, prompt, config))]
    async fn generate_text(&self, prompt: &str, config: &LlmConfig) -> ProviderResult<LlmResponse> {
        let instance = self.get_primary_provider().await?;
        instance.provider.generate_text(prompt, config).await
    }

    async fn stream_text(&self, prompt: &str, config: &LlmConfig) -> ProviderResult<TextStream> {
        let instance = self.get_primary_provider().await?;
        instance.provider.stream_text(prompt, config).await
    }

    fn name(&self) -> &str {
        "provider_registry"
    }
}
