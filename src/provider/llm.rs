use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use super::types::ProviderResult;
use crate::{config::CommonConfig, timestamp::Timestamp};

/// Chunks of generated text, in order.
pub type TextStream = Pin<Box<dyn Stream<Item = ProviderResult<String>> + Send>>;

/// Text generation capability consumed by handlers and the extractor.
#[mockall::automock]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate_text(&self, prompt: &str, config: &LlmConfig) -> ProviderResult<LlmResponse>;

    async fn stream_text(&self, prompt: &str, config: &LlmConfig) -> ProviderResult<TextStream>;

    fn name(&self) -> &str;
}

/// Per-call generation settings. Unset fields fall back to the provider's
/// [`CommonConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
}

impl LlmConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn resolve(&self, defaults: &CommonConfig) -> CommonConfig {
        CommonConfig {
            model: self.model.clone().unwrap_or_else(|| defaults.model.clone()),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            frequency_penalty: self.frequency_penalty.unwrap_or(defaults.frequency_penalty),
            presence_penalty: self.presence_penalty.unwrap_or(defaults.presence_penalty),
        }
    }

    /// Reads the `llm` key of an action configuration, if present.
    pub fn from_action_config(config: &serde_json::Map<String, serde_json::Value>) -> Self {
        config
            .get("llm")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub metadata: ResponseMetadata,
}

impl LlmResponse {
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: ResponseMetadata {
                model: model.into(),
                created_at: Timestamp::now(),
                token_usage: None,
                finish_reason: None,
            },
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ResponseMetadata {
    pub model: String,
    pub created_at: Timestamp,
    pub token_usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

/// (prompt tokens, completion tokens)
pub type TokenUsage = (u32, u32);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_falls_back_to_provider_defaults() {
        let defaults = CommonConfig::default();
        let config = LlmConfig::default().with_temperature(0.1);
        let resolved = config.resolve(&defaults);
        assert_eq!(resolved.temperature, 0.1);
        assert_eq!(resolved.model, defaults.model);
        assert_eq!(resolved.max_tokens, 2000);
        assert_eq!(resolved.top_p, 1.0);
    }

    #[test]
    fn test_from_action_config() {
        let mut action_config = serde_json::Map::new();
        action_config.insert("llm".to_string(), json!({"model": "gpt-4o", "max_tokens": 64}));
        let config = LlmConfig::from_action_config(&action_config);
        assert_eq!(config.model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.max_tokens, Some(64));
        assert!(config.temperature.is_none());

        assert_eq!(
            LlmConfig::from_action_config(&serde_json::Map::new()),
            LlmConfig::default()
        );
    }

    #[tokio::test]
    async fn test_mock_provider() {
        let mut mock = MockLlmProvider::new();
        mock.expect_generate_text()
            .returning(|prompt, _| Ok(LlmResponse::new(format!("echo: {}", prompt), "mock")));
        let response = mock
            .generate_text("hello", &LlmConfig::default())
            .await
            .unwrap();
        assert_eq!(response.content, "echo: hello");
    }
}
