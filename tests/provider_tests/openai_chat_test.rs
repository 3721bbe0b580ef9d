use scriptflow::{
    config::{ProviderConfig, RetryConfig},
    provider::{llms::OpenAIChatProvider, LlmConfig, LlmProvider, ProviderError, ProviderSecret},
};
use secrecy::SecretString;
use std::collections::HashMap;

use crate::should_run_external_api_tests;

fn provider_with_key(api_key: &str, retry: RetryConfig) -> OpenAIChatProvider {
    let config = ProviderConfig {
        name: "openai".to_string(),
        retry,
        ..ProviderConfig::default()
    };
    let secret = ProviderSecret {
        api_key: SecretString::from(api_key.to_string()),
        additional_auth: HashMap::new(),
    };
    let mut provider = OpenAIChatProvider::new("openai");
    provider.initialize(&config, &secret).unwrap();
    provider
}

#[tokio::test]
async fn test_uninitialized_provider_refuses() {
    let provider = OpenAIChatProvider::new("openai");
    let err = provider
        .generate_text("hello", &LlmConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Authentication(_)));
}

#[tokio::test]
async fn test_openai_generate_text() {
    if !should_run_external_api_tests() {
        return;
    }
    let api_key = std::env::var("OPENAI_API_KEY").unwrap();
    let provider = provider_with_key(&api_key, RetryConfig::default());
    let response = provider
        .generate_text(
            "Reply with the single word: pong",
            &LlmConfig::default().with_max_tokens(10),
        )
        .await
        .unwrap();
    assert!(response.content.to_lowercase().contains("pong"));
}

#[tokio::test]
async fn test_openai_invalid_key() {
    if !should_run_external_api_tests() {
        return;
    }
    let provider = provider_with_key("sk-invalid", RetryConfig::no_retry());
    let result = provider
        .generate_text("hello", &LlmConfig::default())
        .await;
    assert!(result.is_err());
}
