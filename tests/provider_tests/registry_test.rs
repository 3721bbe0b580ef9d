use futures::StreamExt;
use scriptflow::{
    action::HandlerDependencies,
    config::{self, EngineConfig, SecretConfig},
    message::Message,
    provider::{
        llm::MockLlmProvider, LlmConfig, LlmProvider, LlmResponse, ProviderError,
        ProviderRegistry,
    },
    Script, Session,
};
use std::sync::Arc;

use crate::engine_with;

const EXPERT_CONFIG: &str = r#"{
    "provider_configs": {
        "primary_provider": "expert",
        "providers": {
            "expert": {
                "provider_type": "simple_expert",
                "name": "expert",
                "provider_specific": {
                    "weather": "It is sunny in Kyoto today",
                    "weather tomorrow": "Rain is expected tomorrow"
                }
            }
        }
    }
}"#;

async fn expert_registry() -> ProviderRegistry {
    let config: EngineConfig = config::from_str(EXPERT_CONFIG).unwrap();
    let registry = ProviderRegistry::new(config.provider_configs, SecretConfig::default());
    registry.register_providers().await.unwrap();
    registry
}

#[tokio::test]
async fn test_registry_delegates_to_primary() {
    let registry = expert_registry().await;
    assert_eq!(registry.get_primary_provider_name().await.unwrap(), "expert");

    let response = registry
        .generate_text("What about the weather tomorrow?", &LlmConfig::default())
        .await
        .unwrap();
    assert_eq!(response.content, "Rain is expected tomorrow");

    let err = registry
        .generate_text("Tell me a joke", &LlmConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::ApiError(_)));
}

#[tokio::test]
async fn test_registry_streams_words() {
    let registry = expert_registry().await;
    let chunks: Vec<String> = registry
        .stream_text("weather?", &LlmConfig::default())
        .await
        .unwrap()
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    assert_eq!(chunks.len(), 6);
    assert_eq!(chunks.concat(), "It is sunny in Kyoto today");
}

#[tokio::test]
async fn test_unknown_primary_is_reported() {
    let registry = expert_registry().await;
    let err = registry.set_default_provider("missing").await.unwrap_err();
    assert!(matches!(err, ProviderError::ProviderNotFound(_)));
}

#[tokio::test]
async fn test_say_rewrite_sees_recent_conversation() {
    let mut mock = MockLlmProvider::new();
    mock.expect_generate_text()
        .withf(|prompt, _| prompt.contains("user: I am back") && prompt.ends_with("Welcome back"))
        .times(1)
        .returning(|_, _| Ok(LlmResponse::new("Good to see you again!", "mock")));
    let engine = engine_with(
        HandlerDependencies::default().with_llm(Arc::new(mock)),
        EngineConfig::default(),
    );
    let script = Script::from_json(
        r#"{"script_id": "s", "phases": [{"phase_id": "p", "topics": [{"topic_id": "t", "actions": [
            {"action_id": "hello", "action_type": "say", "content": "Welcome back", "rewrite": true}
        ]}]}]}"#,
    )
    .unwrap();
    let mut session = Session::new("u", &script).unwrap();
    let history = vec![Message::user(&session.session_id, "I am back", "earlier")];

    let outcome = engine
        .advance(&mut session, &script, &history, None)
        .await
        .unwrap();
    assert_eq!(outcome.ai_message.as_deref(), Some("Good to see you again!"));
}
