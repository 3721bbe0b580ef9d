use async_trait::async_trait;
use pretty_assertions::assert_eq;
use scriptflow::{
    action::{ActionError, ErrorKind, HandlerDependencies, ThinkStrategy},
    config::EngineConfig,
    provider::{LlmConfig, LlmProvider, LlmResponse, ProviderError, ProviderResult, TextStream},
    variable::VariableLocation,
    EngineError, ExecutionPosition, ExecutionStatus, Script, Session, SessionStatus,
};
use serde_json::json;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{default_engine, engine_with, greeting_script};

/// Fails the first `failures` calls, then answers with a fixed JSON object.
struct FlakyProvider {
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyProvider {
    fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmProvider for FlakyProvider {
    async fn generate_text(&self, _prompt: &str, _config: &LlmConfig) -> ProviderResult<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::ApiError("upstream unavailable".to_string()));
        }
        Ok(LlmResponse::new(r#"{"mood": "calm"}"#, "flaky"))
    }

    async fn stream_text(&self, _prompt: &str, _config: &LlmConfig) -> ProviderResult<TextStream> {
        Err(ProviderError::Stream("not supported".to_string()))
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

fn mood_script() -> Script {
    Script::from_json(
        r#"{"script_id": "mood", "phases": [{"phase_id": "p", "topics": [{"topic_id": "t", "actions": [
            {"action_id": "hello", "action_type": "say", "content": "Hello"},
            {"action_id": "assess", "action_type": "think", "instruction": "Assess the mood",
             "output_variables": [{"name": "mood", "description": "user mood"}]},
            {"action_id": "bye", "action_type": "say", "content": "Bye"}
        ]}]}]}"#,
    )
    .unwrap()
}

fn llm_engine(provider: Arc<FlakyProvider>) -> scriptflow::ScriptEngine {
    engine_with(
        HandlerDependencies::default()
            .with_llm(provider)
            .with_think_strategy(ThinkStrategy::Llm),
        EngineConfig::default(),
    )
}

#[tokio::test]
async fn test_retry_after_provider_error_matches_single_success() {
    let script = mood_script();
    let location = VariableLocation::new("p", "t");

    let flaky = Arc::new(FlakyProvider::new(1));
    let engine = llm_engine(flaky.clone());
    let mut retried = Session::new("u", &script).unwrap();
    engine.advance(&mut retried, &script, &[], None).await.unwrap();

    let before = retried.clone();
    let err = engine.advance(&mut retried, &script, &[], None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Provider);
    assert!(err.is_recoverable());
    assert_eq!(retried.execution_status, ExecutionStatus::Error);
    assert_eq!(retried.position, before.position);
    assert_eq!(retried.variables, before.variables);
    assert_eq!(retried.status, SessionStatus::Active);

    engine.advance(&mut retried, &script, &[], None).await.unwrap();

    let engine = llm_engine(Arc::new(FlakyProvider::new(0)));
    let mut single = Session::new("u", &script).unwrap();
    engine.advance(&mut single, &script, &[], None).await.unwrap();
    engine.advance(&mut single, &script, &[], None).await.unwrap();

    assert_eq!(retried.position, single.position);
    assert_eq!(retried.position, ExecutionPosition::new(0, 0, 2));
    assert_eq!(
        retried.variables.flatten(&location),
        single.variables.flatten(&location)
    );
    let history = |s: &Session| s.variables.get(&location, "mood").map(|e| e.history.len());
    assert_eq!(history(&retried), history(&single));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_round_budget_exhaustion_is_recoverable() {
    let engine = default_engine();
    let script = greeting_script();
    let mut session = Session::new("u", &script).unwrap();
    engine.advance(&mut session, &script, &[], None).await.unwrap();
    engine.advance(&mut session, &script, &[], None).await.unwrap();

    // max_rounds = 2
    engine.advance(&mut session, &script, &[], Some("hmm")).await.unwrap();
    let err = engine
        .advance(&mut session, &script, &[], Some("no"))
        .await
        .unwrap_err();
    match &err {
        EngineError::Action { action_id, source, .. } => {
            assert_eq!(action_id, "ask_name");
            assert!(matches!(source, ActionError::RoundsExhausted { rounds: 2, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_recoverable());

    let round = session
        .action_state
        .as_ref()
        .and_then(|state| state.scratch.get("round"))
        .and_then(|value| value.as_u64());
    assert_eq!(round, Some(1));
    assert_eq!(session.position, ExecutionPosition::new(0, 0, 1));
    assert_eq!(session.status, SessionStatus::Active);

    // 予算内の最後の回答はまだ受け付ける
    let done = engine
        .advance(&mut session, &script, &[], Some("name: Carol"))
        .await
        .unwrap();
    assert_eq!(done.extracted_variables.get("name"), Some(&json!("Carol")));
}

#[tokio::test]
async fn test_state_inconsistency_closes_session() {
    let engine = default_engine();
    let script = greeting_script();
    let mut session = Session::new("u", &script).unwrap();
    session.position = ExecutionPosition::new(3, 0, 0);

    let err = engine.advance(&mut session, &script, &[], None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateInconsistency);
    assert!(!err.is_recoverable());
    assert_eq!(session.status, SessionStatus::Failed);

    let rejected = engine.advance(&mut session, &script, &[], None).await.unwrap_err();
    assert!(matches!(rejected, EngineError::SessionClosed { .. }));
}

#[tokio::test]
async fn test_script_mismatch_is_inconsistent() {
    let engine = default_engine();
    let mut session = Session::new("u", &greeting_script()).unwrap();
    let err = engine
        .advance(&mut session, &mood_script(), &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StateInconsistency { .. }));
}
