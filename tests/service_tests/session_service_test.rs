use async_trait::async_trait;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use scriptflow::{
    action::{ActionContext, ActionError, ActionHandler, ActionRegistry, ActionResult, HandlerDependencies},
    config::EngineConfig,
    repository::InMemoryRepository,
    service::RETRY_HINT,
    Error, ExecutionPosition, ExecutionStatus, Script, ScriptEngine, SessionService, SessionStatus,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

use crate::{greeting_script, GREETING_SCRIPT};

fn service_with(registry: ActionRegistry, config: EngineConfig, scripts: Vec<Script>) -> SessionService {
    let repo = Arc::new(InMemoryRepository::new());
    for script in scripts {
        repo.insert_script(script);
    }
    let engine = Arc::new(ScriptEngine::new(Arc::new(registry), config));
    SessionService::new(engine, repo.clone(), repo)
}

fn default_service() -> SessionService {
    service_with(
        ActionRegistry::with_builtins(HandlerDependencies::default()),
        EngineConfig::default(),
        vec![greeting_script()],
    )
}

struct Sleeper(Duration);

#[async_trait]
impl ActionHandler for Sleeper {
    async fn execute(
        &self,
        _context: &mut ActionContext,
        _user_input: Option<&str>,
    ) -> Result<ActionResult, ActionError> {
        tokio::time::sleep(self.0).await;
        Ok(ActionResult::completed(Some("done".to_string())))
    }
}

fn lines_script(count: usize) -> Script {
    let actions: Vec<_> = (0..count)
        .map(|i| json!({"action_id": format!("line{i}"), "action_type": "say", "content": format!("line {i}")}))
        .collect();
    serde_json::from_value(json!({
        "script_id": "lines",
        "phases": [{"phase_id": "p", "topics": [{"topic_id": "t", "actions": actions}]}]
    }))
    .unwrap()
}

#[tokio::test]
async fn test_greeting_through_service() {
    let service = default_service();
    let id = service.start_session("alice", "greeting").await.unwrap().session_id;

    service.advance(&id, None).await.unwrap();
    service.advance(&id, None).await.unwrap();
    let answered = service.advance(&id, Some("name: Alice")).await.unwrap();
    assert_eq!(answered.extracted_variables.get("name"), Some(&json!("Alice")));
    let last = service.advance(&id, None).await.unwrap();
    assert_eq!(last.session_status, SessionStatus::Completed);
    assert_eq!(last.ai_message, None);

    let contents: Vec<String> = service
        .history(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["Hello", "What is your name?", "name: Alice"]);
    assert!(GREETING_SCRIPT.contains("ask_name"));
}

#[tokio::test]
async fn test_concurrent_turns_on_one_session_are_serialized() {
    let service = Arc::new(service_with(
        ActionRegistry::with_builtins(HandlerDependencies::default()),
        EngineConfig::default(),
        vec![lines_script(6)],
    ));
    let id = service.start_session("u", "lines").await.unwrap().session_id;

    let turns = (0..6).map(|_| {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move { service.advance(&id, None).await })
    });
    let results = join_all(turns).await;

    let mut positions: Vec<ExecutionPosition> = results
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().position)
        .collect();
    positions.sort();
    positions.dedup();
    // 各ターンが前のターンの保存結果を読む
    assert_eq!(positions.len(), 6);

    let contents: Vec<String> = service
        .history(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    let expected: Vec<String> = (0..6).map(|i| format!("line {i}")).collect();
    assert_eq!(contents, expected);
    assert_eq!(
        service.session(&id).await.unwrap().status,
        SessionStatus::Completed
    );
}

#[tokio::test]
async fn test_independent_sessions_progress_in_parallel() {
    let service = Arc::new(default_service());
    let mut ids = Vec::new();
    for user in 0..8 {
        ids.push(
            service
                .start_session(&format!("user{user}"), "greeting")
                .await
                .unwrap()
                .session_id,
        );
    }

    let runs = ids.iter().cloned().map(|id| {
        let service = service.clone();
        async move {
            service.advance(&id, None).await?;
            service.advance(&id, None).await?;
            let answer = format!("name: U{}", &id[..4]);
            service.advance(&id, Some(answer.as_str())).await?;
            service.advance(&id, None).await
        }
    });
    for result in join_all(runs).await {
        assert_eq!(result.unwrap().session_status, SessionStatus::Completed);
    }
}

#[tokio::test]
async fn test_timeout_yields_retry_hint() {
    let registry = ActionRegistry::with_builtins(HandlerDependencies::default());
    registry.register("slow", |_, _| {
        Ok(Box::new(Sleeper(Duration::from_secs(5))) as Box<dyn ActionHandler>)
    });
    let script: Script = serde_json::from_value(json!({
        "script_id": "slow",
        "phases": [{"phase_id": "p", "topics": [{"topic_id": "t", "actions": [
            {"action_id": "wait", "action_type": "slow"}
        ]}]}]
    }))
    .unwrap();
    let config = EngineConfig {
        turn_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let service = service_with(registry, config, vec![script]);
    let id = service.start_session("u", "slow").await.unwrap().session_id;

    let response = service.advance(&id, None).await.unwrap();
    assert_eq!(response.retry_hint.as_deref(), Some(RETRY_HINT));
    assert_eq!(response.ai_message, None);
    assert_eq!(response.execution_status, ExecutionStatus::Error);
    assert_eq!(response.session_status, SessionStatus::Active);

    let stored = service.session(&id).await.unwrap();
    assert_eq!(stored.execution_status, ExecutionStatus::Error);
    assert!(service.history(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_configuration_error_is_returned_unsaved() {
    let script: Script = serde_json::from_value(json!({
        "script_id": "skill",
        "phases": [{"phase_id": "p", "topics": [{"topic_id": "t", "actions": [
            {"action_id": "lookup", "action_type": "use_skill"}
        ]}]}]
    }))
    .unwrap();
    let service = service_with(
        ActionRegistry::with_builtins(HandlerDependencies::default()),
        EngineConfig::default(),
        vec![script],
    );
    let session = service.start_session("u", "skill").await.unwrap();

    let err = service.advance(&session.session_id, None).await.unwrap_err();
    assert!(matches!(err, Error::Engine(_)));
    assert_eq!(service.session(&session.session_id).await.unwrap(), session);
}

#[tokio::test]
async fn test_misconfigured_action_fails_and_persists_session() {
    let script: Script = serde_json::from_value(json!({
        "script_id": "broken",
        "phases": [{"phase_id": "p", "topics": [{"topic_id": "t", "actions": [
            {"action_id": "q", "action_type": "ask", "variables": []}
        ]}]}]
    }))
    .unwrap();
    let service = service_with(
        ActionRegistry::with_builtins(HandlerDependencies::default()),
        EngineConfig::default(),
        vec![script],
    );
    let id = service.start_session("u", "broken").await.unwrap().session_id;

    let err = service.advance(&id, None).await.unwrap_err();
    assert!(matches!(err, Error::Engine(_)));
    let stored = service.session(&id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Failed);
    assert!(stored.last_error.unwrap().contains("needs a prompt"));

    // 以降のターンは拒否される
    let rejected = service.advance(&id, Some("hello?")).await.unwrap_err();
    assert!(matches!(rejected, Error::Engine(_)));
    assert!(service.history(&id).await.unwrap().is_empty());
    assert_eq!(service.active_locks(), 0);
}
