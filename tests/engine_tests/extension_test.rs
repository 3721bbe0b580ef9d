use async_trait::async_trait;
use scriptflow::{
    action::{registry, ActionContext, ActionError, ActionHandler, ActionRegistry, ActionResult, HandlerDependencies},
    config::EngineConfig,
    script::ActionConfig,
    Script, ScriptEngine, Session, SessionStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Runs a named skill by echoing its argument into a variable.
struct EchoSkill {
    skill: String,
    argument: String,
}

impl EchoSkill {
    fn from_config(action_id: &str, config: &ActionConfig) -> Result<Self, ActionError> {
        let skill = config
            .get("skill")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::configuration(format!("{action_id}: skill is required")))?;
        Ok(Self {
            skill: skill.to_string(),
            argument: config
                .get("argument")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

#[async_trait]
impl ActionHandler for EchoSkill {
    async fn execute(
        &self,
        context: &mut ActionContext,
        _user_input: Option<&str>,
    ) -> Result<ActionResult, ActionError> {
        let rendered = context.render(&self.argument);
        Ok(ActionResult::completed(Some(format!("[{}] {}", self.skill, rendered)))
            .with_variables([("skill_result".to_string(), json!(rendered))].into_iter().collect()))
    }
}

fn skill_script() -> Script {
    Script::from_json(
        r#"{"script_id": "skills", "variables": [{"name": "city", "scope": "session", "initial_value": "Kyoto"}],
            "phases": [{"phase_id": "p", "topics": [{"topic_id": "t", "actions": [
                {"action_id": "lookup", "action_type": "ai_use_skill", "skill": "weather", "argument": "{{city}}"}
            ]}]}]}"#,
    )
    .unwrap()
}

fn registry_with_skill() -> ActionRegistry {
    let registry = ActionRegistry::with_builtins(HandlerDependencies::default());
    registry.register("use_skill", |action_id, config| {
        Ok(Box::new(EchoSkill::from_config(action_id, config)?) as Box<dyn ActionHandler>)
    });
    registry
}

#[tokio::test]
async fn test_registered_use_skill_runs_without_engine_changes() {
    let engine = ScriptEngine::new(Arc::new(registry_with_skill()), EngineConfig::default());
    let script = skill_script();
    let mut session = Session::new("u", &script).unwrap();

    let outcome = engine.advance(&mut session, &script, &[], None).await.unwrap();
    assert_eq!(outcome.ai_message.as_deref(), Some("[weather] Kyoto"));
    assert_eq!(outcome.extracted_variables.get("skill_result"), Some(&json!("Kyoto")));
    assert_eq!(outcome.session_status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_unregistered_use_skill_is_a_configuration_error() {
    let engine = ScriptEngine::new(
        Arc::new(ActionRegistry::with_builtins(HandlerDependencies::default())),
        EngineConfig::default(),
    );
    let script = skill_script();
    let mut session = Session::new("u", &script).unwrap();
    let before = session.clone();

    let err = engine.advance(&mut session, &script, &[], None).await.unwrap_err();
    assert_eq!(err.kind(), scriptflow::action::ErrorKind::Configuration);
    assert!(!err.is_recoverable());
    assert_eq!(session, before);
}

#[test]
fn test_global_registry_installs_once() {
    let first = Arc::new(registry_with_skill());
    // 他のテストが先に設定していても良い
    let installed = registry::install_global(first.clone()).is_ok();
    let global = registry::global().unwrap();
    if installed {
        assert!(Arc::ptr_eq(&global, &first));
    }
    assert!(registry::install_global(Arc::new(ActionRegistry::new())).is_err());
    assert!(global.contains("ai_use_skill"));
}
