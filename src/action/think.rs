use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::handler::{config_str, ActionContext, ActionError, ActionHandler, ActionResult};
use crate::{
    script::ActionConfig,
    variable::{ExtractionError, ValueType, VariableExtractor, VariableSpec, VariableValues},
};

/// How `think` derives its variables.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ThinkStrategy {
    /// Fills configured values, or placeholders, without calling a model.
    #[default]
    Reduced,
    Llm,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct ThinkOutput {
    name: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default, alias = "type")]
    value_type: ValueType,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_true")]
    required: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OutputEntry {
    Name(String),
    Full(ThinkOutput),
}

fn parse_outputs(action_id: &str, config: &ActionConfig) -> Result<Vec<ThinkOutput>, ActionError> {
    let mut outputs = match config.get("output_variables") {
        Some(value) => serde_json::from_value::<Vec<OutputEntry>>(value.clone())
            .map_err(|e| {
                ActionError::configuration(format!(
                    "invalid output_variables for think action '{}': {}",
                    action_id, e
                ))
            })?
            .into_iter()
            .map(|entry| match entry {
                OutputEntry::Name(name) => ThinkOutput {
                    name,
                    value: None,
                    value_type: ValueType::Text,
                    description: None,
                    required: true,
                },
                OutputEntry::Full(output) => output,
            })
            .collect(),
        None => Vec::new(),
    };
    // {"outputs": {"mood": "neutral"}} 形式
    if let Some(Value::Object(map)) = config.get("outputs") {
        for (name, value) in map {
            outputs.push(ThinkOutput {
                name: name.clone(),
                value: Some(value.clone()),
                value_type: ValueType::infer(value),
                description: None,
                required: true,
            });
        }
    }
    Ok(outputs)
}

/// Placeholder written when no value is configured.
pub fn placeholder_value(name: &str) -> Value {
    Value::String(format!("[derived {}]", name))
}

/// Model free `think`: every output gets its configured value or a placeholder.
pub struct ReducedThinkHandler {
    outputs: Vec<ThinkOutput>,
}

impl ReducedThinkHandler {
    pub fn from_config(action_id: &str, config: &ActionConfig) -> Result<Self, ActionError> {
        Ok(Self {
            outputs: parse_outputs(action_id, config)?,
        })
    }
}

#[async_trait]
impl ActionHandler for ReducedThinkHandler {
    async fn execute(
        &self,
        context: &mut ActionContext,
        _user_input: Option<&str>,
    ) -> Result<ActionResult, ActionError> {
        let variables: VariableValues = self
            .outputs
            .iter()
            .map(|output| {
                let value = match &output.value {
                    Some(Value::String(text)) => Value::String(context.render(text)),
                    Some(value) => value.clone(),
                    None => placeholder_value(&output.name),
                };
                (output.name.clone(), value)
            })
            .collect();
        Ok(ActionResult::completed(None)
            .with_variables(variables)
            .with_metadata("strategy", Value::from(ThinkStrategy::Reduced.to_string())))
    }
}

/// `think` backed by the model: asks for one JSON field per output.
pub struct LlmThinkHandler {
    action_id: String,
    instruction: String,
    outputs: Vec<ThinkOutput>,
    extractor: VariableExtractor,
}

impl LlmThinkHandler {
    pub fn from_config(
        action_id: &str,
        config: &ActionConfig,
        extractor: VariableExtractor,
    ) -> Result<Self, ActionError> {
        if !extractor.has_llm() {
            return Err(ActionError::configuration(format!(
                "think action '{}' needs an LLM provider",
                action_id
            )));
        }
        Ok(Self {
            action_id: action_id.to_string(),
            instruction: config_str(config, &["instruction", "prompt", "content"])
                .unwrap_or("Derive the requested fields from the conversation.")
                .to_string(),
            outputs: parse_outputs(action_id, config)?,
            extractor,
        })
    }
}

#[async_trait]
impl ActionHandler for LlmThinkHandler {
    #[tracing::instrument(level = "debug", skip_all, fields(action_id = %self.action_id))]
    async fn execute(
        &self,
        context: &mut ActionContext,
        _user_input: Option<&str>,
    ) -> Result<ActionResult, ActionError> {
        let specs: Vec<VariableSpec> = self
            .outputs
            .iter()
            .map(|output| VariableSpec {
                required: output.required,
                ..VariableSpec::llm(
                    output.name.clone(),
                    output.value_type,
                    output.description.as_deref().unwrap_or(""),
                )
            })
            .collect();
        let spec_refs: Vec<&VariableSpec> = specs.iter().collect();

        let known = Value::Object(context.visible_variables());
        let text = context.build_prompt(
            Some(&context.render(&self.instruction)),
            &format!("Known variables:\n{}", known),
        );
        // 会話履歴は build_prompt 側で含めている
        let mut values = self
            .extractor
            .extract_structured(&text, &spec_refs, &[])
            .await?;

        // モデルが返さなかった項目は設定値で補う
        for output in &self.outputs {
            if let (false, Some(value)) = (values.contains_key(&output.name), &output.value) {
                values.insert(output.name.clone(), value.clone());
            }
        }
        let missing: Vec<String> = self
            .outputs
            .iter()
            .filter(|output| output.required && !values.contains_key(&output.name))
            .map(|output| output.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ExtractionError::MissingRequired {
                missing,
                extracted: values,
            }
            .into());
        }
        Ok(ActionResult::completed(None)
            .with_variables(values)
            .with_metadata("strategy", Value::from(ThinkStrategy::Llm.to_string())))
    }
}

/// Builds the `think` handler for `strategy`.
pub fn create_think_handler(
    strategy: ThinkStrategy,
    action_id: &str,
    config: &ActionConfig,
    extractor: VariableExtractor,
) -> Result<Box<dyn ActionHandler>, ActionError> {
    match strategy {
        ThinkStrategy::Reduced => Ok(Box::new(ReducedThinkHandler::from_config(action_id, config)?)),
        ThinkStrategy::Llm => Ok(Box::new(LlmThinkHandler::from_config(
            action_id, config, extractor,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        provider::{llm::MockLlmProvider, LlmConfig, LlmResponse},
        variable::{VariableLocation, VariableStore},
    };
    use serde_json::json;
    use std::sync::Arc;

    fn context() -> ActionContext {
        ActionContext::new(
            "s1",
            VariableLocation::new("p0", "t0"),
            "think",
            VariableStore::new(),
            vec![],
        )
    }

    #[tokio::test]
    async fn test_reduced_think_configured_and_placeholder_values() {
        let config = json!({"output_variables": [{"name": "mood", "value": "neutral"}, "summary"]});
        let handler = ReducedThinkHandler::from_config("think", config.as_object().unwrap()).unwrap();
        let result = handler.execute(&mut context(), None).await.unwrap();

        assert!(result.completed);
        assert!(result.ai_message.is_none());
        assert_eq!(result.extracted_variables.get("mood"), Some(&json!("neutral")));
        assert_eq!(
            result.extracted_variables.get("summary"),
            Some(&placeholder_value("summary"))
        );
    }

    #[tokio::test]
    async fn test_reduced_think_outputs_map() {
        let config = json!({"outputs": {"score": 3}});
        let handler = ReducedThinkHandler::from_config("think", config.as_object().unwrap()).unwrap();
        let result = handler.execute(&mut context(), None).await.unwrap();
        assert_eq!(result.extracted_variables.get("score"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_llm_think_never_surfaces_a_message() {
        let mut mock = MockLlmProvider::new();
        mock.expect_generate_text()
            .withf(|prompt, _| prompt.contains("Assess the mood"))
            .returning(|_, _| Ok(LlmResponse::new(r#"{"mood": "happy"}"#, "mock")));
        let extractor = VariableExtractor::with_llm(Arc::new(mock), LlmConfig::default());
        let config = json!({
            "instruction": "Assess the mood",
            "output_variables": [{"name": "mood", "description": "user mood"}, {"name": "topic", "value": "general"}]
        });
        let handler =
            LlmThinkHandler::from_config("think", config.as_object().unwrap(), extractor).unwrap();
        let result = handler.execute(&mut context(), None).await.unwrap();

        assert!(result.completed);
        assert!(result.ai_message.is_none());
        assert_eq!(result.extracted_variables.get("mood"), Some(&json!("happy")));
        assert_eq!(result.extracted_variables.get("topic"), Some(&json!("general")));
    }

    #[tokio::test]
    async fn test_llm_think_missing_required() {
        let mut mock = MockLlmProvider::new();
        mock.expect_generate_text()
            .returning(|_, _| Ok(LlmResponse::new("{}", "mock")));
        let extractor = VariableExtractor::with_llm(Arc::new(mock), LlmConfig::default());
        let config = json!({"output_variables": ["mood"]});
        let handler =
            LlmThinkHandler::from_config("think", config.as_object().unwrap(), extractor).unwrap();
        let err = handler.execute(&mut context(), None).await.unwrap_err();
        assert!(matches!(
            err,
            ActionError::Extraction(ExtractionError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_llm_think_requires_provider() {
        let config = json!({"output_variables": ["mood"]});
        let result =
            LlmThinkHandler::from_config("think", config.as_object().unwrap(), VariableExtractor::new());
        assert!(matches!(result, Err(ActionError::Configuration(_))));
    }
}
