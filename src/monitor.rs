//! # Action monitor
//!
//! After a handler returns, a monitor may look at the result and leave
//! guidance for the actions that follow. The analysis never changes the
//! outcome of the turn it inspects: the engine records it in session
//! metadata and hands the latest feedback to the next prompt it builds.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{
    action::ActionKind,
    provider::{LlmConfig, LlmProvider, ProviderError},
    template::{self, TemplateError, TemplateResolver},
    variable::{json_object, VariableValues},
};

const ASK_TEMPLATE: &str = "monitor/ai_ask_v1.md";
const SAY_TEMPLATE: &str = "monitor/ai_say_v1.md";

const DEFAULT_ASK_TEMPLATE: &str = "You review how an information-gathering question is going.
Action {{action_id}}, round {{round}} of {{max_rounds}}.
Assistant said: {{ai_message}}
User said: {{user_input}}
Metrics: {{metrics}}
Decide whether the assistant should change its approach. Answer with one JSON object with the keys intervention_needed (boolean), intervention_reason (blocked, off_topic, insufficient or normal), strategy_suggestion (rephrase, comfort, accept_partial, skip or continue), feedback_for_action and optionally modified_approach.";

const DEFAULT_SAY_TEMPLATE: &str = "You review a message the assistant just delivered.
Action {{action_id}}.
Assistant said: {{ai_message}}
User said: {{user_input}}
Metrics: {{metrics}}
Decide whether the next message should be delivered differently. Answer with one JSON object with the keys intervention_needed (boolean), intervention_reason, strategy_suggestion, feedback_for_action and optionally modified_approach and example_suggestion.";

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Monitor provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Monitor template error: {0}")]
    Template(#[from] TemplateError),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InterventionLevel {
    #[default]
    ActionFeedback,
    TopicOrchestration,
}

fn default_reason() -> String {
    "normal".to_string()
}

fn default_strategy() -> String {
    "continue".to_string()
}

/// What the monitor concluded about one action result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorAnalysis {
    #[serde(default)]
    pub intervention_needed: bool,
    #[serde(default = "default_reason")]
    pub intervention_reason: String,
    #[serde(default)]
    pub intervention_level: InterventionLevel,
    #[serde(default = "default_strategy")]
    pub strategy_suggestion: String,
    #[serde(default)]
    pub feedback_for_action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_approach: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_suggestion: Option<String>,
    /// The model's reply could not be read; nothing is suggested.
    #[serde(default, skip_deserializing)]
    pub parse_error: bool,
}

impl Default for MonitorAnalysis {
    fn default() -> Self {
        Self {
            intervention_needed: false,
            intervention_reason: default_reason(),
            intervention_level: InterventionLevel::default(),
            strategy_suggestion: default_strategy(),
            feedback_for_action: String::new(),
            modified_approach: None,
            example_suggestion: None,
            parse_error: false,
        }
    }
}

impl MonitorAnalysis {
    pub fn parse(raw: &str) -> Self {
        let parsed = json_object(raw)
            .ok()
            .and_then(|map| serde_json::from_value::<MonitorAnalysis>(Value::Object(map)).ok());
        match parsed {
            Some(analysis) => analysis,
            None => {
                warn!("monitor reply is not a valid analysis, ignoring it");
                Self {
                    parse_error: true,
                    ..Self::default()
                }
            }
        }
    }

    /// Text appended to the next action's prompt, when there is anything to say.
    pub fn feedback_prompt(&self) -> Option<String> {
        if !self.intervention_needed || self.feedback_for_action.trim().is_empty() {
            return None;
        }
        let mut feedback = format!("Guidance for this step:\n{}", self.feedback_for_action.trim());
        if let Some(approach) = &self.modified_approach {
            feedback.push_str(&format!("\n\nSuggested approach:\n{}", approach.trim()));
        }
        if let Some(example) = &self.example_suggestion {
            feedback.push_str(&format!("\n\nFor example:\n{}", example.trim()));
        }
        feedback.push_str("\n\nAdjust your reply accordingly.");
        Some(feedback)
    }
}

/// Everything the monitor gets to see about one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorRequest {
    pub session_id: String,
    pub project_id: String,
    pub action_id: String,
    pub action_type: String,
    pub round: u32,
    pub max_rounds: u32,
    pub completed: bool,
    pub ai_message: Option<String>,
    pub user_input: Option<String>,
    pub metadata: Map<String, Value>,
}

#[mockall::automock]
#[async_trait]
pub trait Monitor: Send + Sync {
    /// `Ok(None)` when the action type is not monitored.
    async fn analyze(&self, request: &MonitorRequest) -> MonitorResult<Option<MonitorAnalysis>>;
}

/// Monitor backed by the LLM port. Prompts come from `monitor/ai_ask_v1.md`
/// and `monitor/ai_say_v1.md` when the template resolver has them.
pub struct LlmMonitor {
    llm: Arc<dyn LlmProvider>,
    llm_config: LlmConfig,
    templates: Option<Arc<TemplateResolver>>,
}

impl LlmMonitor {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            llm_config: LlmConfig::default().with_temperature(0.2),
            templates: None,
        }
    }

    pub fn with_templates(mut self, templates: Arc<TemplateResolver>) -> Self {
        self.templates = Some(templates);
        self
    }

    async fn prompt(&self, request: &MonitorRequest) -> MonitorResult<Option<String>> {
        let (name, fallback) = match ActionKind::parse(&request.action_type) {
            ActionKind::Ask => (ASK_TEMPLATE, DEFAULT_ASK_TEMPLATE),
            ActionKind::Say => (SAY_TEMPLATE, DEFAULT_SAY_TEMPLATE),
            _ => return Ok(None),
        };
        let source = match &self.templates {
            Some(resolver) => resolver.resolve(&request.project_id, name).await?,
            None => None,
        };

        let mut variables = VariableValues::new();
        variables.insert("action_id".to_string(), Value::from(request.action_id.clone()));
        variables.insert("round".to_string(), Value::from(request.round));
        variables.insert("max_rounds".to_string(), Value::from(request.max_rounds));
        variables.insert(
            "ai_message".to_string(),
            Value::from(request.ai_message.clone().unwrap_or_default()),
        );
        variables.insert(
            "user_input".to_string(),
            Value::from(request.user_input.clone().unwrap_or_default()),
        );
        let metrics = request
            .metadata
            .get("metrics")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        variables.insert("metrics".to_string(), Value::from(metrics.to_string()));

        Ok(Some(template::render(
            source.as_deref().unwrap_or(fallback),
            &variables,
        )))
    }
}

#[async_trait]
impl Monitor for LlmMonitor {
    #[instrument(level = "debug", skip_all, fields(action_id = %request.action_id))]
    async fn analyze(&self, request: &MonitorRequest) -> MonitorResult<Option<MonitorAnalysis>> {
        let Some(prompt) = self.prompt(request).await? else {
            debug!(action_type = %request.action_type, "action type is not monitored");
            return Ok(None);
        };
        let response = self.llm.generate_text(&prompt, &self.llm_config).await?;
        let analysis = MonitorAnalysis::parse(&response.content);
        debug!(
            intervention_needed = analysis.intervention_needed,
            reason = %analysis.intervention_reason,
            "monitor analysis"
        );
        Ok(Some(analysis))
    }
}
