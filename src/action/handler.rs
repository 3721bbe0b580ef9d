use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    message::{transcript, Message},
    provider::ProviderError,
    template::{self, TemplateError},
    variable::{ExtractionError, VariableLocation, VariableStore, VariableValues},
};

const ROUND_KEY: &str = "round";

/// Action handler contract.
///
/// Handlers never touch the session directly. Everything they want to change
/// goes through the returned [`ActionResult`]; only the scratch map of the
/// context survives into the next round.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(
        &self,
        context: &mut ActionContext,
        user_input: Option<&str>,
    ) -> Result<ActionResult, ActionError>;
}

/// Category of a failure, used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Extraction,
    Provider,
    StateInconsistency,
    Rejected,
}

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Unknown action type: {0}")]
    UnknownType(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("Round budget exhausted after {rounds} rounds, missing {missing:?}")]
    RoundsExhausted { rounds: u32, missing: Vec<String> },
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
}

impl ActionError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        ActionError::Configuration(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::UnknownType(_) | ActionError::Configuration(_) => ErrorKind::Configuration,
            ActionError::Extraction(ExtractionError::Provider(_)) => ErrorKind::Provider,
            ActionError::Extraction(e) if e.is_configuration() => ErrorKind::Configuration,
            ActionError::Extraction(_) | ActionError::RoundsExhausted { .. } => {
                ErrorKind::Extraction
            }
            ActionError::Provider(_) | ActionError::Template(_) => ErrorKind::Provider,
        }
    }
}

/// What a handler reports back for one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionResult {
    pub success: bool,
    pub completed: bool,
    pub ai_message: Option<String>,
    pub extracted_variables: VariableValues,
    pub next_action: Option<String>,
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
}

impl ActionResult {
    /// The action is done.
    pub fn completed(ai_message: Option<String>) -> Self {
        Self {
            success: true,
            completed: true,
            ai_message,
            ..Self::default()
        }
    }

    /// The action needs another round.
    pub fn waiting(ai_message: impl Into<String>) -> Self {
        Self {
            success: true,
            completed: false,
            ai_message: Some(ai_message.into()),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_variables(mut self, variables: VariableValues) -> Self {
        self.extracted_variables = variables;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Per invocation view handed to a handler.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub session_id: String,
    pub project_id: String,
    pub phase_id: String,
    pub topic_id: String,
    pub action_id: String,
    default_max_rounds: u32,
    history_window: usize,
    monitor_feedback: Option<String>,
    variables: VariableStore,
    history: Vec<Message>,
    scratch: Map<String, Value>,
}

impl ActionContext {
    pub fn new(
        session_id: impl Into<String>,
        location: VariableLocation,
        action_id: impl Into<String>,
        variables: VariableStore,
        history: Vec<Message>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project_id: "default".to_string(),
            phase_id: location.phase_id,
            topic_id: location.topic_id,
            action_id: action_id.into(),
            default_max_rounds: 3,
            history_window: 10,
            monitor_feedback: None,
            variables,
            history,
            scratch: Map::new(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_scratch(mut self, scratch: Map<String, Value>) -> Self {
        self.scratch = scratch;
        self
    }

    pub fn with_default_max_rounds(mut self, rounds: u32) -> Self {
        self.default_max_rounds = rounds;
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    /// Guidance left by the monitor after an earlier action.
    pub fn with_monitor_feedback(mut self, feedback: Option<String>) -> Self {
        self.monitor_feedback = feedback.filter(|text| !text.trim().is_empty());
        self
    }

    pub fn monitor_feedback(&self) -> Option<&str> {
        self.monitor_feedback.as_deref()
    }

    pub fn location(&self) -> VariableLocation {
        VariableLocation::new(&self.phase_id, &self.topic_id)
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn visible_variables(&self) -> VariableValues {
        self.variables.flatten(&self.location())
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// The last `history_window` messages as `role: content` lines.
    pub fn recent_history(&self) -> String {
        transcript(&self.history, self.history_window)
    }

    /// Assembles an LLM prompt: the instruction, the recent conversation,
    /// pending monitor feedback, then the task itself.
    pub fn build_prompt(&self, instruction: Option<&str>, task: &str) -> String {
        let mut sections = Vec::new();
        if let Some(instruction) = instruction.filter(|s| !s.trim().is_empty()) {
            sections.push(instruction.trim().to_string());
        }
        let conversation = self.recent_history();
        if !conversation.is_empty() {
            sections.push(format!("Conversation so far:\n{}", conversation));
        }
        if let Some(feedback) = &self.monitor_feedback {
            sections.push(feedback.trim().to_string());
        }
        sections.push(task.to_string());
        sections.join("\n\n")
    }

    pub fn default_max_rounds(&self) -> u32 {
        self.default_max_rounds
    }

    /// Renders `{{name}}` placeholders against the visible variables.
    pub fn render(&self, text: &str) -> String {
        template::render(text, &self.visible_variables())
    }

    pub fn scratch(&self) -> &Map<String, Value> {
        &self.scratch
    }

    pub fn scratch_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.scratch
    }

    pub fn into_scratch(self) -> Map<String, Value> {
        self.scratch
    }

    /// Rounds already used by a multi-round action.
    pub fn round(&self) -> u32 {
        self.scratch
            .get(ROUND_KEY)
            .and_then(Value::as_u64)
            .and_then(|round| u32::try_from(round).ok())
            .unwrap_or(0)
    }

    pub fn set_round(&mut self, round: u32) {
        self.scratch.insert(ROUND_KEY.to_string(), Value::from(round));
    }
}

/// Reads a string under the first present key.
pub(crate) fn config_str<'a>(
    config: &'a Map<String, Value>,
    keys: &[&str],
) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| config.get(*key).and_then(Value::as_str))
}
