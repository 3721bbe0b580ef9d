use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    monitor::MonitorAnalysis,
    script::{ExecutionPosition, Script, ScriptError},
    timestamp::Timestamp,
    variable::{VariableLocation, VariableScope, VariableStore},
};

const MONITOR_FEEDBACK_KEY: &str = "monitor_feedback";
const LATEST_FEEDBACK_KEY: &str = "latest_monitor_feedback";
/// Monitor analyses kept in session metadata, oldest dropped first.
const MONITOR_HISTORY_LIMIT: usize = 20;

/// Session lifecycle.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// Outcome of the most recent turn.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Running,
    WaitingInput,
    Paused,
    Completed,
    Error,
}

/// Bookkeeping of an action that needs more than one turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ActionState {
    pub action_id: String,
    pub awaiting_input: bool,
    #[serde(default)]
    pub scratch: Map<String, Value>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("Session {session_id} is {status}")]
    Terminal {
        session_id: String,
        status: SessionStatus,
    },
    #[error("Cannot move session {session_id} from {from} to {to}")]
    InvalidTransition {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub script_id: String,
    pub status: SessionStatus,
    pub execution_status: ExecutionStatus,
    pub position: ExecutionPosition,
    pub variables: VariableStore,
    #[serde(default)]
    pub action_state: Option<ActionState>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Session {
    /// Creates a session positioned on the first real action of `script`,
    /// with declared initial values seeded.
    pub fn new(user_id: impl Into<String>, script: &Script) -> Result<Self, ScriptError> {
        script.validate()?;
        let position = script
            .first_position()
            .ok_or_else(|| ScriptError::NoActions(script.script_id.clone()))?;

        let variables = seed_variables(script);

        let now = Timestamp::now();
        Ok(Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            script_id: script.script_id.clone(),
            status: SessionStatus::Active,
            execution_status: ExecutionStatus::Running,
            position,
            variables,
            action_state: None,
            metadata: HashMap::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Timestamp::now();
    }

    fn ensure_open(&self) -> Result<(), LifecycleError> {
        if self.is_terminal() {
            return Err(LifecycleError::Terminal {
                session_id: self.session_id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), LifecycleError> {
        self.ensure_open()?;
        if self.status != SessionStatus::Active {
            return Err(LifecycleError::InvalidTransition {
                session_id: self.session_id.clone(),
                from: self.status,
                to: SessionStatus::Paused,
            });
        }
        self.status = SessionStatus::Paused;
        self.execution_status = ExecutionStatus::Paused;
        self.touch();
        Ok(())
    }

    /// Resumes a paused session. A session paused mid-action goes back to
    /// waiting for input.
    pub fn resume(&mut self) -> Result<(), LifecycleError> {
        self.ensure_open()?;
        if self.status != SessionStatus::Paused {
            return Err(LifecycleError::InvalidTransition {
                session_id: self.session_id.clone(),
                from: self.status,
                to: SessionStatus::Active,
            });
        }
        self.status = SessionStatus::Active;
        self.execution_status = match &self.action_state {
            Some(state) if state.awaiting_input => ExecutionStatus::WaitingInput,
            _ => ExecutionStatus::Running,
        };
        self.touch();
        Ok(())
    }

    pub fn complete(&mut self) {
        self.status = SessionStatus::Completed;
        self.execution_status = ExecutionStatus::Completed;
        self.action_state = None;
        self.touch();
    }

    /// Guidance from the most recent monitor analysis that asked for a change.
    pub fn monitor_feedback(&self) -> Option<&str> {
        self.metadata.get(LATEST_FEEDBACK_KEY).and_then(Value::as_str)
    }

    pub fn record_monitor_feedback(
        &mut self,
        action_id: &str,
        action_type: &str,
        analysis: &MonitorAnalysis,
    ) {
        match analysis.feedback_prompt() {
            Some(feedback) => {
                self.metadata
                    .insert(LATEST_FEEDBACK_KEY.to_string(), Value::String(feedback));
            }
            None => {
                self.metadata.remove(LATEST_FEEDBACK_KEY);
            }
        }
        let entry = serde_json::json!({
            "action_id": action_id,
            "action_type": action_type,
            "timestamp": Timestamp::now().to_string(),
            "analysis": analysis,
        });
        let history = self
            .metadata
            .entry(MONITOR_FEEDBACK_KEY.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match history {
            Value::Array(items) => {
                items.push(entry);
                let overflow = items.len().saturating_sub(MONITOR_HISTORY_LIMIT);
                *items = items.split_off(overflow);
            }
            other => *other = Value::Array(vec![entry]),
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.execution_status = ExecutionStatus::Error;
        self.last_error = Some(reason.into());
        self.touch();
    }
}

/// Declared initial values. Phase and topic scoped declarations are seeded
/// once for every phase or topic of the script.
fn seed_variables(script: &Script) -> VariableStore {
    let mut variables = VariableStore::new();
    for decl in &script.variables {
        let Some(value) = &decl.initial_value else {
            continue;
        };
        // phase / topic エントリは id 単位なので重複 id は一度だけ
        let locations: Vec<VariableLocation> = match decl.scope {
            VariableScope::Global | VariableScope::Session => {
                vec![VariableLocation::default()]
            }
            VariableScope::Phase => script
                .phases
                .iter()
                .map(|phase| phase.phase_id.as_str())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|phase_id| VariableLocation::new(phase_id, ""))
                .collect(),
            VariableScope::Topic => script
                .phases
                .iter()
                .flat_map(|phase| phase.topics.iter())
                .map(|topic| topic.topic_id.as_str())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|topic_id| VariableLocation::new("", topic_id))
                .collect(),
        };
        for location in &locations {
            variables.set(
                location,
                &decl.name,
                value.clone(),
                decl.scope,
                decl.update_mode,
                None,
            );
        }
    }
    variables
}
