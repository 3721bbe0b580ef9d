//! # Script Execution Engine
//!
//! Advances one session by one turn. A turn resolves the action at the
//! session's position, runs its handler under a timeout and folds the result
//! back into the session.
//!
//! ## Turn outcome
//!
//! - handler completed: variables are applied per their declared update mode,
//!   the assistant message is recorded and the position moves to the next
//!   real action (or the session completes)
//! - handler needs another round: the position stays, the handler's scratch
//!   state is kept and the session waits for input
//! - handler failed or timed out: nothing but `execution_status` changes, so
//!   the same turn can be retried
//! - action configuration rejected by its handler factory: the session fails
//!
//! With a [`Monitor`] attached, every successful result is analysed before it
//! is applied; the latest feedback is handed to the next action's prompt.
//!
//! The engine never touches persistence. The caller stores the updated
//! session and [`EngineOutcome::new_messages`] before accepting the next turn
//! for the same session.

use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    action::{ActionContext, ActionError, ActionRegistry, ActionResult, ErrorKind},
    config::EngineConfig,
    message::Message,
    monitor::{Monitor, MonitorRequest},
    script::{ActionDef, ExecutionPosition, Script},
    session::{ActionState, ExecutionStatus, Session, SessionStatus},
    variable::{UpdateMode, VariableLocation, VariableScope, VariableValues},
};

#[derive(Error, Debug)]
pub enum EngineError {
    /// Session already completed or failed.
    #[error("Session {session_id} is closed ({status})")]
    SessionClosed {
        session_id: String,
        status: SessionStatus,
    },

    /// Session is paused.
    #[error("Session {session_id} is not active ({status})")]
    SessionNotActive {
        session_id: String,
        status: SessionStatus,
    },

    /// Position or in-flight state no longer matches the script. Fatal.
    #[error("State inconsistency in session {session_id}: {reason}")]
    StateInconsistency { session_id: String, reason: String },

    /// No handler registered for the action type.
    #[error("No handler registered for action {action_id} of type '{action_type}'")]
    HandlerNotFound {
        action_id: String,
        action_type: String,
    },

    /// Handler factory rejected the action's configuration. Fatal.
    #[error("Action {action_id} ({action_type}) is misconfigured: {source}")]
    InvalidAction {
        action_id: String,
        action_type: String,
        #[source]
        source: ActionError,
    },

    /// Handler returned an error.
    #[error("Action {action_id} ({action_type}) failed: {source}")]
    Action {
        action_id: String,
        action_type: String,
        #[source]
        source: ActionError,
    },

    /// Handler reported `success = false`.
    #[error("Action {action_id} ({action_type}) reported failure: {message}")]
    ActionFailed {
        action_id: String,
        action_type: String,
        message: String,
    },

    /// Handler did not finish in time.
    #[error("Action {action_id} ({action_type}) timed out after {timeout:?}")]
    Timeout {
        action_id: String,
        action_type: String,
        timeout: Duration,
    },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::SessionClosed { .. } | EngineError::SessionNotActive { .. } => {
                ErrorKind::Rejected
            }
            EngineError::StateInconsistency { .. } => ErrorKind::StateInconsistency,
            EngineError::HandlerNotFound { .. } | EngineError::InvalidAction { .. } => {
                ErrorKind::Configuration
            }
            EngineError::Action { source, .. } => source.kind(),
            EngineError::ActionFailed { .. } | EngineError::Timeout { .. } => ErrorKind::Provider,
        }
    }

    /// Whether the same turn may simply be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Extraction | ErrorKind::Provider)
    }

    /// Whether the session was failed by this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::InvalidAction { .. })
            || self.kind() == ErrorKind::StateInconsistency
    }
}

/// Result of one successful turn.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutcome {
    pub ai_message: Option<String>,
    pub execution_status: ExecutionStatus,
    pub session_status: SessionStatus,
    pub extracted_variables: VariableValues,
    pub new_position: ExecutionPosition,
    /// Messages to append to the conversation history, in order.
    pub new_messages: Vec<Message>,
}

pub struct ScriptEngine {
    registry: Arc<ActionRegistry>,
    config: EngineConfig,
    monitor: Option<Arc<dyn Monitor>>,
}

impl ScriptEngine {
    pub fn new(registry: Arc<ActionRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs one turn bounded by the configured turn timeout.
    pub async fn advance(
        &self,
        session: &mut Session,
        script: &Script,
        history: &[Message],
        user_input: Option<&str>,
    ) -> Result<EngineOutcome, EngineError> {
        self.advance_with_timeout(session, script, history, user_input, self.config.turn_timeout)
            .await
    }

    #[instrument(
        level = "debug",
        skip(self, session, script, history, user_input),
        fields(session_id = %session.session_id, position = %session.position)
    )]
    pub async fn advance_with_timeout(
        &self,
        session: &mut Session,
        script: &Script,
        history: &[Message],
        user_input: Option<&str>,
        timeout: Duration,
    ) -> Result<EngineOutcome, EngineError> {
        match session.status {
            SessionStatus::Completed | SessionStatus::Failed => {
                return Err(EngineError::SessionClosed {
                    session_id: session.session_id.clone(),
                    status: session.status,
                })
            }
            SessionStatus::Paused => {
                return Err(EngineError::SessionNotActive {
                    session_id: session.session_id.clone(),
                    status: session.status,
                })
            }
            SessionStatus::Active => {}
        }

        if session.script_id != script.script_id {
            return Err(self.inconsistent(
                session,
                format!(
                    "session runs script '{}' but '{}' was supplied",
                    session.script_id, script.script_id
                ),
            ));
        }

        let position = session.position;
        let Some(action_ref) = script.action_at(position) else {
            return Err(self.inconsistent(
                session,
                format!("position {} is outside the script", position),
            ));
        };
        let action = action_ref.action;
        let location =
            VariableLocation::new(&action_ref.phase.phase_id, &action_ref.topic.topic_id);

        if let Some(state) = &session.action_state {
            if state.action_id != action.action_id {
                let reason = format!(
                    "in-flight state belongs to action '{}' but position {} is action '{}'",
                    state.action_id, position, action.action_id
                );
                return Err(self.inconsistent(session, reason));
            }
        }

        let handler = match self
            .registry
            .create(&action.action_type, &action.action_id, &action.config)
        {
            Ok(handler) => handler,
            Err(ActionError::UnknownType(_)) => {
                return Err(EngineError::HandlerNotFound {
                    action_id: action.action_id.clone(),
                    action_type: action.action_type.clone(),
                })
            }
            Err(source) if source.kind() == ErrorKind::Configuration => {
                let err = EngineError::InvalidAction {
                    action_id: action.action_id.clone(),
                    action_type: action.action_type.clone(),
                    source,
                };
                error!(session_id = %session.session_id, "{}", err);
                session.fail(err.to_string());
                return Err(err);
            }
            Err(source) => {
                return Err(self.turn_failed(
                    session,
                    EngineError::Action {
                        action_id: action.action_id.clone(),
                        action_type: action.action_type.clone(),
                        source,
                    },
                ))
            }
        };

        let awaiting_input = session
            .action_state
            .as_ref()
            .map(|state| state.awaiting_input)
            .unwrap_or(false);
        let input = if awaiting_input { user_input } else { None };
        if user_input.is_some() && !awaiting_input {
            debug!(action_id = %action.action_id, "input not awaited, ignoring");
        }

        let scratch = session
            .action_state
            .as_ref()
            .map(|state| state.scratch.clone())
            .unwrap_or_default();
        let mut context = ActionContext::new(
            &session.session_id,
            location.clone(),
            &action.action_id,
            session.variables.clone(),
            history.to_vec(),
        )
        .with_project(&self.config.project_id)
        .with_scratch(scratch)
        .with_default_max_rounds(self.config.default_max_rounds)
        .with_history_window(self.config.history_window)
        .with_monitor_feedback(session.monitor_feedback().map(str::to_string));

        let executed = tokio::time::timeout(timeout, handler.execute(&mut context, input)).await;
        let result = match executed {
            Err(_) => {
                warn!(action_id = %action.action_id, ?timeout, "action timed out");
                return Err(self.turn_failed(
                    session,
                    EngineError::Timeout {
                        action_id: action.action_id.clone(),
                        action_type: action.action_type.clone(),
                        timeout,
                    },
                ));
            }
            Ok(Err(source)) => {
                return Err(self.turn_failed(
                    session,
                    EngineError::Action {
                        action_id: action.action_id.clone(),
                        action_type: action.action_type.clone(),
                        source,
                    },
                ));
            }
            Ok(Ok(result)) if !result.success => {
                return Err(self.turn_failed(
                    session,
                    EngineError::ActionFailed {
                        action_id: action.action_id.clone(),
                        action_type: action.action_type.clone(),
                        message: result.error.unwrap_or_else(|| "unknown failure".to_string()),
                    },
                ));
            }
            Ok(Ok(result)) => result,
        };
        self.observe(session, action, &context, input, &result, timeout)
            .await;

        let mut new_messages = Vec::new();
        if let Some(text) = input {
            new_messages.push(Message::user(&session.session_id, text, &action.action_id));
        }
        let ai_message = result
            .ai_message
            .clone()
            .filter(|text| !text.trim().is_empty());
        if let Some(text) = &ai_message {
            new_messages.push(Message::assistant(&session.session_id, text, &action.action_id));
        }

        session.last_error = None;
        let extracted_variables = if result.completed {
            self.apply_variables(session, script, &location, &action.action_id, &result);
            session.action_state = None;
            match script.next_position(position) {
                Some(next) => {
                    session.position = next;
                    session.execution_status = ExecutionStatus::Running;
                    session.touch();
                }
                None => {
                    info!(session_id = %session.session_id, "script completed");
                    session.complete();
                }
            }
            result.extracted_variables
        } else {
            session.action_state = Some(ActionState {
                action_id: action.action_id.clone(),
                awaiting_input: true,
                scratch: context.into_scratch(),
            });
            session.execution_status = ExecutionStatus::WaitingInput;
            session.touch();
            VariableValues::new()
        };

        debug!(
            new_position = %session.position,
            execution_status = %session.execution_status,
            "turn finished"
        );
        Ok(EngineOutcome {
            ai_message,
            execution_status: session.execution_status,
            session_status: session.status,
            extracted_variables,
            new_position: session.position,
            new_messages,
        })
    }

    fn apply_variables(
        &self,
        session: &mut Session,
        script: &Script,
        location: &VariableLocation,
        action_id: &str,
        result: &ActionResult,
    ) {
        for (name, value) in &result.extracted_variables {
            let (scope, mode) = script
                .declaration(name)
                .map(|decl| (decl.scope, decl.update_mode))
                .unwrap_or((VariableScope::default(), UpdateMode::default()));
            session.variables.set(
                location,
                name,
                value.clone(),
                scope,
                mode,
                Some(action_id.to_string()),
            );
        }
    }

    /// Runs the monitor on a successful result. Its failures are logged and
    /// never affect the turn.
    async fn observe(
        &self,
        session: &mut Session,
        action: &ActionDef,
        context: &ActionContext,
        input: Option<&str>,
        result: &ActionResult,
        timeout: Duration,
    ) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        let metadata_u32 = |key: &str| {
            result
                .metadata
                .get(key)
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
        };
        let request = MonitorRequest {
            session_id: session.session_id.clone(),
            project_id: self.config.project_id.clone(),
            action_id: action.action_id.clone(),
            action_type: action.action_type.clone(),
            round: metadata_u32("rounds").unwrap_or_else(|| context.round()),
            max_rounds: metadata_u32("max_rounds").unwrap_or(self.config.default_max_rounds),
            completed: result.completed,
            ai_message: result.ai_message.clone(),
            user_input: input.map(str::to_string),
            metadata: result.metadata.clone(),
        };
        match tokio::time::timeout(timeout, monitor.analyze(&request)).await {
            Ok(Ok(Some(analysis))) => {
                session.record_monitor_feedback(&action.action_id, &action.action_type, &analysis)
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(action_id = %action.action_id, "monitor failed: {}", e),
            Err(_) => warn!(action_id = %action.action_id, ?timeout, "monitor timed out"),
        }
    }

    fn turn_failed(&self, session: &mut Session, error: EngineError) -> EngineError {
        warn!(session_id = %session.session_id, "turn failed: {}", error);
        session.execution_status = ExecutionStatus::Error;
        session.last_error = Some(error.to_string());
        error
    }

    fn inconsistent(&self, session: &mut Session, reason: String) -> EngineError {
        error!(session_id = %session.session_id, "state inconsistency: {}", reason);
        session.fail(reason.clone());
        EngineError::StateInconsistency {
            session_id: session.session_id.clone(),
            reason,
        }
    }
}

/// Reads a variable as visible from the session's current position.
pub fn visible_value<'a>(session: &'a Session, script: &Script, name: &str) -> Option<&'a Value> {
    let action = script.action_at(session.position)?;
    let location = VariableLocation::new(&action.phase.phase_id, &action.topic.topic_id);
    session.variables.get_value(&location, name)
}
