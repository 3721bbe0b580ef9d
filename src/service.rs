//! Caller facing entry point: loads state, runs one engine turn and persists
//! the result while holding the session's lock.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    engine::{EngineOutcome, ScriptEngine},
    error::InternalResult,
    message::Message,
    repository::{ScriptRepository, SessionRepository},
    script::ExecutionPosition,
    session::{ExecutionStatus, Session, SessionStatus},
    variable::VariableValues,
};

pub const RETRY_HINT: &str = "Please try again.";

/// What the caller sees after one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResponse {
    pub session_id: String,
    pub ai_message: Option<String>,
    pub session_status: SessionStatus,
    pub execution_status: ExecutionStatus,
    pub extracted_variables: VariableValues,
    pub position: ExecutionPosition,
    /// Set when the turn failed in a way the caller may simply retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_hint: Option<String>,
}

impl TurnResponse {
    fn from_outcome(session_id: &str, outcome: EngineOutcome) -> Self {
        Self {
            session_id: session_id.to_string(),
            ai_message: outcome.ai_message,
            session_status: outcome.session_status,
            execution_status: outcome.execution_status,
            extracted_variables: outcome.extracted_variables,
            position: outcome.new_position,
            retry_hint: None,
        }
    }

    fn retry(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            ai_message: None,
            session_status: session.status,
            execution_status: session.execution_status,
            extracted_variables: VariableValues::new(),
            position: session.position,
            retry_hint: Some(RETRY_HINT.to_string()),
        }
    }
}

pub struct SessionService {
    engine: Arc<ScriptEngine>,
    sessions: Arc<dyn SessionRepository>,
    scripts: Arc<dyn ScriptRepository>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionService {
    pub fn new(
        engine: Arc<ScriptEngine>,
        sessions: Arc<dyn SessionRepository>,
        scripts: Arc<dyn ScriptRepository>,
    ) -> Self {
        Self {
            engine,
            sessions,
            scripts,
            locks: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<ScriptEngine> {
        &self.engine
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the map's entry once nobody but the caller holds it.
    fn release(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        // map + caller
        self.locks
            .remove_if(session_id, |_, held| Arc::strong_count(held) <= 2);
        drop(lock);
    }

    /// Sessions with a turn or transition in flight or queued.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn start_session(&self, user_id: &str, script_id: &str) -> InternalResult<Session> {
        let script = self.scripts.load_script(script_id).await?;
        let session = Session::new(user_id, &script)?;
        self.sessions.save_session(&session).await?;
        info!(session_id = %session.session_id, script_id, "session started");
        Ok(session)
    }

    /// Runs one turn for `session_id`.
    ///
    /// Recoverable failures come back as `Ok` with a retry hint and no
    /// assistant message. A missing handler is returned without touching
    /// storage; fatal errors persist the failed session first. The session is
    /// saved before its new messages are appended.
    #[instrument(level = "debug", skip(self, user_input))]
    pub async fn advance(
        &self,
        session_id: &str,
        user_input: Option<&str>,
    ) -> InternalResult<TurnResponse> {
        let lock = self.lock_for(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.advance_locked(session_id, user_input).await
        };
        self.release(session_id, lock);
        result
    }

    async fn advance_locked(
        &self,
        session_id: &str,
        user_input: Option<&str>,
    ) -> InternalResult<TurnResponse> {
        let mut session = self.sessions.load_session(session_id).await?;
        let script = self.scripts.load_script(&session.script_id).await?;
        let history = self.sessions.load_messages(session_id).await?;

        match self
            .engine
            .advance(&mut session, &script, &history, user_input)
            .await
        {
            Ok(outcome) => {
                // 位置を先に保存: 失敗時に履歴だけ残って重複しないように
                self.sessions.save_session(&session).await?;
                if !outcome.new_messages.is_empty() {
                    self.sessions
                        .append_messages(session_id, &outcome.new_messages)
                        .await?;
                }
                Ok(TurnResponse::from_outcome(session_id, outcome))
            }
            Err(e) if e.is_recoverable() => {
                warn!(session_id, "recoverable turn failure: {}", e);
                self.sessions.save_session(&session).await?;
                Ok(TurnResponse::retry(&session))
            }
            Err(e) if e.is_fatal() => {
                self.sessions.save_session(&session).await?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn pause(&self, session_id: &str) -> InternalResult<Session> {
        self.transition(session_id, Session::pause).await
    }

    pub async fn resume(&self, session_id: &str) -> InternalResult<Session> {
        self.transition(session_id, Session::resume).await
    }

    async fn transition(
        &self,
        session_id: &str,
        apply: fn(&mut Session) -> Result<(), crate::session::LifecycleError>,
    ) -> InternalResult<Session> {
        let lock = self.lock_for(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.transition_locked(session_id, apply).await
        };
        self.release(session_id, lock);
        result
    }

    async fn transition_locked(
        &self,
        session_id: &str,
        apply: fn(&mut Session) -> Result<(), crate::session::LifecycleError>,
    ) -> InternalResult<Session> {
        let mut session = self.sessions.load_session(session_id).await?;
        apply(&mut session)?;
        self.sessions.save_session(&session).await?;
        Ok(session)
    }

    pub async fn session(&self, session_id: &str) -> InternalResult<Session> {
        Ok(self.sessions.load_session(session_id).await?)
    }

    pub async fn history(&self, session_id: &str) -> InternalResult<Vec<Message>> {
        Ok(self.sessions.load_messages(session_id).await?)
    }
}
