//! Persistence ports for sessions, messages and scripts.
//!
//! The engine itself never stores anything; [`crate::service::SessionService`]
//! loads and saves through these traits. [`InMemoryRepository`] backs tests
//! and single process deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::{message::Message, script::Script, session::Session};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Storage error: {0}")]
    Storage(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[mockall::automock]
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn load_session(&self, session_id: &str) -> RepositoryResult<Session>;
    async fn save_session(&self, session: &Session) -> RepositoryResult<()>;
    /// Appends in order; earlier messages are never rewritten.
    async fn append_messages(&self, session_id: &str, messages: &[Message]) -> RepositoryResult<()>;
    async fn load_messages(&self, session_id: &str) -> RepositoryResult<Vec<Message>>;
}

#[mockall::automock]
#[async_trait]
pub trait ScriptRepository: Send + Sync {
    async fn load_script(&self, script_id: &str) -> RepositoryResult<Arc<Script>>;
}

#[derive(Default)]
pub struct InMemoryRepository {
    sessions: DashMap<String, Session>,
    messages: DashMap<String, Vec<Message>>,
    scripts: DashMap<String, Arc<Script>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_script(&self, script: Script) {
        self.scripts
            .insert(script.script_id.clone(), Arc::new(script));
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl SessionRepository for InMemoryRepository {
    async fn load_session(&self, session_id: &str) -> RepositoryResult<Session> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RepositoryError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            })
    }

    async fn save_session(&self, session: &Session) -> RepositoryResult<()> {
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn append_messages(&self, session_id: &str, messages: &[Message]) -> RepositoryResult<()> {
        self.messages
            .entry(session_id.to_string())
            .or_default()
            .extend(messages.iter().cloned());
        Ok(())
    }

    async fn load_messages(&self, session_id: &str) -> RepositoryResult<Vec<Message>> {
        Ok(self
            .messages
            .get(session_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ScriptRepository for InMemoryRepository {
    async fn load_script(&self, script_id: &str) -> RepositoryResult<Arc<Script>> {
        self.scripts
            .get(script_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RepositoryError::NotFound {
                kind: "script",
                id: script_id.to_string(),
            })
    }
}
