use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::timestamp::Timestamp;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Immutable conversation record. History order is creation order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: Uuid,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub action_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: Timestamp,
}

impl Message {
    pub fn new(
        session_id: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        action_id: Option<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            action_id,
            metadata: HashMap::new(),
            created_at: Timestamp::now(),
        }
    }

    pub fn user(session_id: impl Into<String>, content: impl Into<String>, action_id: &str) -> Self {
        Self::new(session_id, MessageRole::User, content, Some(action_id.to_string()))
    }

    pub fn assistant(
        session_id: impl Into<String>,
        content: impl Into<String>,
        action_id: &str,
    ) -> Self {
        Self::new(
            session_id,
            MessageRole::Assistant,
            content,
            Some(action_id.to_string()),
        )
    }

    pub fn system(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::System, content, None)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Renders the last `window` messages as `role: content` lines.
pub fn transcript(history: &[Message], window: usize) -> String {
    let start = history.len().saturating_sub(window);
    history[start..]
        .iter()
        .map(|message| format!("{}: {}", message.role, message.content))
        .collect::<Vec<_>>()
        .join("\n")
}
