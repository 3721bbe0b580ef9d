//! # Script model
//!
//! A script is an immutable tree of phases, topics and actions. The
//! execution position addresses an action by its three zero-based indices;
//! navigation skips empty topics and phases so a position always lands on a
//! real action.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::variable::{UpdateMode, ValueType, VariableScope};

/// Handler-specific configuration of an action.
pub type ActionConfig = Map<String, Value>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("Script '{0}' has no phases")]
    NoPhases(String),
    #[error("Script '{0}' has no actions")]
    NoActions(String),
    #[error("Duplicate action id '{action_id}' in script '{script_id}'")]
    DuplicateActionId { script_id: String, action_id: String },
    #[error("Failed to parse script: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Script {
    pub script_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    /// 変数宣言 (スコープ・更新モード)
    #[serde(default)]
    pub variables: Vec<VariableDeclaration>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    pub phase_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub topic_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

/// One addressable unit of execution.
///
/// Configuration may be written under a `config` key or inline next to the
/// id and type; both forms end up in [`ActionDef::config`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "RawActionDef")]
pub struct ActionDef {
    pub action_id: String,
    pub action_type: String,
    #[serde(default)]
    pub config: ActionConfig,
}

#[derive(Deserialize)]
struct RawActionDef {
    action_id: String,
    action_type: String,
    #[serde(default)]
    config: ActionConfig,
    #[serde(flatten)]
    inline: ActionConfig,
}

impl From<RawActionDef> for ActionDef {
    fn from(raw: RawActionDef) -> Self {
        let mut config = raw.inline;
        // 明示的な config が優先
        config.extend(raw.config);
        Self {
            action_id: raw.action_id,
            action_type: raw.action_type,
            config,
        }
    }
}

impl ActionDef {
    pub fn new(
        action_id: impl Into<String>,
        action_type: impl Into<String>,
        config: ActionConfig,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            action_type: action_type.into(),
            config,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariableDeclaration {
    pub name: String,
    #[serde(default)]
    pub scope: VariableScope,
    #[serde(default)]
    pub update_mode: UpdateMode,
    #[serde(default)]
    pub value_type: Option<ValueType>,
    #[serde(default)]
    pub initial_value: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl VariableDeclaration {
    pub fn new(name: impl Into<String>, scope: VariableScope, update_mode: UpdateMode) -> Self {
        Self {
            name: name.into(),
            scope,
            update_mode,
            value_type: None,
            initial_value: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ExecutionPosition {
    pub phase_index: usize,
    pub topic_index: usize,
    pub action_index: usize,
}

impl ExecutionPosition {
    pub fn new(phase_index: usize, topic_index: usize, action_index: usize) -> Self {
        Self {
            phase_index,
            topic_index,
            action_index,
        }
    }
}

impl std::fmt::Display for ExecutionPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.phase_index, self.topic_index, self.action_index
        )
    }
}

/// Resolved action together with its enclosing phase and topic.
#[derive(Debug, Clone, Copy)]
pub struct ActionRef<'a> {
    pub phase: &'a Phase,
    pub topic: &'a Topic,
    pub action: &'a ActionDef,
}

impl Script {
    pub fn from_json(s: &str) -> Result<Self, ScriptError> {
        serde_json::from_str(s).map_err(|e| ScriptError::Parse(e.to_string()))
    }

    /// Checks the structural preconditions for starting a session.
    pub fn validate(&self) -> Result<(), ScriptError> {
        if self.phases.is_empty() {
            return Err(ScriptError::NoPhases(self.script_id.clone()));
        }
        let mut seen = HashSet::new();
        for action in self.actions() {
            if !seen.insert(action.action_id.as_str()) {
                return Err(ScriptError::DuplicateActionId {
                    script_id: self.script_id.clone(),
                    action_id: action.action_id.clone(),
                });
            }
        }
        if seen.is_empty() {
            return Err(ScriptError::NoActions(self.script_id.clone()));
        }
        Ok(())
    }

    pub fn actions(&self) -> impl Iterator<Item = &ActionDef> {
        self.phases
            .iter()
            .flat_map(|phase| phase.topics.iter())
            .flat_map(|topic| topic.actions.iter())
    }

    pub fn total_actions(&self) -> usize {
        self.actions().count()
    }

    pub fn action_at(&self, position: ExecutionPosition) -> Option<ActionRef<'_>> {
        let phase = self.phases.get(position.phase_index)?;
        let topic = phase.topics.get(position.topic_index)?;
        let action = topic.actions.get(position.action_index)?;
        Some(ActionRef {
            phase,
            topic,
            action,
        })
    }

    pub fn first_position(&self) -> Option<ExecutionPosition> {
        self.seek(ExecutionPosition::default())
    }

    /// Position of the action following `position`, or `None` at the end of the script.
    pub fn next_position(&self, position: ExecutionPosition) -> Option<ExecutionPosition> {
        self.seek(ExecutionPosition {
            action_index: position.action_index + 1,
            ..position
        })
    }

    // 指定位置以降で最初に存在するアクションを探す
    fn seek(&self, from: ExecutionPosition) -> Option<ExecutionPosition> {
        for (phase_index, phase) in self.phases.iter().enumerate().skip(from.phase_index) {
            let topic_start = if phase_index == from.phase_index {
                from.topic_index
            } else {
                0
            };
            for (topic_index, topic) in phase.topics.iter().enumerate().skip(topic_start) {
                let action_start = if phase_index == from.phase_index && topic_index == from.topic_index {
                    from.action_index
                } else {
                    0
                };
                if action_start < topic.actions.len() {
                    return Some(ExecutionPosition::new(phase_index, topic_index, action_start));
                }
            }
        }
        None
    }

    pub fn declaration(&self, name: &str) -> Option<&VariableDeclaration> {
        self.variables.iter().find(|decl| decl.name == name)
    }
}
