use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::timestamp::Timestamp;

/// Visibility and lifetime of a variable.
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
pub enum VariableScope {
    Global,
    Session,
    Phase,
    /// 宣言のない変数はトピックスコープ
    #[default]
    Topic,
}

impl VariableScope {
    /// Lookup order, narrowest first.
    pub const RESOLUTION_ORDER: [VariableScope; 4] = [
        VariableScope::Topic,
        VariableScope::Phase,
        VariableScope::Session,
        VariableScope::Global,
    ];
}

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
pub enum UpdateMode {
    #[default]
    Overwrite,
    Append,
    Merge,
}

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
pub enum ValueType {
    #[default]
    Text,
    Number,
    Boolean,
    List,
    Object,
    Null,
}

impl ValueType {
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::String(_) => ValueType::Text,
            Value::Number(_) => ValueType::Number,
            Value::Bool(_) => ValueType::Boolean,
            Value::Array(_) => ValueType::List,
            Value::Object(_) => ValueType::Object,
            Value::Null => ValueType::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub value: Value,
    pub source: Option<String>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariableEntry {
    pub name: String,
    pub scope: VariableScope,
    pub value: Value,
    pub value_type: ValueType,
    pub update_mode: UpdateMode,
    /// 最後に値を設定したアクション
    pub source: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl VariableEntry {
    pub fn new(
        name: impl Into<String>,
        scope: VariableScope,
        value: Value,
        update_mode: UpdateMode,
        source: Option<String>,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            name: name.into(),
            scope,
            value_type: ValueType::infer(&value),
            value,
            update_mode,
            source,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Combines `incoming` with the current value. The current value is always
    /// pushed to history first.
    pub fn apply(&mut self, incoming: Value, mode: UpdateMode, source: Option<String>) {
        let previous = std::mem::replace(&mut self.value, Value::Null);
        self.history.push(HistoryEntry {
            value: previous.clone(),
            source: self.source.take(),
            timestamp: self.updated_at,
        });

        self.value = match mode {
            UpdateMode::Overwrite => incoming,
            UpdateMode::Append => append_value(previous, incoming),
            UpdateMode::Merge => merge_value(previous, incoming),
        };
        self.value_type = ValueType::infer(&self.value);
        self.update_mode = mode;
        self.source = source;
        self.updated_at = Timestamp::now();
    }

    /// Restores the most recent historical value as a new overwrite.
    ///
    /// History keeps growing; the rolled back value becomes a history entry
    /// itself. Returns false when there is nothing to roll back to.
    pub fn rollback(&mut self) -> bool {
        let Some(last) = self.history.last().cloned() else {
            return false;
        };
        self.apply(last.value, UpdateMode::Overwrite, last.source);
        true
    }
}

fn append_value(previous: Value, incoming: Value) -> Value {
    let mut items = match previous {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    };
    match incoming {
        Value::Array(more) => items.extend(more),
        other => items.push(other),
    }
    Value::Array(items)
}

fn merge_value(previous: Value, incoming: Value) -> Value {
    match (previous, incoming) {
        (Value::Object(mut current), Value::Object(more)) => {
            current.extend(more);
            Value::Object(current)
        }
        // オブジェクト同士以外は上書き
        (_, incoming) => incoming,
    }
}

/// Flattened name to value view.
pub type VariableValues = Map<String, Value>;
