use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::types::{UpdateMode, VariableEntry, VariableScope, VariableValues};

type Entries = BTreeMap<String, VariableEntry>;

/// Where in the script a read or write happens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VariableLocation {
    pub phase_id: String,
    pub topic_id: String,
}

impl VariableLocation {
    pub fn new(phase_id: impl Into<String>, topic_id: impl Into<String>) -> Self {
        Self {
            phase_id: phase_id.into(),
            topic_id: topic_id.into(),
        }
    }
}

/// Session owned variable storage.
///
/// Phase and topic entries are keyed by their ids, so a variable written in
/// one topic is not visible from another unless it was declared with a wider
/// scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VariableStore {
    #[serde(default)]
    global: Entries,
    #[serde(default)]
    session: Entries,
    #[serde(default)]
    phase: BTreeMap<String, Entries>,
    #[serde(default)]
    topic: BTreeMap<String, Entries>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self, scope: VariableScope, location: &VariableLocation) -> Option<&Entries> {
        match scope {
            VariableScope::Global => Some(&self.global),
            VariableScope::Session => Some(&self.session),
            VariableScope::Phase => self.phase.get(&location.phase_id),
            VariableScope::Topic => self.topic.get(&location.topic_id),
        }
    }

    fn entries_mut(&mut self, scope: VariableScope, location: &VariableLocation) -> &mut Entries {
        match scope {
            VariableScope::Global => &mut self.global,
            VariableScope::Session => &mut self.session,
            VariableScope::Phase => self.phase.entry(location.phase_id.clone()).or_default(),
            VariableScope::Topic => self.topic.entry(location.topic_id.clone()).or_default(),
        }
    }

    /// Writes `value` into `scope`, combining it with an existing entry per `mode`.
    pub fn set(
        &mut self,
        location: &VariableLocation,
        name: &str,
        value: Value,
        scope: VariableScope,
        mode: UpdateMode,
        source: Option<String>,
    ) -> &VariableEntry {
        self.entries_mut(scope, location)
            .entry(name.to_string())
            .and_modify(|entry| entry.apply(value.clone(), mode, source.clone()))
            .or_insert_with(|| VariableEntry::new(name, scope, value, mode, source))
    }

    /// Resolves `name` from the narrowest visible scope.
    pub fn get(&self, location: &VariableLocation, name: &str) -> Option<&VariableEntry> {
        VariableScope::RESOLUTION_ORDER
            .iter()
            .find_map(|scope| self.get_in(*scope, location, name))
    }

    pub fn get_in(
        &self,
        scope: VariableScope,
        location: &VariableLocation,
        name: &str,
    ) -> Option<&VariableEntry> {
        self.entries(scope, location)?.get(name)
    }

    pub fn get_value(&self, location: &VariableLocation, name: &str) -> Option<&Value> {
        self.get(location, name).map(|entry| &entry.value)
    }

    /// Every visible variable at `location`, narrower scopes shadowing wider ones.
    pub fn flatten(&self, location: &VariableLocation) -> VariableValues {
        let mut values = VariableValues::new();
        for scope in VariableScope::RESOLUTION_ORDER.iter().rev() {
            if let Some(entries) = self.entries(*scope, location) {
                for (name, entry) in entries {
                    values.insert(name.clone(), entry.value.clone());
                }
            }
        }
        values
    }

    pub fn rollback(&mut self, scope: VariableScope, location: &VariableLocation, name: &str) -> bool {
        self.entries_mut(scope, location)
            .get_mut(name)
            .map(|entry| entry.rollback())
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariableEntry> {
        self.global
            .values()
            .chain(self.session.values())
            .chain(self.phase.values().flat_map(|entries| entries.values()))
            .chain(self.topic.values().flat_map(|entries| entries.values()))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
