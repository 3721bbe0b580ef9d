//! Typed session variables and extraction of values from free text.

pub mod extractor;
pub mod store;
pub mod types;

pub use extractor::{json_object, ExtractionError, ExtractionMethod, VariableExtractor, VariableSpec};
pub use store::{VariableLocation, VariableStore};
pub use types::{
    HistoryEntry, UpdateMode, ValueType, VariableEntry, VariableScope, VariableValues,
};
