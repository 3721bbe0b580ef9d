//! # LLM capability port
//!
//! Handlers and the extractor depend only on [`llm::LlmProvider`]. Concrete
//! adapters live in [`llms`]; [`provider_registry::ProviderRegistry`] holds
//! the named adapters, picks the primary one and builds prompts from the
//! conversation history.

pub mod llm;
pub mod llms;
pub mod provider_registry;
pub mod types;

use serde::{Deserialize, Serialize};

pub use llm::{LlmConfig, LlmProvider, LlmResponse, TextStream};
pub use provider_registry::ProviderRegistry;
pub use types::{ProviderError, ProviderResult, ProviderSecret};

#[derive(
    Debug,
    Clone,
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
pub enum ProviderType {
    /// OpenAI互換のChat Completions API
    #[default]
    #[serde(rename = "openai_chat")]
    #[strum(serialize = "openai_chat")]
    OpenAIChat,
    SimpleExpert,
}
