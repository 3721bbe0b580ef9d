//! # scriptflow: Script Execution Engine for guided conversations
//!
//! scriptflow drives a conversation through a declarative script, one turn at
//! a time, with an LLM doing the talking where a script asks for it.
//!
//! ## Script model
//!
//! A [`script::Script`] is an ordered tree of Phases, Topics and Actions.
//! Only Actions execute; empty Topics and Phases are skipped. A
//! [`session::Session`] records where one user is in a script, the variables
//! collected so far and the scratch state of an action that spans turns.
//!
//! ## Turn pipeline
//!
//! ```text
//! SessionService::advance → ScriptEngine::advance → ActionRegistry → ActionHandler
//!                                   ↓                                    ↓
//!                           VariableStore update            VariableExtractor / LlmProvider
//! ```
//!
//! - [`service`]: per session locking, load and persist around each turn
//! - [`engine`]: resolves the current action, applies its result, moves on
//! - [`action`]: `say`, `ask`, `think` and registered extensions
//! - [`variable`]: scoped variable store with history, and the extractor
//! - [`provider`]: the LLM port, an OpenAI compatible adapter and a scripted
//!   provider for offline runs
//! - [`monitor`]: optional LLM review of each result, feeding guidance forward
//! - [`template`]: `{{name}}` rendering and layered template lookup
//! - [`repository`]: persistence ports and an in-memory implementation
//! - [`system`]: wires all of the above from an [`config::EngineConfig`]
//!
//! ## Error model
//!
//! Every layer has its own error enum; [`error::Error`] aggregates them.
//! Engine errors are classified by [`action::ErrorKind`] so callers can tell
//! a retryable turn from a failed session.

pub mod action;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod monitor;
pub mod provider;
pub mod repository;
pub mod script;
pub mod service;
pub mod session;
pub mod system;
pub mod template;
pub mod timestamp;
pub mod variable;

// Re-exports
pub use action::{ActionHandler, ActionKind, ActionRegistry, ActionResult, HandlerDependencies};
pub use config::EngineConfig;
pub use engine::{EngineError, EngineOutcome, ScriptEngine};
pub use error::*;
pub use message::{Message, MessageRole};
pub use script::{ExecutionPosition, Script};
pub use service::{SessionService, TurnResponse};
pub use session::{ExecutionStatus, Session, SessionStatus};
pub use system::System;
