//! # Action handlers
//!
//! One trait ([`ActionHandler`]) for every action type. The registry maps a
//! type tag to a factory; built-ins cover `say`, `ask` and `think`, and
//! `use_skill` or any custom tag can be registered without touching the
//! engine.

pub mod ask;
pub mod handler;
pub mod registry;
pub mod say;
pub mod think;

pub use ask::{AskHandler, ExitReason};
pub use handler::{ActionContext, ActionError, ActionHandler, ActionResult, ErrorKind};
pub use registry::{ActionKind, ActionRegistry, HandlerDependencies, HandlerFactory};
pub use say::SayHandler;
pub use think::{LlmThinkHandler, ReducedThinkHandler, ThinkStrategy};
