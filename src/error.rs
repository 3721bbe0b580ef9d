use thiserror::Error;

use crate::action::ActionError;
use crate::engine::EngineError;
use crate::provider::types::ProviderError;
use crate::repository::RepositoryError;
use crate::script::ScriptError;
use crate::session::LifecycleError;
use crate::template::TemplateError;
use crate::variable::ExtractionError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
    #[error("Session error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("Action error: {0}")]
    Action(#[from] ActionError),
    // provider
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
    // persistence
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

// エラー作成用のヘルパー関数
impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Error::Configuration(message.into())
    }
}
