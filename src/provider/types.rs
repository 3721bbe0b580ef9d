use secrecy::SecretString;
use std::{collections::HashMap, time::Duration};
use thiserror::Error;

use crate::config::ProviderSecretConfig;

/// LLMプロバイダーのエラー
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Provider initialization error: {0}")]
    Initialization(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Primary provider name not set")]
    PrimaryNameNotSet,

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Stream error: {0}")]
    Stream(String),
}

impl ProviderError {
    /// Transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::ApiError(_) | ProviderError::RateLimit(_) | ProviderError::Timeout(_)
        )
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Clone, Default)]
pub struct ProviderSecret {
    pub api_key: SecretString,
    pub additional_auth: HashMap<String, SecretString>,
}

impl std::fmt::Debug for ProviderSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSecret")
            .field("api_key", &"[REDACTED]")
            .field("additional_auth", &self.additional_auth.keys())
            .finish()
    }
}

impl From<ProviderSecretConfig> for ProviderSecret {
    fn from(secret: ProviderSecretConfig) -> Self {
        let additional_auth = secret
            .additional_auth
            .into_iter()
            .map(|(k, v)| (k, SecretString::from(v)))
            .collect();
        Self {
            api_key: SecretString::from(secret.api_key),
            additional_auth,
        }
    }
}
