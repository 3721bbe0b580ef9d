use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
        CreateChatCompletionResponse,
    },
    Client,
};
use async_trait::async_trait;
use futures::StreamExt;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::{
    config::{CommonConfig, ProviderConfig, RetryConfig},
    provider::{
        llm::{LlmConfig, LlmProvider, LlmResponse, ResponseMetadata, TextStream},
        types::{ProviderError, ProviderResult, ProviderSecret},
    },
    timestamp::Timestamp,
};

/// Adapter for OpenAI compatible chat completion endpoints.
pub struct OpenAIChatProvider {
    client: Option<Client<OpenAIConfig>>,
    name: String,
    defaults: CommonConfig,
    retry: RetryConfig,
}

impl OpenAIChatProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            client: None,
            name: name.into(),
            defaults: CommonConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn initialize(
        &mut self,
        config: &ProviderConfig,
        secret: &ProviderSecret,
    ) -> ProviderResult<()> {
        let mut openai_config =
            OpenAIConfig::new().with_api_key(secret.api_key.expose_secret());

        if let Some(org_id) = secret.additional_auth.get("organization_id") {
            openai_config = openai_config.with_org_id(org_id.expose_secret());
        }
        if let Some(url) = &config.endpoint.url {
            openai_config = openai_config.with_api_base(url);
        }

        self.defaults = config.common_config.clone();
        self.retry = config.retry.clone();
        self.client = Some(Client::with_config(openai_config));
        Ok(())
    }

    fn client(&self) -> ProviderResult<&Client<OpenAIConfig>> {
        self.client
            .as_ref()
            .ok_or_else(|| ProviderError::Authentication("Client not initialized".into()))
    }

    pub fn build_request(
        &self,
        prompt: &str,
        config: &LlmConfig,
        stream: bool,
    ) -> CreateChatCompletionRequest {
        let resolved = config.resolve(&self.defaults);
        let messages = vec![ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(prompt.to_string()),
                name: None,
            },
        )];

        CreateChatCompletionRequest {
            model: resolved.model,
            messages,
            temperature: Some(resolved.temperature),
            max_completion_tokens: Some(resolved.max_tokens),
            top_p: Some(resolved.top_p),
            frequency_penalty: Some(resolved.frequency_penalty),
            presence_penalty: Some(resolved.presence_penalty),
            stream: if stream { Some(true) } else { None },
            ..Default::default()
        }
    }

    #[tracing::instrument(skip(self, request), fields(provider = %self.name))]
    async fn create_with_retry(
        &self,
        request: CreateChatCompletionRequest,
    ) -> ProviderResult<CreateChatCompletionResponse> {
        let client = self.client()?;
        let mut attempt = 0;
        loop {
            match client.chat().create(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let error = map_openai_error(e);
                    if !error.is_retryable() || attempt >= self.retry.max_retries {
                        return Err(error);
                    }
                    let delay = self.retry.backoff_for(attempt);
                    warn!(attempt, ?delay, "chat completion failed, retrying: {}", error);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn map_openai_error(error: OpenAIError) -> ProviderError {
    match error {
        OpenAIError::ApiError(api_error) => {
            let message = api_error.message.to_lowercase();
            if message.contains("rate limit") {
                ProviderError::RateLimit(api_error.message)
            } else if message.contains("api key") {
                ProviderError::Authentication(api_error.message)
            } else {
                ProviderError::ApiError(api_error.message)
            }
        }
        OpenAIError::InvalidArgument(message) => ProviderError::InvalidRequest(message),
        OpenAIError::StreamError(message) => ProviderError::Stream(message),
        other => ProviderError::ApiError(other.to_string()),
    }
}

#[async_trait]
impl LlmProvider for OpenAIChatProvider {
    async fn generate_text(&self, prompt: &str, config: &LlmConfig) -> ProviderResult<LlmResponse> {
        debug!("prompt: {}", prompt);
        let request = self.build_request(prompt, config, false);
        let model = request.model.clone();
        let response = self.create_with_retry(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| ProviderError::ApiError("No response content".into()))?;

        Ok(LlmResponse {
            content,
            metadata: ResponseMetadata {
                model,
                created_at: Timestamp::now(),
                token_usage: response
                    .usage
                    .map(|u| (u.prompt_tokens, u.completion_tokens)),
                finish_reason: response
                    .choices
                    .first()
                    .and_then(|c| c.finish_reason.as_ref())
                    .map(|reason| format!("{:?}", reason)),
            },
        })
    }

    async fn stream_text(&self, prompt: &str, config: &LlmConfig) -> ProviderResult<TextStream> {
        let client = self.client()?;
        let request = self.build_request(prompt, config, true);
        let stream = client
            .chat()
            .create_stream(request)
            .await
            .map_err(map_openai_error)?;

        let chunks = stream.filter_map(|chunk| async move {
            match chunk {
                Ok(response) => response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .map(Ok),
                Err(e) => Some(Err(map_openai_error(e))),
            }
        });
        Ok(Box::pin(chunks))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
