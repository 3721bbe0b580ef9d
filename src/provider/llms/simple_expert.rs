use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::provider::{
    llm::{LlmConfig, LlmProvider, LlmResponse, TextStream},
    types::{ProviderError, ProviderResult},
};

type Pattern = String;

type Answer = String;

pub type KnowledgeBase = DashMap<Pattern, Answer>;

/// Deterministic provider answering from a pattern table.
///
/// The answer whose pattern is the longest substring of the prompt wins.
/// Used for offline runs and tests.
pub struct SimpleExpertProvider {
    name: String,
    knowledge_base: Arc<KnowledgeBase>,
    fallback: Option<Answer>,
    prompts: Mutex<Vec<String>>,
}

impl SimpleExpertProvider {
    pub fn new(name: impl Into<String>, knowledge_base: Arc<KnowledgeBase>) -> Self {
        Self {
            name: name.into(),
            knowledge_base,
            fallback: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn from_pairs<I, P, A>(name: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (P, A)>,
        P: Into<String>,
        A: Into<String>,
    {
        let knowledge_base = KnowledgeBase::new();
        for (pattern, answer) in pairs {
            knowledge_base.insert(pattern.into(), answer.into());
        }
        Self::new(name, Arc::new(knowledge_base))
    }

    pub fn with_fallback(mut self, answer: impl Into<String>) -> Self {
        self.fallback = Some(answer.into());
        self
    }

    /// Prompts received so far, oldest first.
    pub async fn received_prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }

    fn answer_for(&self, prompt: &str) -> ProviderResult<Answer> {
        // find content include pattern
        let best = self
            .knowledge_base
            .iter()
            .filter(|entry| prompt.contains(entry.key().as_str()))
            .max_by_key(|entry| entry.key().len())
            .map(|entry| entry.value().clone());
        debug!("response: {:?}", best);
        best.or_else(|| self.fallback.clone())
            .ok_or_else(|| ProviderError::ApiError("No response found".to_string()))
    }
}

#[async_trait]
impl LlmProvider for SimpleExpertProvider {
    async fn generate_text(&self, prompt: &str, _config: &LlmConfig) -> ProviderResult<LlmResponse> {
        self.prompts.lock().await.push(prompt.to_string());
        let answer = self.answer_for(prompt)?;
        Ok(LlmResponse::new(answer, self.name.clone()))
    }

    async fn stream_text(&self, prompt: &str, _config: &LlmConfig) -> ProviderResult<TextStream> {
        self.prompts.lock().await.push(prompt.to_string());
        let answer = self.answer_for(prompt)?;
        let chunks: Vec<ProviderResult<String>> = answer
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
