use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::handler::{config_str, ActionContext, ActionError, ActionHandler, ActionResult};
use crate::{
    provider::{LlmConfig, LlmProvider},
    script::ActionConfig,
    template::TemplateResolver,
};

const CONTENT_KEYS: [&str; 4] = ["content", "content_template", "prompt_template", "message"];

/// Renders a message and completes in one round.
///
/// With `rewrite: true` and a provider available, the rendered text is
/// rephrased by the model; on provider failure the rendered text is used.
pub struct SayHandler {
    action_id: String,
    content: Option<String>,
    template: Option<String>,
    rewrite: bool,
    llm: Option<Arc<dyn LlmProvider>>,
    llm_config: LlmConfig,
    templates: Option<Arc<TemplateResolver>>,
}

impl SayHandler {
    pub fn from_config(
        action_id: &str,
        config: &ActionConfig,
        llm: Option<Arc<dyn LlmProvider>>,
        templates: Option<Arc<TemplateResolver>>,
    ) -> Result<Self, ActionError> {
        let content = config_str(config, &CONTENT_KEYS).map(str::to_string);
        let template = config_str(config, &["template"]).map(str::to_string);
        if content.is_none() && template.is_none() {
            return Err(ActionError::configuration(format!(
                "say action '{}' needs content or template",
                action_id
            )));
        }
        Ok(Self {
            action_id: action_id.to_string(),
            content,
            template,
            rewrite: config
                .get("rewrite")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            llm,
            llm_config: LlmConfig::from_action_config(config),
            templates,
        })
    }

    async fn source_text(&self, context: &ActionContext) -> Result<String, ActionError> {
        if let (Some(name), Some(resolver)) = (&self.template, &self.templates) {
            if let Some(text) = resolver.resolve(&context.project_id, name).await? {
                return Ok(text);
            }
            debug!(template = %name, "template not found, using inline content");
        }
        self.content.clone().ok_or_else(|| {
            ActionError::configuration(format!(
                "template for say action '{}' not found and no inline content",
                self.action_id
            ))
        })
    }

    async fn rephrase(&self, context: &ActionContext, text: String) -> String {
        let Some(llm) = self.llm.as_ref().filter(|_| self.rewrite) else {
            return text;
        };
        let prompt = context.build_prompt(
            Some(
                "Rephrase the following message naturally without changing its meaning. \
                 Reply with the message only.",
            ),
            &text,
        );
        match llm.generate_text(&prompt, &self.llm_config).await {
            Ok(response) if !response.content.trim().is_empty() => {
                response.content.trim().to_string()
            }
            Ok(_) => text,
            Err(e) => {
                warn!(action_id = %self.action_id, "rewrite failed, using rendered text: {}", e);
                text
            }
        }
    }
}

#[async_trait]
impl ActionHandler for SayHandler {
    async fn execute(
        &self,
        context: &mut ActionContext,
        _user_input: Option<&str>,
    ) -> Result<ActionResult, ActionError> {
        let source = self.source_text(context).await?;
        let rendered = context.render(&source);
        let message = self.rephrase(context, rendered).await;
        Ok(ActionResult::completed(Some(message)))
    }
}
