use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::handler::{config_str, ActionContext, ActionError, ActionHandler, ActionResult};
use super::registry::HandlerDependencies;
use crate::{
    provider::{LlmConfig, LlmProvider},
    script::ActionConfig,
    template::{self, TemplateResolver},
    variable::{
        extractor::{convert, parse_structured},
        json_object, ExtractionError, ValueType, VariableExtractor, VariableSpec, VariableValues,
    },
};

const PROMPT_KEYS: [&str; 5] = ["prompt", "question", "content", "content_template", "prompt_template"];
const PARTIAL_KEY: &str = "partial";
const ASKED_KEY: &str = "asked";
const EMPTY_INPUT_REPLY: &str = "Please provide your answer.";
const GUIDE_TEMPLATE: &str = "ai_ask_v1.md";

/// Used when no `ai_ask_v1.md` template is registered.
const DEFAULT_GUIDE_TEMPLATE: &str = "You are guiding a conversation to collect information from the user.
Goal: {{question}}
Fields to collect:
{{fields}}
Finish when: {{exit_criteria}}
This is round {{round}} of at most {{max_rounds}}.
Answer with one JSON object: \"content\" holds your next message to the user, \"EXIT\" is \"true\" once the goal is met, \"BRIEF\" summarizes what you learned, and every field you could fill in gets its own key.";

/// Why a guided ask stopped asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ExitReason {
    MaxRoundsReached,
    ExitCriteriaMet,
    LlmSuggestion,
}

/// One parsed reply of the guiding model.
#[derive(Debug, Default)]
struct GuideReply {
    content: String,
    exit_flag: bool,
    should_exit: bool,
    brief: Option<String>,
    /// Self-assessment the monitor reads, e.g. `user_engagement`.
    metrics: Option<Value>,
    values: VariableValues,
}

impl GuideReply {
    fn parse(raw: &str, specs: &[&VariableSpec]) -> Self {
        let Ok(object) = json_object(raw) else {
            // JSON でなければ本文として扱う
            debug!("guide reply is not JSON, using raw text");
            return Self {
                content: raw.trim().to_string(),
                ..Self::default()
            };
        };
        let flag = |keys: &[&str]| {
            keys.iter().any(|key| match object.get(*key) {
                Some(Value::Bool(b)) => *b,
                Some(Value::String(text)) => text.eq_ignore_ascii_case("true"),
                _ => false,
            })
        };
        let values = parse_structured(raw, specs)
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, value)| !matches!(value, Value::String(text) if text.trim().is_empty()))
            .collect();
        Self {
            content: object
                .get("content")
                .or_else(|| object.get("response"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string(),
            exit_flag: flag(&["EXIT", "exit"]),
            should_exit: flag(&["should_exit", "shouldExit"]),
            brief: object
                .get("BRIEF")
                .or_else(|| object.get("exit_reason"))
                .and_then(Value::as_str)
                .map(str::to_string),
            metrics: object.get("metrics").filter(|m| m.is_object()).cloned(),
            values,
        }
    }

    /// Hard round cap first, then the explicit flag, then the model's hint.
    fn exit_reason(&self, round: u32, max_rounds: u32) -> Option<ExitReason> {
        if round >= max_rounds {
            Some(ExitReason::MaxRoundsReached)
        } else if self.exit_flag {
            Some(ExitReason::ExitCriteriaMet)
        } else if self.should_exit {
            Some(ExitReason::LlmSuggestion)
        } else {
            None
        }
    }
}

/// The model that leads a guided ask, plus where its prompt comes from.
struct Guide {
    llm: Arc<dyn LlmProvider>,
    llm_config: LlmConfig,
    templates: Option<Arc<TemplateResolver>>,
    template: String,
    exit_criteria: String,
}

/// Prompts the user and extracts variables from the reply.
///
/// The first invocation only sends the prompt. Each later reply consumes one
/// round; once the round budget is spent without every required variable,
/// the action fails with [`ActionError::RoundsExhausted`]. Values found in
/// earlier rounds are kept in scratch and merged with later ones.
///
/// In guided mode (`"mode": "guided"` or an `exit` condition) the model
/// writes every question and decides when enough has been collected. A
/// guided ask always completes once the round budget is reached.
pub struct AskHandler {
    action_id: String,
    prompt: String,
    retry_prompt: Option<String>,
    completion_message: Option<String>,
    variables: Vec<VariableSpec>,
    max_rounds: Option<u32>,
    extractor: VariableExtractor,
    guide: Option<Guide>,
}

impl AskHandler {
    pub fn from_config(
        action_id: &str,
        config: &ActionConfig,
        deps: &HandlerDependencies,
    ) -> Result<Self, ActionError> {
        let prompt = config_str(config, &PROMPT_KEYS)
            .ok_or_else(|| {
                ActionError::configuration(format!("ask action '{}' needs a prompt", action_id))
            })?
            .to_string();

        let mut variables = match config.get("variables").or_else(|| config.get("output")) {
            Some(value) => serde_json::from_value::<Vec<VariableSpec>>(value.clone()).map_err(
                |e| {
                    ActionError::configuration(format!(
                        "invalid variables for ask action '{}': {}",
                        action_id, e
                    ))
                },
            )?,
            None => Vec::new(),
        };
        // 単純モード: 入力全体をそのまま変数へ
        if let Some(target) = config_str(config, &["target_variable", "extract_to"]) {
            if !variables.iter().any(|spec| spec.name == target) {
                variables.push(VariableSpec::direct(target, ValueType::Text));
            }
        }

        let max_rounds = match config.get("max_rounds") {
            Some(value) => Some(
                value
                    .as_u64()
                    .filter(|rounds| *rounds > 0)
                    .and_then(|rounds| u32::try_from(rounds).ok())
                    .ok_or_else(|| {
                        ActionError::configuration(format!(
                            "max_rounds of ask action '{}' must be a positive integer below 2^32",
                            action_id
                        ))
                    })?,
            ),
            None => None,
        };

        let exit_criteria = config_str(config, &["exit", "exit_criteria"]).map(str::to_string);
        let guided = config_str(config, &["mode"]) == Some("guided") || exit_criteria.is_some();
        let guide = if guided {
            let llm = deps.llm.clone().ok_or_else(|| {
                ActionError::configuration(format!(
                    "guided ask action '{}' needs an LLM provider",
                    action_id
                ))
            })?;
            Some(Guide {
                llm,
                llm_config: LlmConfig::from_action_config(config),
                templates: deps.templates.clone(),
                template: config_str(config, &["template"])
                    .unwrap_or(GUIDE_TEMPLATE)
                    .to_string(),
                exit_criteria: exit_criteria
                    .unwrap_or_else(|| "every field has a value".to_string()),
            })
        } else {
            None
        };

        Ok(Self {
            action_id: action_id.to_string(),
            prompt,
            retry_prompt: config_str(config, &["retry_prompt"]).map(str::to_string),
            completion_message: config_str(config, &["completion_message"]).map(str::to_string),
            variables,
            max_rounds,
            extractor: deps.extractor(),
            guide,
        })
    }

    pub fn is_guided(&self) -> bool {
        self.guide.is_some()
    }

    pub fn max_rounds(&self, context: &ActionContext) -> u32 {
        self.max_rounds.unwrap_or_else(|| context.default_max_rounds()).max(1)
    }

    fn partial(context: &ActionContext) -> VariableValues {
        context
            .scratch()
            .get(PARTIAL_KEY)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    fn reprompt(&self, context: &ActionContext, missing: &[String]) -> String {
        match &self.retry_prompt {
            Some(retry) => context.render(retry),
            None => format!(
                "I still need: {}. {}",
                missing.join(", "),
                context.render(&self.prompt)
            ),
        }
    }

    fn completion(&self, context: &ActionContext, values: &VariableValues) -> Option<String> {
        self.completion_message
            .as_ref()
            .map(|text| template::render(text, &merged(context, values)))
    }

    async fn extract_round(
        &self,
        context: &mut ActionContext,
        input: &str,
    ) -> Result<ActionResult, ActionError> {
        let round = context.round() + 1;
        let max_rounds = self.max_rounds(context);
        debug!(action_id = %self.action_id, round, max_rounds, "ask round");

        let mut values = Self::partial(context);
        let pending: Vec<VariableSpec> = self
            .variables
            .iter()
            .filter(|spec| !values.contains_key(&spec.name))
            .cloned()
            .collect();

        match self
            .extractor
            .extract(input, &pending, context.history())
            .await
        {
            Ok(extracted) => {
                values.extend(extracted);
                let message = self.completion(context, &values);
                Ok(ActionResult::completed(message)
                    .with_variables(values)
                    .with_metadata("rounds", Value::from(round)))
            }
            Err(ExtractionError::MissingRequired { missing, extracted }) => {
                if round >= max_rounds {
                    return Err(ActionError::RoundsExhausted {
                        rounds: round,
                        missing,
                    });
                }
                values.extend(extracted);
                context.set_round(round);
                context
                    .scratch_mut()
                    .insert(PARTIAL_KEY.to_string(), Value::Object(values));
                Ok(ActionResult::waiting(self.reprompt(context, &missing)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sends the guide prompt for `round` and parses the reply.
    async fn consult(
        &self,
        guide: &Guide,
        context: &ActionContext,
        round: u32,
        task: &str,
    ) -> Result<GuideReply, ActionError> {
        let source = match &guide.templates {
            Some(resolver) => resolver.resolve(&context.project_id, &guide.template).await?,
            None => None,
        };
        let fields = self
            .variables
            .iter()
            .map(|spec| {
                format!(
                    "- {} ({}): {}",
                    spec.name,
                    spec.value_type,
                    spec.description.as_deref().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut variables = context.visible_variables();
        variables.insert("question".to_string(), Value::String(context.render(&self.prompt)));
        variables.insert("fields".to_string(), Value::String(fields));
        variables.insert(
            "exit_criteria".to_string(),
            Value::String(context.render(&guide.exit_criteria)),
        );
        variables.insert("round".to_string(), Value::from(round));
        variables.insert("max_rounds".to_string(), Value::from(self.max_rounds(context)));
        let instruction = template::render(
            source.as_deref().unwrap_or(DEFAULT_GUIDE_TEMPLATE),
            &variables,
        );

        let prompt = context.build_prompt(Some(&instruction), task);
        let response = guide.llm.generate_text(&prompt, &guide.llm_config).await?;
        let specs: Vec<&VariableSpec> = self.variables.iter().collect();
        Ok(GuideReply::parse(&response.content, &specs))
    }

    #[instrument(level = "debug", skip_all, fields(action_id = %self.action_id))]
    async fn guided_round(
        &self,
        guide: &Guide,
        context: &mut ActionContext,
        input: Option<&str>,
    ) -> Result<ActionResult, ActionError> {
        let asked = context
            .scratch()
            .get(ASKED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let input = input.map(str::trim).filter(|text| !text.is_empty());

        let Some(input) = input else {
            if asked {
                return Ok(ActionResult::waiting(EMPTY_INPUT_REPLY));
            }
            let reply = self
                .consult(guide, context, 0, "Open the conversation with your first question.")
                .await?;
            let question = if reply.content.is_empty() {
                context.render(&self.prompt)
            } else {
                reply.content
            };
            context
                .scratch_mut()
                .insert(ASKED_KEY.to_string(), Value::Bool(true));
            return Ok(ActionResult::waiting(question));
        };

        let round = context.round() + 1;
        let max_rounds = self.max_rounds(context);
        let reply = self
            .consult(
                guide,
                context,
                round,
                &format!("The user just answered:\n{}", input),
            )
            .await?;

        let mut values = Self::partial(context);
        values.extend(reply.values.clone());

        match reply.exit_reason(round, max_rounds) {
            Some(reason) => {
                debug!(round, %reason, "guided ask finished");
                // 取れなかった項目は最後の回答で補う
                for spec in &self.variables {
                    if !values.contains_key(&spec.name) {
                        if let Some(value) = convert(input, spec.value_type) {
                            values.insert(spec.name.clone(), value);
                        }
                    }
                }
                let message = self.completion(context, &values);
                let mut result = ActionResult::completed(message)
                    .with_variables(values)
                    .with_metadata("rounds", Value::from(round))
                    .with_metadata("max_rounds", Value::from(max_rounds))
                    .with_metadata("exit_reason", Value::from(reason.to_string()));
                if let Some(brief) = reply.brief {
                    result = result.with_metadata("brief", Value::String(brief));
                }
                if let Some(metrics) = reply.metrics {
                    result = result.with_metadata("metrics", metrics);
                }
                Ok(result)
            }
            None => {
                context.set_round(round);
                context
                    .scratch_mut()
                    .insert(PARTIAL_KEY.to_string(), Value::Object(values));
                let question = if reply.content.is_empty() {
                    context.render(&self.prompt)
                } else {
                    reply.content
                };
                let mut result = ActionResult::waiting(question)
                    .with_metadata("rounds", Value::from(round))
                    .with_metadata("max_rounds", Value::from(max_rounds));
                if let Some(metrics) = reply.metrics {
                    result = result.with_metadata("metrics", metrics);
                }
                Ok(result)
            }
        }
    }
}

#[async_trait]
impl ActionHandler for AskHandler {
    async fn execute(
        &self,
        context: &mut ActionContext,
        user_input: Option<&str>,
    ) -> Result<ActionResult, ActionError> {
        if let Some(guide) = &self.guide {
            return self.guided_round(guide, context, user_input).await;
        }
        let Some(input) = user_input else {
            // 初回 (または入力なしの再呼び出し) はプロンプトのみ
            return Ok(ActionResult::waiting(context.render(&self.prompt)));
        };
        if input.trim().is_empty() {
            return Ok(ActionResult::waiting(EMPTY_INPUT_REPLY));
        }
        self.extract_round(context, input).await
    }
}

fn merged(context: &ActionContext, values: &VariableValues) -> VariableValues {
    let mut visible = context.visible_variables();
    visible.extend(values.clone());
    visible
}
