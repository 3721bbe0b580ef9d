use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

use super::types::{ValueType, VariableValues};
use crate::{
    message::{transcript, Message},
    provider::{LlmConfig, LlmProvider, ProviderError},
};

lazy_static! {
    static ref NUMBER: Regex = Regex::new(r"-?\d+(?:\.\d+)?").unwrap();
    static ref LIST_SEPARATOR: Regex = Regex::new(r"[,;\n、，]").unwrap();
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*(.*?)\s*```\s*$").unwrap();
}

/// Recent messages included in structured extraction prompts.
const EXTRACTION_HISTORY: usize = 3;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Missing required variables: {missing:?}")]
    MissingRequired {
        missing: Vec<String>,
        extracted: VariableValues,
    },
    #[error("Invalid pattern for '{name}': {message}")]
    InvalidPattern { name: String, message: String },
    #[error("No pattern configured for '{0}'")]
    MissingPattern(String),
    #[error("No LLM provider available for structured extraction")]
    LlmUnavailable,
    #[error("Malformed structured response: {0}")]
    MalformedResponse(String),
    #[error("Provider error during extraction: {0}")]
    Provider(#[from] ProviderError),
}

impl ExtractionError {
    /// True when the failure comes from the spec list itself rather than the input.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ExtractionError::InvalidPattern { .. }
                | ExtractionError::MissingPattern(_)
                | ExtractionError::LlmUnavailable
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// The whole input, converted to the declared type.
    #[default]
    Direct,
    Pattern,
    Llm,
}

fn default_required() -> bool {
    true
}

/// What to extract and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(default, alias = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub method: ExtractionMethod,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl VariableSpec {
    pub fn direct(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            method: ExtractionMethod::Direct,
            pattern: None,
            required: true,
            description: None,
        }
    }

    pub fn pattern(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            method: ExtractionMethod::Pattern,
            pattern: Some(pattern.into()),
            ..Self::direct(name, ValueType::Text)
        }
    }

    pub fn llm(name: impl Into<String>, value_type: ValueType, description: &str) -> Self {
        Self {
            method: ExtractionMethod::Llm,
            description: Some(description.to_string()),
            ..Self::direct(name, value_type)
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Turns free text into typed variable values.
#[derive(Clone, Default)]
pub struct VariableExtractor {
    llm: Option<Arc<dyn LlmProvider>>,
    llm_config: LlmConfig,
}

impl VariableExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm(llm: Arc<dyn LlmProvider>, llm_config: LlmConfig) -> Self {
        Self {
            llm: Some(llm),
            llm_config,
        }
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// Extracts every spec from `raw_text`.
    ///
    /// Optional variables that cannot be extracted are omitted. Missing
    /// required ones produce [`ExtractionError::MissingRequired`] carrying the
    /// values that were obtained.
    #[instrument(level = "debug", skip(self, history))]
    pub async fn extract(
        &self,
        raw_text: &str,
        specs: &[VariableSpec],
        history: &[Message],
    ) -> Result<VariableValues, ExtractionError> {
        let mut extracted = VariableValues::new();

        for spec in specs {
            let value = match spec.method {
                ExtractionMethod::Direct => convert(raw_text, spec.value_type),
                ExtractionMethod::Pattern => extract_pattern(raw_text, spec)?,
                ExtractionMethod::Llm => continue,
            };
            if let Some(value) = value {
                extracted.insert(spec.name.clone(), value);
            }
        }

        let llm_specs: Vec<&VariableSpec> = specs
            .iter()
            .filter(|spec| spec.method == ExtractionMethod::Llm)
            .collect();
        if !llm_specs.is_empty() {
            let structured = self.extract_structured(raw_text, &llm_specs, history).await?;
            extracted.extend(structured);
        }

        let missing: Vec<String> = specs
            .iter()
            .filter(|spec| spec.required && !extracted.contains_key(&spec.name))
            .map(|spec| spec.name.clone())
            .collect();
        debug!(?extracted, ?missing, "extraction finished");
        if missing.is_empty() {
            Ok(extracted)
        } else {
            Err(ExtractionError::MissingRequired { missing, extracted })
        }
    }

    /// Asks the model for a JSON object with one field per spec.
    pub async fn extract_structured(
        &self,
        raw_text: &str,
        specs: &[&VariableSpec],
        history: &[Message],
    ) -> Result<VariableValues, ExtractionError> {
        let llm = self.llm.as_ref().ok_or(ExtractionError::LlmUnavailable)?;
        let prompt = structured_prompt(raw_text, specs, history);
        let response = llm.generate_text(&prompt, &self.llm_config).await?;
        parse_structured(&response.content, specs)
    }
}

fn extract_pattern(raw_text: &str, spec: &VariableSpec) -> Result<Option<Value>, ExtractionError> {
    let pattern = spec
        .pattern
        .as_deref()
        .ok_or_else(|| ExtractionError::MissingPattern(spec.name.clone()))?;
    let regex = Regex::new(pattern).map_err(|e| ExtractionError::InvalidPattern {
        name: spec.name.clone(),
        message: e.to_string(),
    })?;
    let Some(caps) = regex.captures(raw_text) else {
        return Ok(None);
    };
    // named group "value" > group 1 > whole match
    let matched = caps
        .name("value")
        .or_else(|| caps.get(1))
        .or_else(|| caps.get(0))
        .map(|m| m.as_str())
        .unwrap_or_default();
    Ok(convert(matched, spec.value_type))
}

/// Converts raw text into a value of `value_type`, or `None` when the text
/// does not contain one.
pub fn convert(raw: &str, value_type: ValueType) -> Option<Value> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    match value_type {
        ValueType::Text => Some(Value::String(text.to_string())),
        ValueType::Number => {
            let found = NUMBER.find(text)?.as_str();
            match found.parse::<i64>() {
                Ok(n) => Some(Value::Number(n.into())),
                Err(_) => found
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number),
            }
        }
        ValueType::Boolean => parse_bool(text).map(Value::Bool),
        ValueType::List => {
            let items: Vec<Value> = LIST_SEPARATOR
                .split(text)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_string()))
                .collect();
            (!items.is_empty()).then_some(Value::Array(items))
        }
        ValueType::Object => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Some(Value::Object(map)),
            _ => None,
        },
        ValueType::Null => None,
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    let lower = text.to_lowercase();
    let word = lower.trim_matches(|c: char| !c.is_alphanumeric());
    match word {
        "yes" | "y" | "true" | "ok" | "sure" | "1" | "はい" | "是" => Some(true),
        "no" | "n" | "false" | "nope" | "0" | "いいえ" | "否" => Some(false),
        _ => None,
    }
}

fn structured_prompt(raw_text: &str, specs: &[&VariableSpec], history: &[Message]) -> String {
    let fields = specs
        .iter()
        .map(|spec| {
            format!(
                "- {} ({}{}): {}",
                spec.name,
                spec.value_type,
                if spec.required { ", required" } else { "" },
                spec.description.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let mut prompt = format!(
        "Extract the following fields and answer with a single JSON object. \
         Use null for fields that are not present.\nFields:\n{}",
        fields
    );
    let recent = transcript(history, EXTRACTION_HISTORY);
    if !recent.is_empty() {
        prompt.push_str(&format!("\n\nRecent conversation:\n{}", recent));
    }
    prompt.push_str(&format!("\n\nText:\n{}", raw_text));
    prompt
}

/// Reads the JSON object out of a model reply.
///
/// Accepts a bare object, one wrapped in a Markdown code fence, or an object
/// embedded in surrounding prose.
pub fn json_object(content: &str) -> Result<Map<String, Value>, ExtractionError> {
    let body = CODE_FENCE
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(content)
        .trim();
    match serde_json::from_str(body) {
        Ok(Value::Object(map)) => return Ok(map),
        Ok(other) => {
            return Err(ExtractionError::MalformedResponse(format!(
                "expected object, got {}",
                other
            )))
        }
        Err(e) => {
            // 前後に説明文が付いた応答
            if let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) {
                if let Some(Ok(Value::Object(map))) = (start < end)
                    .then(|| serde_json::from_str::<Value>(&body[start..=end]))
                {
                    return Ok(map);
                }
            }
            Err(ExtractionError::MalformedResponse(e.to_string()))
        }
    }
}

/// Parses a model reply, tolerating Markdown code fences.
pub fn parse_structured(
    content: &str,
    specs: &[&VariableSpec],
) -> Result<VariableValues, ExtractionError> {
    let object = json_object(content)?;

    let mut values = VariableValues::new();
    for spec in specs {
        if let Some(value) = object.get(&spec.name).and_then(|v| coerce(v, spec.value_type)) {
            values.insert(spec.name.clone(), value);
        }
    }
    Ok(values)
}

fn coerce(value: &Value, value_type: ValueType) -> Option<Value> {
    match (value, value_type) {
        (Value::Null, _) => None,
        (Value::String(s), value_type) => convert(s, value_type),
        (Value::Number(_), ValueType::Number)
        | (Value::Bool(_), ValueType::Boolean)
        | (Value::Array(_), ValueType::List)
        | (Value::Object(_), ValueType::Object) => Some(value.clone()),
        (other, ValueType::Text) => Some(Value::String(other.to_string())),
        (other, ValueType::List) => Some(Value::Array(vec![other.clone()])),
        _ => None,
    }
}
