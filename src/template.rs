//! Placeholder rendering and template lookup.
//!
//! `{{name}}` and `${name}` are substituted from the visible variables;
//! dotted names reach into objects. Unresolved placeholders render as an
//! empty string.

use async_trait::async_trait;
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::variable::VariableValues;

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}|\$\{\s*([A-Za-z0-9_.\-]+)\s*\}").unwrap();
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template source error: {0}")]
    Source(String),
}

pub type TemplateResult<T> = Result<T, TemplateError>;

pub fn render(template: &str, variables: &VariableValues) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(variables, name).map(display_value).unwrap_or_default()
        })
        .into_owned()
}

/// Placeholder names in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn lookup<'a>(variables: &'a VariableValues, name: &str) -> Option<&'a Value> {
    if let Some(value) = variables.get(name) {
        return Some(value);
    }
    let mut parts = name.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(display_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

/// Source of raw template text, addressed by project and virtual path.
#[async_trait]
pub trait TemplateProvider: Send + Sync {
    /// `Ok(None)` when the template does not exist.
    async fn get_template(&self, project_id: &str, path: &str) -> TemplateResult<Option<String>>;
}

#[derive(Default)]
pub struct InMemoryTemplateProvider {
    templates: DashMap<(String, String), String>,
}

impl InMemoryTemplateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project_id: &str, path: &str, content: impl Into<String>) {
        self.templates
            .insert((project_id.to_string(), path.to_string()), content.into());
    }
}

#[async_trait]
impl TemplateProvider for InMemoryTemplateProvider {
    async fn get_template(&self, project_id: &str, path: &str) -> TemplateResult<Option<String>> {
        Ok(self
            .templates
            .get(&(project_id.to_string(), path.to_string()))
            .map(|entry| entry.value().clone()))
    }
}

const SYSTEM_ROOT: &str = "_system/config";

/// Two layer lookup: a scheme specific override, then the default layer.
pub struct TemplateResolver {
    provider: Arc<dyn TemplateProvider>,
    scheme: String,
}

impl TemplateResolver {
    pub fn new(provider: Arc<dyn TemplateProvider>, scheme: impl Into<String>) -> Self {
        Self {
            provider,
            scheme: scheme.into(),
        }
    }

    pub fn custom_path(&self, file: &str) -> String {
        format!("{}/custom/{}/{}", SYSTEM_ROOT, self.scheme, file)
    }

    pub fn default_path(file: &str) -> String {
        format!("{}/default/{}", SYSTEM_ROOT, file)
    }

    /// Resolves `name`. Names containing a `/` are treated as full paths and
    /// looked up as is.
    pub async fn resolve(&self, project_id: &str, name: &str) -> TemplateResult<Option<String>> {
        if name.contains('/') {
            return self.provider.get_template(project_id, name).await;
        }
        let custom = self.custom_path(name);
        if let Some(content) = self.provider.get_template(project_id, &custom).await? {
            debug!(path = %custom, "template resolved from custom layer");
            return Ok(Some(content));
        }
        self.provider
            .get_template(project_id, &Self::default_path(name))
            .await
    }
}
