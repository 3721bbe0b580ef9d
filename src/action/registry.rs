use dashmap::DashMap;
use std::{
    str::FromStr,
    sync::{Arc, OnceLock},
};
use tracing::debug;

use super::{
    ask::AskHandler,
    handler::{ActionError, ActionHandler},
    say::SayHandler,
    think::{create_think_handler, ThinkStrategy},
};
use crate::{
    provider::{LlmConfig, LlmProvider},
    script::ActionConfig,
    template::TemplateResolver,
    variable::VariableExtractor,
};

/// Built-in action tags plus an open variant for registered extensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, strum::EnumString)]
pub enum ActionKind {
    #[strum(serialize = "say", serialize = "ai_say")]
    Say,
    #[strum(serialize = "ask", serialize = "ai_ask")]
    Ask,
    #[strum(serialize = "think", serialize = "ai_think")]
    Think,
    /// Reserved for composite or sub-script invocation.
    #[strum(serialize = "use_skill", serialize = "ai_use_skill")]
    UseSkill,
    #[strum(default)]
    Custom(String),
}

impl ActionKind {
    pub fn parse(tag: &str) -> Self {
        ActionKind::from_str(tag).unwrap_or_else(|_| ActionKind::Custom(tag.to_string()))
    }

    /// Canonical tag used as the registry key.
    pub fn as_tag(&self) -> &str {
        match self {
            ActionKind::Say => "say",
            ActionKind::Ask => "ask",
            ActionKind::Think => "think",
            ActionKind::UseSkill => "use_skill",
            ActionKind::Custom(tag) => tag,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

/// Builds a handler for one action from its id and configuration.
pub type HandlerFactory = Arc<
    dyn Fn(&str, &ActionConfig) -> Result<Box<dyn ActionHandler>, ActionError> + Send + Sync,
>;

/// Collaborators shared by the built-in handlers.
#[derive(Clone, Default)]
pub struct HandlerDependencies {
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub llm_config: LlmConfig,
    pub templates: Option<Arc<TemplateResolver>>,
    pub think_strategy: ThinkStrategy,
}

impl HandlerDependencies {
    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_templates(mut self, templates: Arc<TemplateResolver>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn with_think_strategy(mut self, strategy: ThinkStrategy) -> Self {
        self.think_strategy = strategy;
        self
    }

    pub(crate) fn extractor(&self) -> VariableExtractor {
        match &self.llm {
            Some(llm) => VariableExtractor::with_llm(llm.clone(), self.llm_config.clone()),
            None => VariableExtractor::new(),
        }
    }
}

/// アクションタイプ → ハンドラーファクトリ
///
/// Registration for an existing tag replaces the previous factory.
#[derive(Default)]
pub struct ActionRegistry {
    factories: DashMap<String, HandlerFactory>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `say`, `ask` and `think` wired to `deps`.
    pub fn with_builtins(deps: HandlerDependencies) -> Self {
        let registry = Self::new();

        let say_deps = deps.clone();
        registry.register(ActionKind::Say.as_tag(), move |action_id, config| {
            let handler = SayHandler::from_config(
                action_id,
                config,
                say_deps.llm.clone(),
                say_deps.templates.clone(),
            )?;
            Ok(Box::new(handler) as Box<dyn ActionHandler>)
        });

        let ask_deps = deps.clone();
        registry.register(ActionKind::Ask.as_tag(), move |action_id, config| {
            let handler = AskHandler::from_config(action_id, config, &ask_deps)?;
            Ok(Box::new(handler) as Box<dyn ActionHandler>)
        });

        registry.register(ActionKind::Think.as_tag(), move |action_id, config| {
            create_think_handler(deps.think_strategy, action_id, config, deps.extractor())
        });

        registry
    }

    pub fn register<F>(&self, action_type: &str, factory: F)
    where
        F: Fn(&str, &ActionConfig) -> Result<Box<dyn ActionHandler>, ActionError>
            + Send
            + Sync
            + 'static,
    {
        let kind = ActionKind::parse(action_type);
        debug!(action_type = %kind, "registering action handler");
        if self
            .factories
            .insert(kind.as_tag().to_string(), Arc::new(factory))
            .is_some()
        {
            debug!(action_type = %kind, "replaced existing handler");
        }
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.factories
            .contains_key(ActionKind::parse(action_type).as_tag())
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Instantiates the handler for `action_type`.
    pub fn create(
        &self,
        action_type: &str,
        action_id: &str,
        config: &ActionConfig,
    ) -> Result<Box<dyn ActionHandler>, ActionError> {
        let kind = ActionKind::parse(action_type);
        // ガードを保持したままファクトリを呼ばない
        let factory = self
            .factories
            .get(kind.as_tag())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ActionError::UnknownType(action_type.to_string()))?;
        factory(action_id, config)
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<ActionRegistry>> = OnceLock::new();

/// Installs the process wide registry. Fails if one is already installed.
pub fn install_global(registry: Arc<ActionRegistry>) -> Result<(), Arc<ActionRegistry>> {
    GLOBAL_REGISTRY.set(registry)
}

pub fn global() -> Option<Arc<ActionRegistry>> {
    GLOBAL_REGISTRY.get().cloned()
}
