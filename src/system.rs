use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    action::{registry, ActionRegistry, HandlerDependencies},
    config::{EngineConfig, SecretConfig},
    engine::ScriptEngine,
    monitor::LlmMonitor,
    provider::{LlmProvider, ProviderRegistry},
    repository::InMemoryRepository,
    service::SessionService,
    template::{InMemoryTemplateProvider, TemplateResolver},
    InternalResult,
};

/// Everything needed to serve sessions, wired from one [`EngineConfig`].
///
/// Storage is in memory; embedders with their own persistence build a
/// [`SessionService`] directly.
pub struct System {
    config: EngineConfig,
    providers: Arc<ProviderRegistry>,
    templates: Arc<InMemoryTemplateProvider>,
    repository: Arc<InMemoryRepository>,
    registry: Arc<ActionRegistry>,
    service: Arc<SessionService>,
}

impl System {
    pub async fn new(config: &EngineConfig, secret: &SecretConfig) -> InternalResult<Self> {
        Self::with_actions(config, secret, |_| {}).await
    }

    /// Like [`System::new`], letting `setup` register extra action types
    /// before the registry is frozen.
    pub async fn with_actions<F>(
        config: &EngineConfig,
        secret: &SecretConfig,
        setup: F,
    ) -> InternalResult<Self>
    where
        F: FnOnce(&ActionRegistry),
    {
        let providers = Arc::new(ProviderRegistry::new(
            config.provider_configs.clone(),
            secret.clone(),
        ));
        providers.register_providers().await?;

        let mut deps = HandlerDependencies::default().with_think_strategy(config.think_strategy);
        let llm = match providers.get_primary_provider().await {
            Ok(primary) => {
                info!(provider = %primary.provider.name(), "primary provider ready");
                let llm = providers.clone() as Arc<dyn LlmProvider>;
                deps = deps.with_llm(llm.clone());
                Some(llm)
            }
            Err(e) => {
                warn!("running without an LLM provider: {}", e);
                None
            }
        };

        let templates = Arc::new(InMemoryTemplateProvider::new());
        let resolver = Arc::new(TemplateResolver::new(
            templates.clone(),
            config.template_scheme.clone(),
        ));
        deps = deps.with_templates(resolver.clone());

        let registry = ActionRegistry::with_builtins(deps);
        setup(&registry);
        let registry = Arc::new(registry);
        if registry::install_global(registry.clone()).is_err() {
            debug!("global action registry already installed");
        }

        let repository = Arc::new(InMemoryRepository::new());
        let mut engine = ScriptEngine::new(registry.clone(), config.clone());
        match (config.enable_monitor, llm) {
            (true, Some(llm)) => {
                engine = engine.with_monitor(Arc::new(LlmMonitor::new(llm).with_templates(resolver)));
            }
            (true, None) => warn!("monitor enabled but no LLM provider is available, skipping it"),
            _ => {}
        }
        let engine = Arc::new(engine);
        let service = Arc::new(SessionService::new(
            engine,
            repository.clone(),
            repository.clone(),
        ));

        Ok(Self {
            config: config.clone(),
            providers,
            templates,
            repository,
            registry,
            service,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn templates(&self) -> &Arc<InMemoryTemplateProvider> {
        &self.templates
    }

    pub fn repository(&self) -> &Arc<InMemoryRepository> {
        &self.repository
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn service(&self) -> Arc<SessionService> {
        self.service.clone()
    }
}
