use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs::File, io::BufReader, path::Path, time::Duration};

use crate::{action::ThinkStrategy, provider::ProviderType, Error, InternalResult};

/// エンジン全体の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for a single handler invocation.
    #[serde(default = "default_turn_timeout", with = "duration_ms")]
    pub turn_timeout: Duration,

    /// Round budget for `ask` actions that do not configure `max_rounds`.
    #[serde(default = "default_max_rounds")]
    pub default_max_rounds: u32,

    /// Number of recent messages included when building prompts.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    #[serde(default = "default_template_scheme")]
    pub template_scheme: String,

    #[serde(default = "default_project_id")]
    pub project_id: String,

    /// `reduced` needs no provider; `llm` uses the primary provider.
    #[serde(default)]
    pub think_strategy: ThinkStrategy,

    /// Runs the LLM monitor after every successful `say` and `ask` turn.
    #[serde(default)]
    pub enable_monitor: bool,

    #[serde(default)]
    pub provider_configs: ProviderConfigs,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            turn_timeout: default_turn_timeout(),
            default_max_rounds: default_max_rounds(),
            history_window: default_history_window(),
            template_scheme: default_template_scheme(),
            project_id: default_project_id(),
            think_strategy: ThinkStrategy::default(),
            enable_monitor: false,
            provider_configs: ProviderConfigs::default(),
        }
    }
}

impl EngineConfig {
    // JSONファイルから設定を読み込む
    pub fn from_file(path: &str) -> InternalResult<Self> {
        from_file(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfigs {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default = "some_default_provider_name")]
    pub primary_provider: Option<String>,
}

impl Default for ProviderConfigs {
    fn default() -> Self {
        Self {
            providers: {
                let mut map = HashMap::new();
                map.insert(default_provider_name(), ProviderConfig::default());
                map
            },
            primary_provider: some_default_provider_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    // 基本情報
    #[serde(default)]
    pub provider_type: ProviderType,

    #[serde(default = "default_provider_name")]
    pub name: String,

    // 共通設定
    #[serde(default)]
    pub common_config: CommonConfig,

    // エンドポイント設定
    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    // プロバイダー固有設定
    #[serde(default)]
    pub provider_specific: HashMap<String, serde_json::Value>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::default(),
            name: default_provider_name(),
            common_config: CommonConfig::default(),
            endpoint: EndpointConfig::default(),
            retry: RetryConfig::default(),
            provider_specific: HashMap::new(),
        }
    }
}

/// Generation defaults a provider falls back to when a call leaves a field unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommonConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndpointConfig {
    /// OpenAI互換エンドポイントのベースURL
    #[serde(default)]
    pub url: Option<String>,
}

/// Exponential backoff applied by provider adapters, never by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff", with = "duration_ms")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "duration_ms")]
    pub max_backoff: Duration,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }
}

/// シークレット設定(secret.json)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SecretConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderSecretConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ProviderSecretConfig {
    pub api_key: String,
    #[serde(default = "HashMap::new")]
    pub additional_auth: HashMap<String, String>, // 追加の認証情報
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Internal(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Internal(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Internal(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

// デフォルト値の定義
fn default_turn_timeout() -> Duration {
    Duration::from_secs(25)
}

fn default_max_rounds() -> u32 {
    3
}

fn default_history_window() -> usize {
    10
}

fn default_template_scheme() -> String {
    "default".to_string()
}

fn default_project_id() -> String {
    "default".to_string()
}

fn default_provider_name() -> String {
    "default_provider".to_string()
}

fn some_default_provider_name() -> Option<String> {
    Some(default_provider_name())
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_top_p() -> f32 {
    1.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(8)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration型のシリアライズ/デシリアライズヘルパー
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
