use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub classifier: ClassifierKind,
    pub min_confidence: f64,
    pub tool_timeout_ms: u64,
    pub slot_lookup_retries: u32,
    pub fixtures_path: Option<PathBuf>,
    pub templates_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Keyword,
    Reasoning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub classifier: Option<ClassifierKind>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub fixtures_path: Option<PathBuf>,
    pub templates_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig {
                classifier: ClassifierKind::Keyword,
                min_confidence: 0.5,
                tool_timeout_ms: 5_000,
                slot_lookup_retries: 2,
                fixtures_path: None,
                templates_path: None,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: None,
                model: "llama3.1".to_string(),
                timeout_secs: 30,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl ClassifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Reasoning => "reasoning",
        }
    }
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Ollama => "http://localhost:11434",
        }
    }
}

impl LlmConfig {
    /// Configured base URL, or the provider's public endpoint.
    pub fn effective_base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(self.provider.default_base_url())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for ClassifierKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keyword" => Ok(Self::Keyword),
            "reasoning" => Ok(Self::Reasoning),
            other => Err(ConfigError::Validation(format!(
                "unsupported classifier `{other}` (expected keyword|reasoning)"
            ))),
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("caseflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(agent) = patch.agent {
            if let Some(classifier) = agent.classifier {
                self.agent.classifier = classifier;
            }
            if let Some(min_confidence) = agent.min_confidence {
                self.agent.min_confidence = min_confidence;
            }
            if let Some(tool_timeout_ms) = agent.tool_timeout_ms {
                self.agent.tool_timeout_ms = tool_timeout_ms;
            }
            if let Some(slot_lookup_retries) = agent.slot_lookup_retries {
                self.agent.slot_lookup_retries = slot_lookup_retries;
            }
            if let Some(fixtures_path) = agent.fixtures_path {
                self.agent.fixtures_path = Some(fixtures_path);
            }
            if let Some(templates_path) = agent.templates_path {
                self.agent.templates_path = Some(templates_path);
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CASEFLOW_AGENT_CLASSIFIER") {
            self.agent.classifier = value.parse()?;
        }
        if let Some(value) = read_env("CASEFLOW_AGENT_MIN_CONFIDENCE") {
            self.agent.min_confidence = parse_f64("CASEFLOW_AGENT_MIN_CONFIDENCE", &value)?;
        }
        if let Some(value) = read_env("CASEFLOW_AGENT_TOOL_TIMEOUT_MS") {
            self.agent.tool_timeout_ms = parse_u64("CASEFLOW_AGENT_TOOL_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("CASEFLOW_AGENT_SLOT_LOOKUP_RETRIES") {
            self.agent.slot_lookup_retries =
                parse_u32("CASEFLOW_AGENT_SLOT_LOOKUP_RETRIES", &value)?;
        }
        if let Some(value) = read_env("CASEFLOW_AGENT_FIXTURES_PATH") {
            self.agent.fixtures_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("CASEFLOW_AGENT_TEMPLATES_PATH") {
            self.agent.templates_path = Some(PathBuf::from(value));
        }

        if let Some(value) = read_env("CASEFLOW_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CASEFLOW_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CASEFLOW_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CASEFLOW_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CASEFLOW_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CASEFLOW_LLM_TIMEOUT_SECS", &value)?;
        }

        let log_level =
            read_env("CASEFLOW_LOGGING_LEVEL").or_else(|| read_env("CASEFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CASEFLOW_LOGGING_FORMAT").or_else(|| read_env("CASEFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(classifier) = overrides.classifier {
            self.agent.classifier = classifier;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(fixtures_path) = overrides.fixtures_path {
            self.agent.fixtures_path = Some(fixtures_path);
        }
        if let Some(templates_path) = overrides.templates_path {
            self.agent.templates_path = Some(templates_path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent(&self.agent)?;
        validate_llm(&self.llm, self.agent.classifier)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("caseflow.toml"), PathBuf::from("config/caseflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&agent.min_confidence) {
        return Err(ConfigError::Validation(
            "agent.min_confidence must be in range 0.0..=1.0".to_string(),
        ));
    }

    if agent.tool_timeout_ms == 0 || agent.tool_timeout_ms > 60_000 {
        return Err(ConfigError::Validation(
            "agent.tool_timeout_ms must be in range 1..=60000".to_string(),
        ));
    }

    if agent.slot_lookup_retries > 5 {
        return Err(ConfigError::Validation(
            "agent.slot_lookup_retries must be in range 0..=5".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig, classifier: ClassifierKind) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if classifier == ClassifierKind::Keyword {
        return Ok(());
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers when agent.classifier = reasoning"
                        .to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {}
    }

    if llm.base_url.as_ref().is_some_and(|value| value.trim().is_empty()) {
        return Err(ConfigError::Validation("llm.base_url must not be empty when set".to_string()));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.trim().parse::<f64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    agent: Option<AgentPatch>,
    llm: Option<LlmPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    classifier: Option<ClassifierKind>,
    min_confidence: Option<f64>,
    tool_timeout_ms: Option<u64>,
    slot_lookup_retries: Option<u32>,
    fixtures_path: Option<PathBuf>,
    templates_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
