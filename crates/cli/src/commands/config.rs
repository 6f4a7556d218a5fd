use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use caseflow_core::config::{AppConfig, ConfigOverrides, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct ConfigField {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
    overridden: bool,
}

pub fn run(options: LoadOptions) -> String {
    let config_file_path = detect_config_path(options.config_path.as_deref());
    let overrides = options.overrides.clone();

    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines =
        vec!["effective config (source precedence: flag > env > file > default):".to_string()];
    for field in fields(&config, &overrides) {
        let source = field_source(&field, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig, overrides: &ConfigOverrides) -> Vec<ConfigField> {
    let agent = &config.agent;
    let llm = &config.llm;
    let display_path =
        |path: Option<&PathBuf>| path.map_or("<unset>".to_string(), |p| p.display().to_string());

    vec![
        ConfigField {
            key: "agent.classifier",
            value: agent.classifier.as_str().to_string(),
            env_keys: &["CASEFLOW_AGENT_CLASSIFIER"],
            overridden: overrides.classifier.is_some(),
        },
        ConfigField {
            key: "agent.min_confidence",
            value: agent.min_confidence.to_string(),
            env_keys: &["CASEFLOW_AGENT_MIN_CONFIDENCE"],
            overridden: false,
        },
        ConfigField {
            key: "agent.tool_timeout_ms",
            value: agent.tool_timeout_ms.to_string(),
            env_keys: &["CASEFLOW_AGENT_TOOL_TIMEOUT_MS"],
            overridden: false,
        },
        ConfigField {
            key: "agent.slot_lookup_retries",
            value: agent.slot_lookup_retries.to_string(),
            env_keys: &["CASEFLOW_AGENT_SLOT_LOOKUP_RETRIES"],
            overridden: false,
        },
        ConfigField {
            key: "agent.fixtures_path",
            value: display_path(agent.fixtures_path.as_ref()),
            env_keys: &["CASEFLOW_AGENT_FIXTURES_PATH"],
            overridden: overrides.fixtures_path.is_some(),
        },
        ConfigField {
            key: "agent.templates_path",
            value: display_path(agent.templates_path.as_ref()),
            env_keys: &["CASEFLOW_AGENT_TEMPLATES_PATH"],
            overridden: overrides.templates_path.is_some(),
        },
        ConfigField {
            key: "llm.provider",
            value: llm.provider.as_str().to_string(),
            env_keys: &["CASEFLOW_LLM_PROVIDER"],
            overridden: overrides.llm_provider.is_some(),
        },
        ConfigField {
            key: "llm.model",
            value: llm.model.clone(),
            env_keys: &["CASEFLOW_LLM_MODEL"],
            overridden: overrides.llm_model.is_some(),
        },
        ConfigField {
            key: "llm.base_url",
            value: llm.base_url.clone().unwrap_or_else(|| {
                format!("<unset> (provider default {})", llm.provider.default_base_url())
            }),
            env_keys: &["CASEFLOW_LLM_BASE_URL"],
            overridden: false,
        },
        ConfigField {
            key: "llm.api_key",
            value: redact_key(llm.api_key.as_ref().map(|key| key.expose_secret())),
            env_keys: &["CASEFLOW_LLM_API_KEY"],
            overridden: false,
        },
        ConfigField {
            key: "llm.timeout_secs",
            value: llm.timeout_secs.to_string(),
            env_keys: &["CASEFLOW_LLM_TIMEOUT_SECS"],
            overridden: false,
        },
        ConfigField {
            key: "logging.level",
            value: config.logging.level.clone(),
            env_keys: &["CASEFLOW_LOGGING_LEVEL", "CASEFLOW_LOG_LEVEL"],
            overridden: overrides.log_level.is_some(),
        },
        ConfigField {
            key: "logging.format",
            value: config.logging.format.as_str().to_string(),
            env_keys: &["CASEFLOW_LOGGING_FORMAT", "CASEFLOW_LOG_FORMAT"],
            overridden: false,
        },
    ]
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    [PathBuf::from("caseflow.toml"), PathBuf::from("config/caseflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    field: &ConfigField,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if field.overridden {
        return "flag".to_string();
    }

    if let Some(env_key) = field.env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, field.key) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_key(key: Option<&str>) -> String {
    match key.map(str::trim) {
        None => "<unset>".to_string(),
        Some("") => "<empty>".to_string(),
        Some(key) => match key.split_once('-') {
            Some((prefix, _)) => format!("{prefix}-***"),
            None => "<redacted>".to_string(),
        },
    }
}
