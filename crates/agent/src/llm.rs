use std::time::Duration;

use async_trait::async_trait;
use caseflow_core::config::{LlmConfig, LlmProvider};
use caseflow_core::diagnostics::head_chars;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 1_024;
const ERROR_BODY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request timed out after {0} s")]
    Timeout(u64),
    #[error("llm request failed: {0}")]
    Transport(String),
    #[error("llm provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response did not contain text: {0}")]
    MalformedResponse(String),
    #[error("llm client is misconfigured: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

/// One client for the three supported HTTP APIs.
#[derive(Debug)]
pub struct HttpLlmClient {
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| LlmError::Configuration(error.to_string()))?;

        Ok(Self {
            provider: config.provider,
            base_url: config.effective_base_url().trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout_secs: config.timeout_secs,
            client,
        })
    }

    fn api_key(&self) -> Result<&str, LlmError> {
        self.api_key
            .as_ref()
            .map(|key| key.expose_secret())
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                LlmError::Configuration(format!("{} requires llm.api_key", self.provider.as_str()))
            })
    }

    fn map_transport(&self, error: reqwest::Error) -> LlmError {
        if error.is_timeout() {
            LlmError::Timeout(self.timeout_secs)
        } else {
            LlmError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let url = endpoint_url(self.provider, &self.base_url);
        let body = request_body(self.provider, &self.model, system_prompt, user_prompt);

        let mut request = self.client.post(&url).json(&body);
        request = match self.provider {
            LlmProvider::OpenAi => request.bearer_auth(self.api_key()?),
            LlmProvider::Anthropic => request
                .header("x-api-key", self.api_key()?)
                .header("anthropic-version", ANTHROPIC_VERSION),
            LlmProvider::Ollama => request,
        };

        debug!(
            event_name = "llm.request",
            provider = self.provider.as_str(),
            model = %self.model,
            url = %url,
            "sending completion request"
        );

        let response = request.send().await.map_err(|error| self.map_transport(error))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: head_chars(&body, ERROR_BODY_PREVIEW_CHARS),
            });
        }

        let payload = response.json::<Value>().await.map_err(|error| self.map_transport(error))?;
        extract_text(self.provider, &payload)
    }

    fn provider_name(&self) -> &str {
        self.provider.as_str()
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

pub fn endpoint_url(provider: LlmProvider, base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    match provider {
        LlmProvider::OpenAi => format!("{base_url}/chat/completions"),
        LlmProvider::Anthropic => format!("{base_url}/messages"),
        LlmProvider::Ollama => format!("{base_url}/api/generate"),
    }
}

pub fn request_body(
    provider: LlmProvider,
    model: &str,
    system_prompt: &str,
    user_prompt: &str,
) -> Value {
    match provider {
        LlmProvider::OpenAi => json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt}
            ],
            "temperature": 0.1,
            "response_format": {"type": "json_object"}
        }),
        LlmProvider::Anthropic => json!({
            "model": model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "system": system_prompt,
            "messages": [{"role": "user", "content": user_prompt}]
        }),
        LlmProvider::Ollama => json!({
            "model": model,
            "system": system_prompt,
            "prompt": user_prompt,
            "stream": false,
            "format": "json"
        }),
    }
}

pub fn extract_text(provider: LlmProvider, payload: &Value) -> Result<String, LlmError> {
    let text = match provider {
        LlmProvider::OpenAi => payload.pointer("/choices/0/message/content"),
        LlmProvider::Anthropic => payload
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| blocks.iter().find_map(|block| block.get("text"))),
        LlmProvider::Ollama => payload.get("response"),
    };

    text.and_then(Value::as_str).map(str::to_string).ok_or_else(|| {
        LlmError::MalformedResponse(format!(
            "{} payload: {}",
            provider.as_str(),
            head_chars(&payload.to_string(), ERROR_BODY_PREVIEW_CHARS)
        ))
    })
}
