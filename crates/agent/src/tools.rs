use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use caseflow_core::plan::ToolOutput;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Resolved parameters for one tool invocation.
pub type ToolParams = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub required: bool,
}

impl ParameterSpec {
    pub const fn required(name: &'static str) -> Self {
        Self { name, required: true }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self { name, required: false }
    }
}

/// Fixed input and output schema of a tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub inputs: Vec<ParameterSpec>,
    pub outputs: Vec<&'static str>,
}

impl ToolDescriptor {
    pub fn missing_inputs(&self, params: &ToolParams) -> Vec<&'static str> {
        self.inputs
            .iter()
            .filter(|spec| spec.required && params.get(spec.name).map_or(true, Value::is_null))
            .map(|spec| spec.name)
            .collect()
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Backend failures may be returned as `Err`; the registry turns them into
    /// failed outputs so callers only ever see a [`ToolOutput`].
    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("tool `{0}` is not registered")]
pub struct UnknownToolError(pub String);

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        let name = tool.descriptor().name.to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.tools.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors =
            self.tools.values().map(|tool| tool.descriptor()).collect::<Vec<_>>();
        descriptors.sort_by(|left, right| left.name.cmp(right.name));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn invoke(
        &self,
        name: &str,
        params: &ToolParams,
    ) -> Result<ToolOutput, UnknownToolError> {
        let tool = self.tools.get(name).ok_or_else(|| UnknownToolError(name.to_string()))?;

        let missing = tool.descriptor().missing_inputs(params);
        if !missing.is_empty() {
            return Ok(ToolOutput::failure(format!(
                "missing required parameter(s): {}",
                missing.join(", ")
            )));
        }

        match tool.execute(params).await {
            Ok(output) => Ok(output),
            Err(error) => {
                debug!(
                    event_name = "tool.adapter_error",
                    tool = name,
                    error = %error,
                    "tool adapter returned an error"
                );
                Ok(ToolOutput::failure(format!("{error:#}")))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 50, max_delay_ms: 500 }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self { max_retries, ..Self::default() }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Retries a read-only tool on errors and failed outputs. Never wrap a tool with side effects.
pub struct RetryingTool<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> RetryingTool<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<T> Tool for RetryingTool<T>
where
    T: Tool,
{
    fn descriptor(&self) -> ToolDescriptor {
        self.inner.descriptor()
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput> {
        let mut attempt = 0;
        loop {
            let outcome = self.inner.execute(params).await;
            let retryable = match &outcome {
                Ok(output) => !output.success,
                Err(_) => true,
            };
            if !retryable || attempt >= self.policy.max_retries {
                return outcome;
            }

            let reason = match &outcome {
                Ok(output) => output.failure_reason().to_string(),
                Err(error) => error.to_string(),
            };
            warn!(
                event_name = "tool.retry",
                tool = self.inner.descriptor().name,
                attempt,
                reason = %reason,
                "retrying read-only tool"
            );
            tokio::time::sleep(self.policy.backoff(attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use caseflow_core::plan::ToolOutput;
    use serde_json::json;

    use super::{
        ParameterSpec, RetryPolicy, RetryingTool, Tool, ToolDescriptor, ToolParams, ToolRegistry,
        UnknownToolError,
    };

    struct FlakyTool {
        failures_before_success: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "flaky_lookup",
                description: "fails a fixed number of times",
                inputs: vec![ParameterSpec::required("customer_id")],
                outputs: vec!["value"],
            }
        }

        async fn execute(&self, _params: &ToolParams) -> Result<ToolOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(anyhow!("backend unavailable"))
            } else {
                Ok(ToolOutput::ok_json(json!({"value": call})))
            }
        }
    }

    fn params() -> ToolParams {
        let mut params = ToolParams::new();
        params.insert("customer_id".to_string(), json!("123"));
        params
    }

    fn no_delay(max_retries: u32) -> RetryPolicy {
        RetryPolicy { max_retries, base_delay_ms: 0, max_delay_ms: 0 }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_typed_error() {
        let registry = ToolRegistry::default();
        let result = registry.invoke("book_flight", &ToolParams::new()).await;
        assert_eq!(result, Err(UnknownToolError("book_flight".to_string())));
    }

    #[tokio::test]
    async fn adapter_errors_become_failed_outputs() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::default();
        registry.register(FlakyTool { failures_before_success: 10, calls: calls.clone() });

        let output = registry.invoke("flaky_lookup", &params()).await.expect("registered tool");

        assert!(!output.success);
        assert_eq!(output.failure_reason(), "backend unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_required_inputs_fail_without_calling_the_adapter() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::default();
        registry.register(FlakyTool { failures_before_success: 0, calls: calls.clone() });

        let output =
            registry.invoke("flaky_lookup", &ToolParams::new()).await.expect("registered tool");

        assert!(!output.success);
        assert!(output.failure_reason().contains("customer_id"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retrying_tool_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let tool = RetryingTool::new(
            FlakyTool { failures_before_success: 2, calls: calls.clone() },
            no_delay(2),
        );

        let output = tool.execute(&params()).await.expect("third attempt succeeds");

        assert!(output.success);
        assert_eq!(output.field("value"), Some(&json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retrying_tool_gives_up_after_the_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let tool = RetryingTool::new(
            FlakyTool { failures_before_success: 5, calls: calls.clone() },
            no_delay(1),
        );

        assert!(tool.execute(&params()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy { max_retries: 3, base_delay_ms: 100, max_delay_ms: 250 };
        assert_eq!(policy.backoff(0).as_millis(), 100);
        assert_eq!(policy.backoff(1).as_millis(), 200);
        assert_eq!(policy.backoff(5).as_millis(), 250);
    }
}
