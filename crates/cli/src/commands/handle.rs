use std::sync::Arc;

use caseflow_agent::runtime::backend_from_config;
use caseflow_agent::{AgentRuntime, CancelSignal, RequestOptions};
use caseflow_core::config::{AppConfig, LoadOptions};
use caseflow_core::TracingDiagnosticSink;
use tracing::{info, warn};
use uuid::Uuid;

use super::{current_thread_runtime, CommandResult, EXIT_ABORTED, EXIT_CONFIG, EXIT_OK};

const COMMAND: &str = "handle";

/// Runs one customer message through the agent and prints the structured response.
/// Ctrl-C cancels the in-flight plan; the escalation still completes.
pub fn run(options: LoadOptions, customer_id: &str, message: &str) -> CommandResult {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "config_validation",
                error.to_string(),
                EXIT_CONFIG,
            )
        }
    };

    let agent = match backend_from_config(&config).and_then(|backend| {
        AgentRuntime::from_config(&config, backend, Arc::new(TracingDiagnosticSink))
    }) {
        Ok(agent) => agent,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                error.error_class(),
                error.to_string(),
                EXIT_CONFIG,
            )
        }
    };

    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(COMMAND, "runtime_init", error.to_string(), EXIT_ABORTED)
        }
    };

    let correlation_id = Uuid::new_v4().to_string();
    info!(
        event_name = "system.cli.handle",
        correlation_id = %correlation_id,
        customer_id = %customer_id,
        classifier = agent.classifier_name(),
        "handling customer message"
    );

    let result = runtime.block_on(async {
        let (cancel_handle, cancel) = CancelSignal::pair();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(event_name = "system.cli.interrupted", "cancelling in-flight request");
                cancel_handle.cancel();
            }
        });

        let options = RequestOptions { correlation_id: Some(correlation_id.clone()), cancel };
        let result = agent.handle_message_with(customer_id, message, options).await;
        interrupt.abort();
        result
    });

    match result {
        Ok(response) => CommandResult::document(COMMAND, &response, EXIT_OK),
        Err(error) => {
            let error_class = error.error_class();
            let detail = error.to_string();
            let interface = error.into_interface(correlation_id);
            CommandResult::failure(
                COMMAND,
                error_class,
                format!(
                    "{} ({detail}; correlation_id={})",
                    interface.user_message(),
                    interface.correlation_id()
                ),
                EXIT_ABORTED,
            )
        }
    }
}
