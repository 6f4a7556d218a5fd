use std::sync::Arc;
use std::time::Duration;

use caseflow_core::diagnostics::{
    DiagnosticCategory, DiagnosticEvent, DiagnosticSink, NoopDiagnosticSink,
};
use caseflow_core::plan::{output_fact_key, Binding, Facts, Plan, Step, ToolOutput};
use caseflow_core::trace::{ExecutionTrace, TraceEntry, TraceEntryKind};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::tools::{ToolParams, ToolRegistry};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("plan for intent `{intent}` uses unregistered tool(s): {}", tools.join(", "))]
    UnknownTool { intent: String, tools: Vec<String> },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionResult {
    Resolved {
        trace: ExecutionTrace,
        final_outputs: Map<String, Value>,
    },
    Escalated {
        trace: ExecutionTrace,
        failed_step_index: usize,
        reason: String,
        /// Output of the fallback when it ran and succeeded.
        ticket: Option<Value>,
    },
}

impl ExecutionResult {
    pub fn trace(&self) -> &ExecutionTrace {
        match self {
            Self::Resolved { trace, .. } | Self::Escalated { trace, .. } => trace,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    pub fn failed_step_index(&self) -> Option<usize> {
        match self {
            Self::Resolved { .. } => None,
            Self::Escalated { failed_step_index, .. } => Some(*failed_step_index),
        }
    }
}

/// Caller-side switch that stops an execution between or during tool calls.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    receiver: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (sender, receiver) = watch::channel(false);
        (CancelHandle { sender }, CancelSignal { receiver: Some(receiver) })
    }

    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.as_ref().is_some_and(|receiver| *receiver.borrow())
    }

    async fn cancelled(&self) {
        let Some(receiver) = &self.receiver else {
            return std::future::pending().await;
        };
        let mut receiver = receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                // Handle dropped without cancelling.
                return std::future::pending().await;
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionOptions {
    pub tool_timeout: Duration,
    pub cancel: CancelSignal,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self { tool_timeout: DEFAULT_TOOL_TIMEOUT, cancel: CancelSignal::never() }
    }
}

/// Runs a plan step by step. Every tool-level failure becomes an escalation;
/// only an unregistered tool aborts with an error.
#[derive(Clone)]
pub struct PlanExecutor {
    sink: Arc<dyn DiagnosticSink>,
    options: ExecutionOptions,
}

impl Default for PlanExecutor {
    fn default() -> Self {
        Self::new(Arc::new(NoopDiagnosticSink), ExecutionOptions::default())
    }
}

struct RunContext<'a> {
    plan: &'a Plan,
    registry: &'a ToolRegistry,
    correlation_id: String,
}

impl PlanExecutor {
    pub fn new(sink: Arc<dyn DiagnosticSink>, options: ExecutionOptions) -> Self {
        Self { sink, options }
    }

    pub fn with_options(&self, options: ExecutionOptions) -> Self {
        Self { sink: self.sink.clone(), options }
    }

    pub async fn execute(
        &self,
        plan: &Plan,
        registry: &ToolRegistry,
        initial_facts: Facts,
    ) -> Result<ExecutionResult, ExecutionError> {
        let correlation_id = initial_facts
            .get("correlation_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let run = RunContext { plan, registry, correlation_id };

        let missing = plan
            .tool_names()
            .into_iter()
            .filter(|name| !registry.contains(name))
            .map(str::to_string)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            self.emit(&run, "plan.unknown_tool", |event| {
                event.with_field("tools", missing.join(","))
            });
            return Err(ExecutionError::UnknownTool {
                intent: plan.intent().to_string(),
                tools: missing,
            });
        }

        let mut facts = initial_facts;
        let mut trace = ExecutionTrace::new();
        let mut final_outputs = Map::new();

        for (index, step) in plan.steps().iter().enumerate() {
            let parameters = match resolve_parameters(step, &facts) {
                Ok(parameters) => parameters,
                Err(detail) => {
                    trace.push(TraceEntry {
                        step_index: index,
                        tool_name: step.tool_name.clone(),
                        kind: TraceEntryKind::Step,
                        parameters: Map::new(),
                        output: ToolOutput::failure(detail.clone()),
                        expectation_passed: false,
                        invoked: false,
                        detail: Some(detail.clone()),
                        recorded_at: Utc::now(),
                    });
                    return Ok(self.escalate(&run, step, index, detail, trace).await);
                }
            };

            let Invocation { output, invoked } =
                self.invoke(&run, &step.tool_name, &parameters, true).await;
            let verdict = step.expectation.evaluate(&output);
            let passed = verdict.is_ok();
            let detail = verdict.err().map(|message| with_tool_reason(message, &output));

            if passed {
                facts.insert(output_fact_key(index), output.fields_value());
                final_outputs.extend(output.fields.clone());
            }
            trace.push(TraceEntry {
                step_index: index,
                tool_name: step.tool_name.clone(),
                kind: TraceEntryKind::Step,
                parameters,
                output,
                expectation_passed: passed,
                invoked,
                detail: detail.clone(),
                recorded_at: Utc::now(),
            });

            if let Some(detail) = detail {
                return Ok(self.escalate(&run, step, index, detail, trace).await);
            }

            info!(
                event_name = "plan.step_passed",
                correlation_id = %run.correlation_id,
                intent = plan.intent(),
                step_index = index,
                tool = %step.tool_name,
                "plan step passed its expectation"
            );
            self.emit(&run, "plan.step_passed", |event| {
                event
                    .with_field("step_index", index.to_string())
                    .with_field("tool", step.tool_name.clone())
            });
        }

        info!(
            event_name = "plan.resolved",
            correlation_id = %run.correlation_id,
            intent = plan.intent(),
            steps = plan.len(),
            "plan resolved"
        );
        self.emit(&run, "plan.resolved", |event| {
            event.with_field("steps", plan.len().to_string())
        });

        Ok(ExecutionResult::Resolved { trace, final_outputs })
    }

    async fn escalate(
        &self,
        run: &RunContext<'_>,
        step: &Step,
        index: usize,
        reason: String,
        mut trace: ExecutionTrace,
    ) -> ExecutionResult {
        warn!(
            event_name = "plan.step_failed",
            correlation_id = %run.correlation_id,
            intent = run.plan.intent(),
            step_index = index,
            tool = %step.tool_name,
            reason = %reason,
            "plan step failed; escalating"
        );
        self.emit(run, "plan.step_failed", |event| {
            event
                .with_field("step_index", index.to_string())
                .with_field("tool", step.tool_name.clone())
                .with_field("reason", reason.clone())
        });

        let Some(fallback) = &step.on_fail else {
            return ExecutionResult::Escalated {
                trace,
                failed_step_index: index,
                reason,
                ticket: None,
            };
        };

        let mut parameters = fallback.bindings.clone().into_iter().collect::<ToolParams>();
        let ticket_reason = match parameters.get("reason").and_then(Value::as_str) {
            Some(summary) => format!("{summary}: {reason}"),
            None => reason.clone(),
        };
        parameters.insert("reason".to_string(), json!(ticket_reason));
        parameters.insert("intent".to_string(), json!(run.plan.intent()));
        parameters.insert("failed_step_index".to_string(), json!(index));
        parameters.insert("failed_tool".to_string(), json!(step.tool_name));

        // Cancellation does not stop the hand-off to a human.
        let Invocation { output, invoked } =
            self.invoke(run, &fallback.tool_name, &parameters, false).await;
        let ticket = output
            .success
            .then(|| output.field("escalation_ticket").cloned().unwrap_or(output.fields_value()));

        self.emit(run, "plan.fallback_invoked", |event| {
            event
                .with_field("step_index", index.to_string())
                .with_field("tool", fallback.tool_name.clone())
                .with_field("success", output.success.to_string())
        });
        if !output.success {
            warn!(
                event_name = "plan.fallback_failed",
                correlation_id = %run.correlation_id,
                intent = run.plan.intent(),
                step_index = index,
                tool = %fallback.tool_name,
                reason = output.failure_reason(),
                "escalation fallback failed; no ticket was created"
            );
        }

        trace.push(TraceEntry {
            step_index: index,
            tool_name: fallback.tool_name.clone(),
            kind: TraceEntryKind::Fallback,
            parameters,
            detail: (!output.success).then(|| output.failure_reason().to_string()),
            expectation_passed: output.success,
            invoked,
            output,
            recorded_at: Utc::now(),
        });

        ExecutionResult::Escalated { trace, failed_step_index: index, reason, ticket }
    }

    async fn invoke(
        &self,
        run: &RunContext<'_>,
        tool_name: &str,
        parameters: &ToolParams,
        honour_cancel: bool,
    ) -> Invocation {
        let timeout = self.options.tool_timeout;
        let call = tokio::time::timeout(timeout, run.registry.invoke(tool_name, parameters));
        let cancelled = async {
            if honour_cancel {
                self.options.cancel.cancelled().await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Invocation::skipped(format!(
                "execution cancelled before `{tool_name}` completed"
            )),
            result = call => match result {
                Ok(Ok(output)) => Invocation { output, invoked: true },
                Ok(Err(unknown)) => Invocation::skipped(unknown.to_string()),
                Err(_) => Invocation {
                    output: ToolOutput::failure(format!(
                        "tool `{tool_name}` timed out after {} ms",
                        timeout.as_millis()
                    )),
                    invoked: true,
                },
            },
        }
    }

    fn emit(
        &self,
        run: &RunContext<'_>,
        kind: &str,
        fill: impl FnOnce(DiagnosticEvent) -> DiagnosticEvent,
    ) {
        let event = DiagnosticEvent::new(kind, DiagnosticCategory::Plan)
            .with_correlation_id(run.correlation_id.clone())
            .with_field("intent", run.plan.intent());
        self.sink.emit(fill(event));
    }
}

/// A tool output and whether the tool was called.
struct Invocation {
    output: ToolOutput,
    invoked: bool,
}

impl Invocation {
    fn skipped(reason: String) -> Self {
        Self { output: ToolOutput::failure(reason), invoked: false }
    }
}

/// Resolves every binding against the facts table. `Err` names the first absent reference.
fn resolve_parameters(step: &Step, facts: &Facts) -> Result<ToolParams, String> {
    let mut parameters = ToolParams::new();
    for (name, binding) in &step.bindings {
        let value = match binding {
            Binding::Literal(value) => value.clone(),
            Binding::Reference(reference) => reference.resolve(facts).cloned().ok_or_else(|| {
                format!("parameter `{name}` references `{reference}`, which is not present")
            })?,
        };
        parameters.insert(name.clone(), value);
    }
    Ok(parameters)
}

fn with_tool_reason(message: String, output: &ToolOutput) -> String {
    match output.field("reason").and_then(Value::as_str) {
        Some(reason) if output.success => format!("{message} ({reason})"),
        _ => message,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use caseflow_core::diagnostics::InMemoryDiagnosticSink;
    use caseflow_core::plan::{
        Expectation, Facts, Fallback, OutputRef, Plan, PlanBuilder, Step, ToolOutput,
    };
    use caseflow_core::trace::TraceEntryKind;
    use serde_json::{json, Value};

    use super::{CancelSignal, ExecutionError, ExecutionOptions, ExecutionResult, PlanExecutor};
    use crate::tools::{Tool, ToolDescriptor, ToolParams, ToolRegistry};

    #[derive(Clone)]
    struct ScriptedTool {
        name: &'static str,
        output: ToolOutput,
        delay: Option<Duration>,
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<ToolParams>>>,
    }

    impl ScriptedTool {
        fn new(name: &'static str, output: ToolOutput) -> Self {
            Self {
                name,
                output,
                delay: None,
                calls: Arc::new(AtomicUsize::new(0)),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_params(&self) -> Option<ToolParams> {
            self.seen.lock().ok().and_then(|seen| seen.last().cloned())
        }
    }

    #[async_trait]
    impl Tool for ScriptedTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: self.name,
                description: "scripted test tool",
                inputs: Vec::new(),
                outputs: Vec::new(),
            }
        }

        async fn execute(&self, params: &ToolParams) -> Result<ToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(params.clone());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.output.clone())
        }
    }

    fn ok(value: Value) -> ToolOutput {
        ToolOutput::ok_json(value)
    }

    fn registry(tools: &[&ScriptedTool]) -> ToolRegistry {
        let mut registry = ToolRegistry::default();
        for tool in tools {
            registry.register((*tool).clone());
        }
        registry
    }

    fn three_step_plan() -> Plan {
        PlanBuilder::new("demo", "run three steps")
            .fallback(Fallback::new("escalate").with_binding("customer_id", json!("c-1")))
            .step(Step::new("first", Expectation::field_equals("ok", json!(true))))
            .step(
                Step::new("second", Expectation::non_empty("items"))
                    .with_reference("seed", OutputRef::field(0, "value")),
            )
            .step(
                Step::new("third", Expectation::Succeeded)
                    .with_reference("item", "output.1.items.0".parse().expect("valid reference")),
            )
            .build()
            .expect("plan builds")
    }

    #[tokio::test]
    async fn all_passing_steps_resolve_with_full_trace() {
        let first = ScriptedTool::new("first", ok(json!({"ok": true, "value": 7})));
        let second = ScriptedTool::new("second", ok(json!({"items": ["a", "b"]})));
        let third = ScriptedTool::new("third", ok(json!({"done": true, "value": 9})));
        let escalate = ScriptedTool::new("escalate", ok(json!({"ticket_id": "t"})));
        let registry = registry(&[&first, &second, &third, &escalate]);

        let result = PlanExecutor::default()
            .execute(&three_step_plan(), &registry, Facts::new())
            .await
            .expect("no fatal error");

        let ExecutionResult::Resolved { trace, final_outputs } = result else {
            panic!("expected resolved result");
        };
        assert_eq!(trace.len(), 3);
        assert!(trace.all_passed());
        assert_eq!(second.last_params().and_then(|p| p.get("seed").cloned()), Some(json!(7)));
        assert_eq!(third.last_params().and_then(|p| p.get("item").cloned()), Some(json!("a")));
        assert_eq!(final_outputs.get("value"), Some(&json!(9)));
        assert_eq!(final_outputs.get("items"), Some(&json!(["a", "b"])));
        assert_eq!(escalate.calls(), 0);
    }

    #[tokio::test]
    async fn failing_step_stops_the_plan_and_runs_fallback_once() {
        let first = ScriptedTool::new("first", ok(json!({"ok": true, "value": 7})));
        let second = ScriptedTool::new("second", ok(json!({"items": []})));
        let third = ScriptedTool::new("third", ok(json!({})));
        let escalate = ScriptedTool::new(
            "escalate",
            ok(json!({"escalation_ticket": {"ticket_id": "esc_1"}})),
        );
        let registry = registry(&[&first, &second, &third, &escalate]);

        let result = PlanExecutor::default()
            .execute(&three_step_plan(), &registry, Facts::new())
            .await
            .expect("no fatal error");

        assert_eq!(result.failed_step_index(), Some(1));
        assert_eq!(result.trace().len(), 3);
        assert_eq!(result.trace().step_entries().count(), 2);
        assert_eq!(result.trace().fallback_entry().map(|entry| entry.step_index), Some(1));
        assert_eq!(third.calls(), 0);
        assert_eq!(escalate.calls(), 1);

        let params = escalate.last_params().unwrap_or_default();
        assert_eq!(params.get("customer_id"), Some(&json!("c-1")));
        assert_eq!(params.get("failed_step_index"), Some(&json!(1)));
        assert_eq!(params.get("failed_tool"), Some(&json!("second")));
        assert_eq!(params.get("intent"), Some(&json!("demo")));

        let ExecutionResult::Escalated { ticket, reason, .. } = result else {
            panic!("expected escalation");
        };
        assert_eq!(ticket, Some(json!({"ticket_id": "esc_1"})));
        assert_eq!(reason, "expected `items` to be non-empty");
    }

    #[tokio::test]
    async fn absent_reference_fails_at_the_referencing_step_without_invoking_it() {
        let first = ScriptedTool::new("first", ok(json!({"ok": true})));
        let second = ScriptedTool::new("second", ok(json!({"items": ["a"]})));
        let third = ScriptedTool::new("third", ok(json!({})));
        let escalate = ScriptedTool::new("escalate", ok(json!({})));
        let registry = registry(&[&first, &second, &third, &escalate]);

        let result = PlanExecutor::default()
            .execute(&three_step_plan(), &registry, Facts::new())
            .await
            .expect("no fatal error");

        assert_eq!(result.failed_step_index(), Some(1));
        assert_eq!(second.calls(), 0);
        let failed = result.trace().entries()[1].clone();
        assert!(!failed.expectation_passed);
        assert!(!failed.invoked);
        assert_eq!(
            result.trace().invoked_tool_names(),
            vec!["first".to_string(), "escalate".to_string()]
        );
        assert!(failed.detail.unwrap_or_default().contains("output.0.value"));
    }

    #[tokio::test]
    async fn unregistered_tool_aborts_before_any_call() {
        let first = ScriptedTool::new("first", ok(json!({"ok": true})));
        let registry = registry(&[&first]);

        let result = PlanExecutor::default()
            .execute(&three_step_plan(), &registry, Facts::new())
            .await;

        assert_eq!(
            result,
            Err(ExecutionError::UnknownTool {
                intent: "demo".to_string(),
                tools: vec!["escalate".to_string(), "second".to_string(), "third".to_string()],
            })
        );
        assert_eq!(first.calls(), 0);
    }

    #[tokio::test]
    async fn timed_out_tool_escalates_at_that_step() {
        let first = ScriptedTool::new("first", ok(json!({"ok": true, "value": 1})))
            .slow(Duration::from_millis(500));
        let second = ScriptedTool::new("second", ok(json!({"items": ["a"]})));
        let third = ScriptedTool::new("third", ok(json!({})));
        let escalate = ScriptedTool::new("escalate", ok(json!({"ticket_id": "t"})));
        let registry = registry(&[&first, &second, &third, &escalate]);

        let executor = PlanExecutor::default().with_options(ExecutionOptions {
            tool_timeout: Duration::from_millis(20),
            cancel: CancelSignal::never(),
        });
        let result = executor
            .execute(&three_step_plan(), &registry, Facts::new())
            .await
            .expect("no fatal error");

        assert_eq!(result.failed_step_index(), Some(0));
        let ExecutionResult::Escalated { reason, ticket, .. } = result else {
            panic!("expected escalation");
        };
        assert!(reason.contains("timed out"));
        assert_eq!(ticket, Some(json!({"ticket_id": "t"})));
    }

    #[tokio::test]
    async fn failing_fallback_still_escalates_without_ticket() {
        let first = ScriptedTool::new("first", ok(json!({"ok": false})));
        let second = ScriptedTool::new("second", ok(json!({})));
        let third = ScriptedTool::new("third", ok(json!({})));
        let escalate = ScriptedTool::new("escalate", ToolOutput::failure("ticketing down"));
        let registry = registry(&[&first, &second, &third, &escalate]);

        let result = PlanExecutor::default()
            .execute(&three_step_plan(), &registry, Facts::new())
            .await
            .expect("no fatal error");

        let ExecutionResult::Escalated { trace, failed_step_index, ticket, .. } = result else {
            panic!("expected escalation");
        };
        assert_eq!(failed_step_index, 0);
        assert_eq!(ticket, None);
        assert_eq!(escalate.calls(), 1);
        let fallback = trace.fallback_entry().cloned().expect("fallback recorded");
        assert_eq!(fallback.kind, TraceEntryKind::Fallback);
        assert!(!fallback.expectation_passed);
        assert_eq!(fallback.detail.as_deref(), Some("ticketing down"));
    }

    #[tokio::test]
    async fn cancelled_execution_escalates_but_still_hands_off() {
        let first = ScriptedTool::new("first", ok(json!({"ok": true, "value": 1})));
        let second = ScriptedTool::new("second", ok(json!({"items": ["a"]})));
        let third = ScriptedTool::new("third", ok(json!({})));
        let escalate = ScriptedTool::new("escalate", ok(json!({"ticket_id": "t"})));
        let registry = registry(&[&first, &second, &third, &escalate]);

        let (handle, signal) = CancelSignal::pair();
        handle.cancel();
        let executor = PlanExecutor::default().with_options(ExecutionOptions {
            tool_timeout: Duration::from_secs(1),
            cancel: signal,
        });

        let result = executor
            .execute(&three_step_plan(), &registry, Facts::new())
            .await
            .expect("no fatal error");

        assert_eq!(result.failed_step_index(), Some(0));
        assert_eq!(first.calls(), 0);
        assert_eq!(escalate.calls(), 1);
        assert!(!result.trace().entries()[0].invoked);
        assert_eq!(result.trace().invoked_tool_names(), vec!["escalate".to_string()]);
    }

    #[tokio::test]
    async fn step_outcomes_reach_the_diagnostic_sink() {
        let first = ScriptedTool::new("first", ok(json!({"ok": false})));
        let escalate = ScriptedTool::new("escalate", ok(json!({})));
        let second = ScriptedTool::new("second", ok(json!({})));
        let third = ScriptedTool::new("third", ok(json!({})));
        let registry = registry(&[&first, &second, &third, &escalate]);
        let sink = InMemoryDiagnosticSink::default();

        let mut facts = Facts::new();
        facts.insert("correlation_id".to_string(), json!("req-9"));
        PlanExecutor::new(Arc::new(sink.clone()), ExecutionOptions::default())
            .execute(&three_step_plan(), &registry, facts)
            .await
            .expect("no fatal error");

        assert_eq!(sink.kinds(), vec!["plan.step_failed", "plan.fallback_invoked"]);
        assert!(sink
            .events()
            .iter()
            .all(|event| event.correlation_id.as_deref() == Some("req-9")));
    }
}
