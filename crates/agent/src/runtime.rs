use std::sync::Arc;
use std::time::Duration;

use caseflow_core::config::{AppConfig, ClassifierKind};
use caseflow_core::decision::{DecisionType, ResponseDecoder};
use caseflow_core::diagnostics::{DiagnosticCategory, DiagnosticEvent, DiagnosticSink};
use caseflow_core::errors::ApplicationError;
use caseflow_core::plan::{Facts, Plan, PlanCompletion};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{cx_registry, LOG_INTERACTION};
use crate::backend::{BackendFixtures, InMemoryCxBackend};
use crate::classifier::{
    goal_for, Classification, ClassifyRequest, IntentClassifier, KeywordIntentClassifier,
    ReasoningIntentClassifier, UNKNOWN_INTENT,
};
use crate::executor::{CancelSignal, ExecutionOptions, ExecutionResult, PlanExecutor};
use crate::llm::HttpLlmClient;
use crate::planner::{Planner, PlannerError, ESCALATION_INTENT, ESCALATION_REASON_FACT};
use crate::tools::{RetryPolicy, ToolParams, ToolRegistry};

const CONFIRMATION_FIELDS: [&str; 5] =
    ["sent", "channels", "recipient", "appointment_id", "sent_at"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Resolved,
    Escalated,
    ClarificationNeeded,
    AwaitingSelection,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
            Self::ClarificationNeeded => "clarification_needed",
            Self::AwaitingSelection => "awaiting_selection",
        }
    }
}

/// Structured outcome of one customer message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentResponse {
    pub correlation_id: String,
    pub customer_id: String,
    pub intent: String,
    pub goal: String,
    pub decision: String,
    pub decision_type: DecisionType,
    pub status: ResponseStatus,
    pub actions_taken: Vec<String>,
    pub confidence: f64,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_ticket: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appointment: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_slots: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step_index: Option<usize>,
}

impl AgentResponse {
    fn from_classification(
        correlation_id: &str,
        customer_id: &str,
        classification: &Classification,
        status: ResponseStatus,
        explanation: String,
    ) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            customer_id: customer_id.to_string(),
            intent: classification.intent.clone(),
            goal: classification.goal.clone(),
            decision: classification.decision.clone(),
            decision_type: classification.decision_type,
            status,
            actions_taken: Vec::new(),
            confidence: classification.confidence,
            explanation,
            escalation_ticket: None,
            appointment: None,
            confirmation: None,
            available_slots: None,
            failed_step_index: None,
        }
    }
}

/// Per-request knobs. A missing correlation id is generated.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub correlation_id: Option<String>,
    pub cancel: CancelSignal,
}

struct RequestContext<'a> {
    correlation_id: String,
    customer_id: &'a str,
    message: &'a str,
    cancel: CancelSignal,
}

impl RequestContext<'_> {
    fn base_facts(&self, classification: &Classification) -> Facts {
        let mut facts = classification.facts.clone();
        facts.insert("correlation_id".to_string(), json!(self.correlation_id));
        facts.insert("customer_id".to_string(), json!(self.customer_id));
        facts.insert("message".to_string(), json!(self.message));
        facts.insert("intent".to_string(), json!(classification.intent));
        facts
    }
}

/// Classify, plan, execute. Shared across concurrent requests; each call owns its facts and trace.
pub struct AgentRuntime {
    classifier: Arc<dyn IntentClassifier>,
    planner: Planner,
    registry: ToolRegistry,
    executor: PlanExecutor,
    sink: Arc<dyn DiagnosticSink>,
    min_confidence: f64,
    tool_timeout: Duration,
}

impl AgentRuntime {
    pub fn new(
        classifier: Arc<dyn IntentClassifier>,
        planner: Planner,
        registry: ToolRegistry,
        sink: Arc<dyn DiagnosticSink>,
        min_confidence: f64,
        tool_timeout: Duration,
    ) -> Self {
        let executor = PlanExecutor::new(
            sink.clone(),
            ExecutionOptions { tool_timeout, cancel: CancelSignal::never() },
        );
        Self { classifier, planner, registry, executor, sink, min_confidence, tool_timeout }
    }

    pub fn from_config(
        config: &AppConfig,
        backend: Arc<InMemoryCxBackend>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, ApplicationError> {
        let planner = planner_from_config(config)?;
        let classifier: Arc<dyn IntentClassifier> = match config.agent.classifier {
            ClassifierKind::Keyword => Arc::new(KeywordIntentClassifier),
            ClassifierKind::Reasoning => {
                let client = HttpLlmClient::from_config(&config.llm)
                    .map_err(|error| ApplicationError::Configuration(error.to_string()))?;
                let intents = planner.intents().into_iter().map(str::to_string).collect();
                Arc::new(ReasoningIntentClassifier::new(
                    client,
                    ResponseDecoder::new(sink.clone()),
                    intents,
                ))
            }
        };
        let registry = cx_registry(
            backend,
            RetryPolicy::with_max_retries(config.agent.slot_lookup_retries),
        );

        Ok(Self::new(
            classifier,
            planner,
            registry,
            sink,
            config.agent.min_confidence,
            Duration::from_millis(config.agent.tool_timeout_ms),
        ))
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn classifier_name(&self) -> &'static str {
        self.classifier.name()
    }

    pub async fn handle_message(
        &self,
        customer_id: &str,
        message: &str,
    ) -> Result<AgentResponse, ApplicationError> {
        self.handle_message_with(customer_id, message, RequestOptions::default()).await
    }

    pub async fn handle_message_with(
        &self,
        customer_id: &str,
        message: &str,
        options: RequestOptions,
    ) -> Result<AgentResponse, ApplicationError> {
        let customer_id = customer_id.trim();
        let message = message.trim();
        if customer_id.is_empty() {
            return Err(ApplicationError::InvalidRequest(
                "customer_id must not be empty".to_string(),
            ));
        }
        if message.is_empty() {
            return Err(ApplicationError::InvalidRequest("message must not be empty".to_string()));
        }

        let ctx = RequestContext {
            correlation_id: options
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            customer_id,
            message,
            cancel: options.cancel,
        };
        info!(
            event_name = "runtime.request_received",
            correlation_id = %ctx.correlation_id,
            customer_id,
            classifier = self.classifier.name(),
            "handling customer message"
        );

        let request = ClassifyRequest { correlation_id: &ctx.correlation_id, customer_id, message };
        let classification = match self.classifier.classify(request).await {
            Ok(classification) => classification,
            Err(error) => {
                warn!(
                    event_name = "runtime.classification_failed",
                    correlation_id = %ctx.correlation_id,
                    customer_id,
                    error = %error,
                    "classification failed; escalating"
                );
                let reason = format!("Automated classification failed: {error}");
                let classification = unclassified(&reason);
                let response = self.escalate(&ctx, &classification, &reason).await?;
                return Ok(self.finish(&ctx, &classification, response).await);
            }
        };

        let response = self.route(&ctx, &classification).await?;
        Ok(self.finish(&ctx, &classification, response).await)
    }

    async fn route(
        &self,
        ctx: &RequestContext<'_>,
        classification: &Classification,
    ) -> Result<AgentResponse, ApplicationError> {
        if classification.decision_type == DecisionType::Clarify {
            return Ok(self.clarify(ctx, classification, &classification.reasoning));
        }
        if classification.confidence < self.min_confidence {
            let reason = format!(
                "{} (confidence {:.2} is below {:.2})",
                classification.reasoning, classification.confidence, self.min_confidence
            );
            return Ok(self.clarify(ctx, classification, &reason));
        }
        if classification.decision_type == DecisionType::Escalate {
            return self.escalate(ctx, classification, &classification.reasoning).await;
        }

        let facts = ctx.base_facts(classification);
        match self.planner.build_plan(&classification.intent, &classification.goal, &facts) {
            Ok(plan) => self.run_plan(ctx, classification, &plan, facts).await,
            Err(PlannerError::UnknownIntent(intent)) => {
                let reason = format!("No automated procedure exists for intent `{intent}`");
                self.escalate(ctx, classification, &reason).await
            }
            Err(PlannerError::MissingFact { fact, .. }) => {
                let reason = format!("I still need `{fact}` to continue");
                Ok(self.clarify(ctx, classification, &reason))
            }
            Err(error) => Err(planner_failure(error)),
        }
    }

    async fn escalate(
        &self,
        ctx: &RequestContext<'_>,
        classification: &Classification,
        reason: &str,
    ) -> Result<AgentResponse, ApplicationError> {
        let mut facts = ctx.base_facts(classification);
        facts.insert(ESCALATION_REASON_FACT.to_string(), json!(reason));

        let plan = self
            .planner
            .build_plan(ESCALATION_INTENT, "", &facts)
            .map_err(planner_failure)?;
        self.run_plan(ctx, classification, &plan, facts).await
    }

    fn clarify(
        &self,
        ctx: &RequestContext<'_>,
        classification: &Classification,
        reason: &str,
    ) -> AgentResponse {
        let explanation = format!(
            "I need to understand your request better: {reason}. Could you provide more details?"
        );
        AgentResponse::from_classification(
            &ctx.correlation_id,
            ctx.customer_id,
            classification,
            ResponseStatus::ClarificationNeeded,
            explanation,
        )
    }

    async fn run_plan(
        &self,
        ctx: &RequestContext<'_>,
        classification: &Classification,
        plan: &Plan,
        facts: Facts,
    ) -> Result<AgentResponse, ApplicationError> {
        let options =
            ExecutionOptions { tool_timeout: self.tool_timeout, cancel: ctx.cancel.clone() };
        let executor = self.executor.with_options(options);
        let result = executor
            .execute(plan, &self.registry, facts)
            .await
            .map_err(|error| ApplicationError::Registry(error.to_string()))?;

        let mut response = AgentResponse::from_classification(
            &ctx.correlation_id,
            ctx.customer_id,
            classification,
            ResponseStatus::Resolved,
            String::new(),
        );
        response.actions_taken = result.trace().invoked_tool_names();

        match result {
            ExecutionResult::Resolved { final_outputs, .. }
                if plan.intent() == ESCALATION_INTENT =>
            {
                response.status = ResponseStatus::Escalated;
                response.escalation_ticket = final_outputs.get("escalation_ticket").cloned();
                let reason = ticket_reason(&final_outputs);
                response.explanation =
                    escalation_explanation(reason.unwrap_or(&classification.reasoning));
            }
            ExecutionResult::Resolved { final_outputs, .. } => match plan.completion() {
                PlanCompletion::AwaitSelection { field } => {
                    response.status = ResponseStatus::AwaitingSelection;
                    response.available_slots = final_outputs.get(field).cloned();
                    response.explanation = selection_explanation(response.available_slots.as_ref());
                }
                PlanCompletion::Complete => {
                    response.appointment = final_outputs.get("appointment").cloned();
                    response.confirmation = confirmation_of(&final_outputs);
                    response.explanation = format!(
                        "I've taken care of it: {}. Status: completed automatically.",
                        plan.goal()
                    );
                }
            },
            ExecutionResult::Escalated { failed_step_index, reason, ticket, .. } => {
                response.status = ResponseStatus::Escalated;
                response.failed_step_index = Some(failed_step_index);
                response.escalation_ticket = ticket;
                response.explanation = escalation_explanation(&reason);
            }
        }

        Ok(response)
    }

    async fn finish(
        &self,
        ctx: &RequestContext<'_>,
        classification: &Classification,
        response: AgentResponse,
    ) -> AgentResponse {
        self.log_interaction(ctx, classification, &response).await;

        info!(
            event_name = outcome_event(response.status),
            correlation_id = %ctx.correlation_id,
            customer_id = ctx.customer_id,
            intent = %response.intent,
            status = response.status.as_str(),
            actions = response.actions_taken.len(),
            "request finished"
        );
        self.sink.emit(
            DiagnosticEvent::new(outcome_event(response.status), DiagnosticCategory::Runtime)
                .with_correlation_id(ctx.correlation_id.clone())
                .with_field("intent", response.intent.clone())
                .with_field("status", response.status.as_str()),
        );
        response
    }

    /// Best effort: a failure here is logged and never changes the response.
    async fn log_interaction(
        &self,
        ctx: &RequestContext<'_>,
        classification: &Classification,
        response: &AgentResponse,
    ) {
        if !self.registry.contains(LOG_INTERACTION) {
            return;
        }

        let mut params = ToolParams::new();
        params.insert("customer_id".to_string(), json!(ctx.customer_id));
        params.insert("intent".to_string(), json!(response.intent));
        params.insert("decision".to_string(), json!(classification.reasoning));
        params.insert("actions".to_string(), json!(response.actions_taken));
        params.insert("status".to_string(), json!(response.status.as_str()));

        let outcome =
            tokio::time::timeout(self.tool_timeout, self.registry.invoke(LOG_INTERACTION, &params))
                .await;
        let failure = match outcome {
            Ok(Ok(output)) if output.success => None,
            Ok(Ok(output)) => Some(output.failure_reason().to_string()),
            Ok(Err(error)) => Some(error.to_string()),
            Err(_) => Some("timed out".to_string()),
        };
        if let Some(reason) = failure {
            warn!(
                event_name = "runtime.interaction_log_failed",
                correlation_id = %ctx.correlation_id,
                customer_id = ctx.customer_id,
                reason = %reason,
                "could not record the interaction"
            );
        }
    }
}

/// Demo fixtures unless a fixtures file is configured.
pub fn backend_from_config(config: &AppConfig) -> Result<Arc<InMemoryCxBackend>, ApplicationError> {
    let fixtures = match &config.agent.fixtures_path {
        Some(path) => BackendFixtures::from_json_file(path)
            .map_err(|error| ApplicationError::Configuration(error.to_string()))?,
        None => BackendFixtures::demo(),
    };
    Ok(Arc::new(InMemoryCxBackend::new(fixtures)))
}

pub fn planner_from_config(config: &AppConfig) -> Result<Planner, ApplicationError> {
    match &config.agent.templates_path {
        Some(path) => Planner::from_toml_file(path).map_err(planner_failure),
        None => Ok(Planner::default()),
    }
}

fn planner_failure(error: PlannerError) -> ApplicationError {
    match error {
        PlannerError::Construction { source, .. } => ApplicationError::PlanConstruction(source),
        other => ApplicationError::Configuration(other.to_string()),
    }
}

fn unclassified(reason: &str) -> Classification {
    Classification {
        intent: UNKNOWN_INTENT.to_string(),
        goal: goal_for(UNKNOWN_INTENT).to_string(),
        decision: "escalate".to_string(),
        decision_type: DecisionType::Escalate,
        reasoning: reason.to_string(),
        recommended_action: "escalate_to_human".to_string(),
        confidence: 0.0,
        facts: Facts::new(),
    }
}

fn ticket_reason(final_outputs: &Map<String, Value>) -> Option<&str> {
    final_outputs
        .get("escalation_ticket")
        .and_then(|ticket| ticket.get("reason"))
        .and_then(Value::as_str)
}

fn confirmation_of(final_outputs: &Map<String, Value>) -> Option<Value> {
    final_outputs.get("sent")?;
    let confirmation = CONFIRMATION_FIELDS
        .iter()
        .filter_map(|field| {
            final_outputs.get(*field).map(|value| (field.to_string(), value.clone()))
        })
        .collect::<Map<_, _>>();
    Some(Value::Object(confirmation))
}

fn escalation_explanation(reason: &str) -> String {
    format!("I've reviewed your request: {reason}. Escalating to a specialist for better support.")
}

fn selection_explanation(slots: Option<&Value>) -> String {
    let first = slots
        .and_then(|slots| slots.get(0))
        .and_then(|slot| slot.get("slot_id"))
        .and_then(Value::as_str);
    match first {
        Some(slot_id) => format!(
            "Here are the open slots for your missed appointment. Reply with the one you want, for example \"{slot_id}\"."
        ),
        None => "Here are the open slots for your missed appointment.".to_string(),
    }
}

fn outcome_event(status: ResponseStatus) -> &'static str {
    match status {
        ResponseStatus::Resolved => "runtime.request_resolved",
        ResponseStatus::Escalated => "runtime.request_escalated",
        ResponseStatus::ClarificationNeeded => "runtime.clarification_requested",
        ResponseStatus::AwaitingSelection => "runtime.awaiting_selection",
    }
}
