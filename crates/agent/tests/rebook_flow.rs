use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caseflow_agent::adapters::{cx_registry, CREATE_ESCALATION_TICKET};
use caseflow_agent::backend::{BackendFixtures, InMemoryCxBackend};
use caseflow_agent::classifier::{
    IntentClassifier, KeywordIntentClassifier, ReasoningIntentClassifier,
};
use caseflow_agent::executor::{ExecutionError, ExecutionResult, PlanExecutor};
use caseflow_agent::llm::{LlmClient, LlmError};
use caseflow_agent::planner::{Planner, REBOOK_EXCEPTION_INTENT, REBOOK_INTENT};
use caseflow_agent::tools::{RetryPolicy, ToolRegistry};
use caseflow_agent::{AgentRuntime, ResponseStatus};
use caseflow_core::decision::ResponseDecoder;
use caseflow_core::diagnostics::{DiagnosticSink, InMemoryDiagnosticSink, NoopDiagnosticSink};
use caseflow_core::domain::customer::{AccountStatus, Customer, CustomerId, LoyaltyTier};
use caseflow_core::plan::{Expectation, Facts, PlanBuilder, Step};
use serde_json::{json, Value};

struct Harness {
    runtime: Arc<AgentRuntime>,
    backend: Arc<InMemoryCxBackend>,
    registry: ToolRegistry,
}

fn harness_with(
    fixtures: BackendFixtures,
    classifier: Arc<dyn IntentClassifier>,
    sink: Arc<dyn DiagnosticSink>,
) -> Harness {
    let backend = Arc::new(InMemoryCxBackend::new(fixtures));
    let registry = cx_registry(backend.clone(), RetryPolicy::with_max_retries(0));
    let runtime = AgentRuntime::new(
        classifier,
        Planner::default(),
        registry.clone(),
        sink,
        0.5,
        Duration::from_secs(2),
    );
    Harness { runtime: Arc::new(runtime), backend, registry }
}

fn harness() -> Harness {
    harness_with(
        BackendFixtures::demo(),
        Arc::new(KeywordIntentClassifier),
        Arc::new(NoopDiagnosticSink),
    )
}

fn customer_facts(customer_id: &str) -> Facts {
    let mut facts = Facts::new();
    facts.insert("customer_id".to_string(), json!(customer_id));
    facts
}

fn gold_customer(id: &str) -> Customer {
    Customer {
        customer_id: CustomerId::from(id),
        name: format!("Customer {id}"),
        email: format!("{id}@example.com"),
        phone: "+1-555-0100".to_string(),
        account_status: AccountStatus::Active,
        loyalty_tier: LoyaltyTier::Gold,
        missed_appointment_count: 1,
    }
}

#[tokio::test]
async fn eligible_customer_is_rebooked_into_the_first_slot() {
    let harness = harness();

    let response = harness
        .runtime
        .handle_message("123", "I missed my appointment yesterday, can I rebook?")
        .await
        .expect("structured outcome");

    assert_eq!(response.status, ResponseStatus::Resolved);
    assert_eq!(response.intent, REBOOK_INTENT);
    assert_eq!(
        response.actions_taken,
        vec!["check_eligibility", "get_available_slots", "rebook_appointment", "send_confirmation"]
    );
    let appointment = response.appointment.clone().unwrap_or(Value::Null);
    assert_eq!(appointment["slot_id"], json!("slot_001"));
    assert_eq!(appointment["status"], json!("confirmed"));
    assert_eq!(response.confirmation.as_ref().map(|c| c["sent"].clone()), Some(json!(true)));
    assert_eq!(response.failed_step_index, None);

    assert!(!harness.backend.open_slot_ids().await.contains(&"slot_001".to_string()));
    let interactions = harness.backend.interactions().await;
    assert_eq!(interactions.len(), 1);
    assert_eq!(interactions[0].status, "resolved");
    assert!(harness.backend.tickets().await.is_empty());
}

#[tokio::test]
async fn empty_slot_list_escalates_at_step_one_with_ticket() {
    let fixtures = BackendFixtures { available_slots: Vec::new(), ..BackendFixtures::demo() };
    let harness =
        harness_with(fixtures, Arc::new(KeywordIntentClassifier), Arc::new(NoopDiagnosticSink));

    let response = harness
        .runtime
        .handle_message("123", "I missed my appointment, please rebook me")
        .await
        .expect("structured outcome");

    assert_eq!(response.status, ResponseStatus::Escalated);
    assert_eq!(response.failed_step_index, Some(1));
    assert_eq!(
        response.actions_taken,
        vec!["check_eligibility", "get_available_slots", "create_escalation_ticket"]
    );

    let ticket = response.escalation_ticket.clone().unwrap_or(Value::Null);
    assert_eq!(ticket["customer_id"], json!("123"));
    assert_eq!(ticket["intent"], json!(REBOOK_INTENT));
    assert_eq!(ticket["failed_step_index"], json!(1));
    assert_eq!(ticket["failed_tool"], json!("get_available_slots"));
    assert!(ticket["reason"].as_str().unwrap_or_default().starts_with("No available slots"));
    assert_eq!(harness.backend.tickets().await.len(), 1);
}

#[tokio::test]
async fn ineligible_customer_is_escalated_before_any_booking() {
    let harness = harness();

    let response = harness
        .runtime
        .handle_message("456", "I missed my appointment again, can I rebook?")
        .await
        .expect("structured outcome");

    assert_eq!(response.status, ResponseStatus::Escalated);
    assert_eq!(response.failed_step_index, Some(0));
    assert!(response.explanation.contains("missed appointment limit"));
    assert_eq!(harness.backend.open_slot_ids().await.len(), 6);

    let tickets = harness.backend.tickets().await;
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].customer_name, "Sam Rivera");
    assert!(tickets[0].reason.starts_with("Customer not eligible for rebooking"));
}

#[tokio::test]
async fn offer_then_confirm_books_the_chosen_slot() {
    let harness = harness();

    let offer = harness
        .runtime
        .handle_message("123", "I missed my appointment. What options are available?")
        .await
        .expect("structured outcome");

    assert_eq!(offer.status, ResponseStatus::AwaitingSelection);
    let slots = offer.available_slots.clone().unwrap_or(Value::Null);
    assert_eq!(slots.as_array().map(Vec::len), Some(5));
    assert!(offer.appointment.is_none());
    assert_eq!(harness.backend.open_slot_ids().await.len(), 6);

    let confirm = harness
        .runtime
        .handle_message("123", "I'll take slot 3 please")
        .await
        .expect("structured outcome");

    assert_eq!(confirm.status, ResponseStatus::Resolved);
    assert_eq!(confirm.actions_taken, vec!["rebook_appointment", "send_confirmation"]);
    let appointment = confirm.appointment.clone().unwrap_or(Value::Null);
    assert_eq!(appointment["slot_id"], json!("slot_003"));

    let open = harness.backend.open_slot_ids().await;
    assert!(open.contains(&"slot_001".to_string()));
    assert!(!open.contains(&"slot_003".to_string()));
}

#[tokio::test]
async fn confirming_a_taken_slot_escalates() {
    let harness = harness();

    let response = harness
        .runtime
        .handle_message("123", "book slot_042")
        .await
        .expect("structured outcome");

    assert_eq!(response.status, ResponseStatus::Escalated);
    assert_eq!(response.failed_step_index, Some(0));
    let reason = response.escalation_ticket.as_ref().map(|ticket| ticket["reason"].clone());
    assert!(reason
        .and_then(|reason| reason.as_str().map(str::to_string))
        .is_some_and(|reason| reason.contains("slot_042")));
}

#[tokio::test]
async fn exception_template_rebooks_past_the_eligibility_limit() {
    let harness = harness();
    let plan = Planner::default()
        .build_plan(REBOOK_EXCEPTION_INTENT, "", &customer_facts("456"))
        .expect("exception plan builds");

    let result = PlanExecutor::default()
        .execute(&plan, &harness.registry, customer_facts("456"))
        .await
        .expect("no fatal error");

    let ExecutionResult::Resolved { final_outputs, trace } = result else {
        panic!("exception plan should resolve");
    };
    assert_eq!(trace.len(), 4);
    assert_eq!(final_outputs.get("sent"), Some(&json!(true)));
    let interactions = harness.backend.interactions().await;
    assert_eq!(interactions.len(), 1);
    assert_eq!(interactions[0].status, "override_applied");
}

#[tokio::test]
async fn unregistered_tool_aborts_without_side_effects() {
    let harness = harness();
    let plan = PlanBuilder::new(REBOOK_INTENT, "book a flight instead")
        .step(
            Step::new("check_eligibility", Expectation::Succeeded)
                .with_literal("customer_id", json!("123")),
        )
        .step(Step::new("book_flight", Expectation::Succeeded))
        .build()
        .expect("plan builds");

    let result = PlanExecutor::default().execute(&plan, &harness.registry, Facts::new()).await;

    match result {
        Err(ExecutionError::UnknownTool { tools, .. }) => assert_eq!(tools, vec!["book_flight"]),
        other => panic!("expected unknown tool error, got {other:?}"),
    }
    assert!(harness.backend.interactions().await.is_empty());
    assert!(harness.backend.tickets().await.is_empty());
}

#[tokio::test]
async fn cancellation_request_is_routed_to_a_human() {
    let harness = harness();

    let response = harness
        .runtime
        .handle_message("123", "Please cancel my appointment")
        .await
        .expect("structured outcome");

    assert_eq!(response.status, ResponseStatus::Escalated);
    assert_eq!(response.actions_taken, vec![CREATE_ESCALATION_TICKET.to_string()]);
    assert_eq!(response.failed_step_index, None);
    let tickets = harness.backend.tickets().await;
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].intent.as_deref(), Some("cancel_appointment"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_double_book_a_slot() {
    let ids = ["c1", "c2", "c3", "c4"];
    let fixtures = BackendFixtures {
        customers: ids.iter().map(|id| gold_customer(id)).collect(),
        ..BackendFixtures::demo()
    };
    let harness =
        harness_with(fixtures, Arc::new(KeywordIntentClassifier), Arc::new(NoopDiagnosticSink));

    let handles = ids
        .iter()
        .map(|id| {
            let runtime = harness.runtime.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                runtime.handle_message(&id, "I missed my appointment and want to rebook").await
            })
        })
        .collect::<Vec<_>>();

    // Two requests may race for the same first slot; the loser escalates.
    let mut booked = Vec::new();
    let mut escalated = 0;
    for handle in handles {
        let response = handle.await.expect("task joins").expect("structured outcome");
        match response.status {
            ResponseStatus::Resolved => {
                let slot = response.appointment.map(|apt| apt["slot_id"].clone());
                booked.push(slot.unwrap_or(Value::Null).to_string());
            }
            ResponseStatus::Escalated => escalated += 1,
            other => panic!("unexpected status {other:?}"),
        }
    }

    let distinct = booked.iter().collect::<HashSet<_>>();
    assert_eq!(distinct.len(), booked.len());
    assert_eq!(booked.len() + escalated, ids.len());
    assert_eq!(harness.backend.open_slot_ids().await.len(), 6 - booked.len());
}

struct ProseLlm(&'static str);

#[async_trait]
impl LlmClient for ProseLlm {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
        Ok(self.0.to_string())
    }

    fn provider_name(&self) -> &str {
        "prose"
    }

    fn model_name(&self) -> &str {
        "prose-1"
    }
}

#[tokio::test]
async fn reasoning_answer_embedded_in_prose_drives_the_rebook_plan() {
    let sink = InMemoryDiagnosticSink::default();
    let reply = "Here is the result: {\"intent\":\"missed_appointment_rebook\",\"goal\":\"rebook\",\
                 \"decision\":\"automate\",\"decision_type\":\"AUTOMATE\",\"reasoning\":\"eligible\",\
                 \"recommended_action\":\"rebook_appointment\",\"confidence\":0.95}";
    let classifier = ReasoningIntentClassifier::new(
        ProseLlm(reply),
        ResponseDecoder::new(Arc::new(sink.clone())),
        vec![REBOOK_INTENT.to_string()],
    );
    let harness =
        harness_with(BackendFixtures::demo(), Arc::new(classifier), Arc::new(sink.clone()));

    let response = harness
        .runtime
        .handle_message("123", "missed it, rebook please")
        .await
        .expect("structured outcome");

    assert_eq!(response.status, ResponseStatus::Resolved);
    assert!((response.confidence - 0.95).abs() < f64::EPSILON);
    assert!(sink.kinds().contains(&"decode.succeeded".to_string()));
}

#[tokio::test]
async fn undecodable_reasoning_answer_escalates() {
    let classifier = ReasoningIntentClassifier::new(
        ProseLlm("I think they want to rebook, probably."),
        ResponseDecoder::default(),
        Vec::new(),
    );
    let harness =
        harness_with(BackendFixtures::demo(), Arc::new(classifier), Arc::new(NoopDiagnosticSink));

    let response = harness
        .runtime
        .handle_message("123", "missed it, rebook please")
        .await
        .expect("structured outcome");

    assert_eq!(response.status, ResponseStatus::Escalated);
    assert!(response.confidence.abs() < f64::EPSILON);
    assert_eq!(harness.backend.tickets().await.len(), 1);
    assert_eq!(harness.backend.open_slot_ids().await.len(), 6);
}
