use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use caseflow_core::domain::customer::CustomerId;
use caseflow_core::domain::interaction::InteractionRecord;
use caseflow_core::plan::ToolOutput;
use chrono::Utc;
use serde_json::{json, Value};

use crate::backend::{EscalationRequest, InMemoryCxBackend};
use crate::tools::{
    ParameterSpec, RetryPolicy, RetryingTool, Tool, ToolDescriptor, ToolParams, ToolRegistry,
};

pub const CHECK_ELIGIBILITY: &str = "check_eligibility";
pub const GET_AVAILABLE_SLOTS: &str = "get_available_slots";
pub const GET_MISSED_APPOINTMENT: &str = "get_missed_appointment";
pub const REBOOK_APPOINTMENT: &str = "rebook_appointment";
pub const SEND_CONFIRMATION: &str = "send_confirmation";
pub const CREATE_ESCALATION_TICKET: &str = "create_escalation_ticket";
pub const LOG_INTERACTION: &str = "log_interaction";

pub const DEFAULT_SLOT_LIMIT: usize = 5;

/// Registers every CX adapter. Only the slot lookup is wrapped for retries.
pub fn register_cx_tools(
    registry: &mut ToolRegistry,
    backend: Arc<InMemoryCxBackend>,
    slot_retry: RetryPolicy,
) {
    registry.register(CheckEligibilityTool::new(backend.clone()));
    registry.register(RetryingTool::new(GetAvailableSlotsTool::new(backend.clone()), slot_retry));
    registry.register(GetMissedAppointmentTool::new(backend.clone()));
    registry.register(RebookAppointmentTool::new(backend.clone()));
    registry.register(SendConfirmationTool::new(backend.clone()));
    registry.register(CreateEscalationTicketTool::new(backend.clone()));
    registry.register(LogInteractionTool::new(backend));
}

pub fn cx_registry(backend: Arc<InMemoryCxBackend>, slot_retry: RetryPolicy) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    register_cx_tools(&mut registry, backend, slot_retry);
    registry
}

fn required_str<'a>(params: &'a ToolParams, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("parameter `{name}` must be a non-empty string"))
}

fn optional_str(params: &ToolParams, name: &str) -> Option<String> {
    params.get(name).and_then(Value::as_str).map(str::to_string)
}

macro_rules! backend_tool {
    ($name:ident) => {
        pub struct $name {
            backend: Arc<InMemoryCxBackend>,
        }

        impl $name {
            pub fn new(backend: Arc<InMemoryCxBackend>) -> Self {
                Self { backend }
            }
        }
    };
}

backend_tool!(CheckEligibilityTool);
backend_tool!(GetAvailableSlotsTool);
backend_tool!(GetMissedAppointmentTool);
backend_tool!(RebookAppointmentTool);
backend_tool!(SendConfirmationTool);
backend_tool!(CreateEscalationTicketTool);
backend_tool!(LogInteractionTool);

#[async_trait]
impl Tool for CheckEligibilityTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: CHECK_ELIGIBILITY,
            description: "Checks whether the customer may self-serve a rebooking",
            inputs: vec![ParameterSpec::required("customer_id")],
            outputs: vec!["eligible", "reason"],
        }
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput> {
        let customer_id = required_str(params, "customer_id")?;
        let eligibility = self.backend.check_eligibility(customer_id).await;
        Ok(ToolOutput::ok_json(json!({
            "eligible": eligibility.eligible,
            "reason": eligibility.reason,
        })))
    }
}

#[async_trait]
impl Tool for GetAvailableSlotsTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: GET_AVAILABLE_SLOTS,
            description: "Lists open appointment slots in inventory order",
            inputs: vec![ParameterSpec::required("customer_id"), ParameterSpec::optional("limit")],
            outputs: vec!["slots"],
        }
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput> {
        let customer_id = required_str(params, "customer_id")?;
        let limit = match params.get("limit") {
            None | Some(Value::Null) => DEFAULT_SLOT_LIMIT,
            Some(value) => value
                .as_u64()
                .and_then(|limit| usize::try_from(limit).ok())
                .ok_or_else(|| anyhow!("parameter `limit` must be a non-negative integer"))?,
        };

        let slots = self.backend.available_slots(customer_id, limit).await;
        Ok(ToolOutput::ok_json(json!({ "slots": serde_json::to_value(slots)? })))
    }
}

#[async_trait]
impl Tool for GetMissedAppointmentTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: GET_MISSED_APPOINTMENT,
            description: "Fetches the customer's most recent missed appointment",
            inputs: vec![ParameterSpec::required("customer_id")],
            outputs: vec!["missed"],
        }
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput> {
        let customer_id = required_str(params, "customer_id")?;
        let missed = self.backend.missed_appointment(customer_id).await;
        Ok(ToolOutput::ok_json(json!({ "missed": serde_json::to_value(missed)? })))
    }
}

#[async_trait]
impl Tool for RebookAppointmentTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: REBOOK_APPOINTMENT,
            description: "Books the given slot for the customer",
            inputs: vec![
                ParameterSpec::required("customer_id"),
                ParameterSpec::required("slot_id"),
            ],
            outputs: vec!["status", "appointment"],
        }
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput> {
        let customer_id = required_str(params, "customer_id")?;
        let slot_id = required_str(params, "slot_id")?;

        let appointment = self
            .backend
            .rebook(customer_id, slot_id)
            .await
            .with_context(|| format!("rebooking slot `{slot_id}` failed"))?;

        Ok(ToolOutput::ok_json(json!({
            "status": appointment.status.as_str(),
            "appointment": serde_json::to_value(&appointment)?,
        })))
    }
}

#[async_trait]
impl Tool for SendConfirmationTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: SEND_CONFIRMATION,
            description: "Sends the booking confirmation by email and SMS",
            inputs: vec![
                ParameterSpec::required("customer_id"),
                ParameterSpec::required("appointment"),
            ],
            outputs: vec!["sent", "channels", "recipient"],
        }
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput> {
        let customer_id = required_str(params, "customer_id")?;
        let appointment_id = params
            .get("appointment")
            .and_then(|appointment| appointment.get("appointment_id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let confirmation = self.backend.send_confirmation(customer_id, appointment_id).await?;

        Ok(ToolOutput::ok_json(json!({
            "sent": true,
            "channels": confirmation.channels,
            "recipient": serde_json::to_value(&confirmation.recipient)?,
            "appointment_id": confirmation.appointment_id,
            "sent_at": confirmation.sent_at.to_rfc3339(),
        })))
    }
}

#[async_trait]
impl Tool for CreateEscalationTicketTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: CREATE_ESCALATION_TICKET,
            description: "Routes the case to a human agent with full context",
            inputs: vec![
                ParameterSpec::required("customer_id"),
                ParameterSpec::required("reason"),
                ParameterSpec::optional("intent"),
                ParameterSpec::optional("failed_step_index"),
                ParameterSpec::optional("failed_tool"),
            ],
            outputs: vec!["escalation_ticket", "ticket_id"],
        }
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput> {
        let request = EscalationRequest {
            customer_id: required_str(params, "customer_id")?.to_string(),
            reason: required_str(params, "reason")?.to_string(),
            intent: optional_str(params, "intent"),
            failed_step_index: params
                .get("failed_step_index")
                .and_then(Value::as_u64)
                .and_then(|index| usize::try_from(index).ok()),
            failed_tool: optional_str(params, "failed_tool"),
        };

        let ticket = self.backend.open_ticket(request).await;
        Ok(ToolOutput::ok_json(json!({
            "ticket_id": ticket.ticket_id.0.clone(),
            "escalation_ticket": serde_json::to_value(&ticket)?,
        })))
    }
}

#[async_trait]
impl Tool for LogInteractionTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: LOG_INTERACTION,
            description: "Appends the interaction to the analytics log",
            inputs: vec![
                ParameterSpec::required("customer_id"),
                ParameterSpec::required("intent"),
                ParameterSpec::required("decision"),
                ParameterSpec::optional("actions"),
                ParameterSpec::optional("status"),
            ],
            outputs: vec!["logged"],
        }
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput> {
        let actions = params
            .get("actions")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        let record = InteractionRecord {
            customer_id: CustomerId::from(required_str(params, "customer_id")?),
            intent: required_str(params, "intent")?.to_string(),
            decision: required_str(params, "decision")?.to_string(),
            actions,
            status: optional_str(params, "status").unwrap_or_else(|| "in_progress".to_string()),
            recorded_at: Utc::now(),
        };

        self.backend.log_interaction(record).await;
        Ok(ToolOutput::ok_json(json!({ "logged": true })))
    }
}
