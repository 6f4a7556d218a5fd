use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::customer::CustomerId;

pub const DEFAULT_ESCALATION_QUEUE: &str = "missed_appointment_specialist";
pub const DEFAULT_ESTIMATED_WAIT_MINUTES: u32 = 5;
pub const UNKNOWN_CUSTOMER_NAME: &str = "Unknown";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub String);

impl TicketId {
    pub fn generate() -> Self {
        Self(format!("esc_{}", Uuid::new_v4().simple()))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Hand-off record for a human agent. Carries enough context to pick up the case.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationTicket {
    pub ticket_id: TicketId,
    pub customer_id: CustomerId,
    pub customer_name: String,
    pub priority: TicketPriority,
    pub reason: String,
    pub queue: String,
    pub intent: Option<String>,
    pub failed_step_index: Option<usize>,
    pub failed_tool: Option<String>,
    pub created_at: DateTime<Utc>,
    pub estimated_wait_minutes: u32,
}

impl EscalationTicket {
    pub fn open(
        customer_id: CustomerId,
        customer_name: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            ticket_id: TicketId::generate(),
            customer_id,
            customer_name: customer_name.unwrap_or_else(|| UNKNOWN_CUSTOMER_NAME.to_string()),
            priority: TicketPriority::default(),
            reason: reason.into(),
            queue: DEFAULT_ESCALATION_QUEUE.to_string(),
            intent: None,
            failed_step_index: None,
            failed_tool: None,
            created_at: Utc::now(),
            estimated_wait_minutes: DEFAULT_ESTIMATED_WAIT_MINUTES,
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn with_failed_step(mut self, index: usize, tool: Option<String>) -> Self {
        self.failed_step_index = Some(index);
        self.failed_tool = tool;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{EscalationTicket, TicketPriority, DEFAULT_ESCALATION_QUEUE};
    use crate::domain::customer::CustomerId;

    #[test]
    fn unknown_customers_still_get_a_ticket() {
        let ticket = EscalationTicket::open(CustomerId::from("999"), None, "no slots")
            .with_intent("missed_appointment_rebook")
            .with_failed_step(1, Some("get_available_slots".to_string()));

        assert!(ticket.ticket_id.0.starts_with("esc_"));
        assert_eq!(ticket.customer_name, "Unknown");
        assert_eq!(ticket.priority, TicketPriority::Normal);
        assert_eq!(ticket.queue, DEFAULT_ESCALATION_QUEUE);
        assert_eq!(ticket.failed_step_index, Some(1));
        assert_eq!(ticket.failed_tool.as_deref(), Some("get_available_slots"));
        assert_eq!(ticket.estimated_wait_minutes, 5);
    }
}
