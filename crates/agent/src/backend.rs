//! In-memory customer-experience backend.
//!
//! Stands in for the profile store, slot inventory, notification gateway and
//! ticketing queue. Adapters in [`crate::adapters`] are the only callers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use caseflow_core::domain::appointment::{
    Appointment, AppointmentId, AppointmentStatus, Slot, SlotId,
};
use caseflow_core::domain::customer::{
    AccountStatus, Customer, CustomerId, Eligibility, LoyaltyTier,
};
use caseflow_core::domain::interaction::InteractionRecord;
use caseflow_core::domain::ticket::EscalationTicket;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub const CONFIRMATION_CHANNELS: [&str; 2] = ["email", "sms"];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("could not read fixtures `{path}`: {source}")]
    ReadFixtures { path: PathBuf, source: std::io::Error },
    #[error("could not parse fixtures `{path}`: {source}")]
    ParseFixtures { path: PathBuf, source: serde_json::Error },
    #[error("customer `{0}` not found")]
    CustomerNotFound(String),
    #[error("slot `{0}` not found")]
    SlotNotFound(String),
}

/// Seed data for [`InMemoryCxBackend`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendFixtures {
    pub customers: Vec<Customer>,
    #[serde(default)]
    pub available_slots: Vec<Slot>,
    #[serde(default)]
    pub appointments: Vec<Appointment>,
}

impl BackendFixtures {
    pub fn from_json_file(path: &Path) -> Result<Self, BackendError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| BackendError::ReadFixtures { path: path.to_path_buf(), source })?;
        serde_json::from_str(&raw)
            .map_err(|source| BackendError::ParseFixtures { path: path.to_path_buf(), source })
    }

    /// Built-in data set covering the eligible, over-limit, suspended and bronze cases.
    pub fn demo() -> Self {
        let base = Utc.with_ymd_and_hms(2026, 11, 2, 9, 0, 0).single().unwrap_or_default();

        let customers = vec![
            demo_customer("123", "Jordan Lee", AccountStatus::Active, LoyaltyTier::Gold, 0),
            demo_customer("456", "Sam Rivera", AccountStatus::Active, LoyaltyTier::Silver, 3),
            demo_customer("789", "Alex Chen", AccountStatus::Suspended, LoyaltyTier::Silver, 1),
            demo_customer("321", "Casey Morgan", AccountStatus::Active, LoyaltyTier::Bronze, 1),
        ];

        let available_slots = (0..6)
            .map(|index| Slot {
                slot_id: SlotId(format!("slot_{:03}", index + 1)),
                service_type: "consultation".to_string(),
                starts_at: base + Duration::hours(i64::from(index) * 3),
                duration_minutes: 30,
            })
            .collect();

        let appointments = ["123", "456", "789", "321"]
            .into_iter()
            .enumerate()
            .map(|(index, customer_id)| Appointment {
                appointment_id: AppointmentId(format!("apt_missed_{customer_id}")),
                customer_id: CustomerId::from(customer_id),
                slot_id: None,
                service_type: "consultation".to_string(),
                starts_at: base - Duration::days(1 + index as i64),
                duration_minutes: 30,
                status: AppointmentStatus::Missed,
                rebooked_from: None,
            })
            .collect();

        Self { customers, available_slots, appointments }
    }
}

fn demo_customer(
    id: &str,
    name: &str,
    account_status: AccountStatus,
    loyalty_tier: LoyaltyTier,
    missed_appointment_count: u32,
) -> Customer {
    let handle = name.to_ascii_lowercase().replace(' ', ".");
    Customer {
        customer_id: CustomerId::from(id),
        name: name.to_string(),
        email: format!("{handle}@example.com"),
        phone: format!("+1-555-0{id}"),
        account_status,
        loyalty_tier,
        missed_appointment_count,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    pub phone: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub customer_id: CustomerId,
    pub appointment_id: Option<String>,
    pub channels: Vec<String>,
    pub recipient: Recipient,
    pub sent_at: DateTime<Utc>,
}

/// Context attached to a new escalation ticket.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EscalationRequest {
    pub customer_id: String,
    pub reason: String,
    pub intent: Option<String>,
    pub failed_step_index: Option<usize>,
    pub failed_tool: Option<String>,
}

#[derive(Default)]
struct BackendState {
    customers: HashMap<CustomerId, Customer>,
    slots: Vec<Slot>,
    appointments: Vec<Appointment>,
    confirmations: Vec<Confirmation>,
    tickets: Vec<EscalationTicket>,
    interactions: Vec<InteractionRecord>,
}

#[derive(Default)]
pub struct InMemoryCxBackend {
    state: RwLock<BackendState>,
}

impl InMemoryCxBackend {
    pub fn new(fixtures: BackendFixtures) -> Self {
        let customers = fixtures
            .customers
            .into_iter()
            .map(|customer| (customer.customer_id.clone(), customer))
            .collect();
        Self {
            state: RwLock::new(BackendState {
                customers,
                slots: fixtures.available_slots,
                appointments: fixtures.appointments,
                ..BackendState::default()
            }),
        }
    }

    pub fn demo() -> Self {
        Self::new(BackendFixtures::demo())
    }

    pub async fn customer(&self, customer_id: &str) -> Option<Customer> {
        let state = self.state.read().await;
        state.customers.get(&CustomerId::from(customer_id)).cloned()
    }

    pub async fn check_eligibility(&self, customer_id: &str) -> Eligibility {
        match self.customer(customer_id).await {
            Some(customer) => customer.rebook_eligibility(),
            None => Eligibility::customer_not_found(),
        }
    }

    /// First `limit` open slots in inventory order. Unknown customers get none.
    pub async fn available_slots(&self, customer_id: &str, limit: usize) -> Vec<Slot> {
        let state = self.state.read().await;
        if !state.customers.contains_key(&CustomerId::from(customer_id)) {
            return Vec::new();
        }
        state.slots.iter().take(limit).cloned().collect()
    }

    pub async fn missed_appointment(&self, customer_id: &str) -> Option<Appointment> {
        let state = self.state.read().await;
        state
            .appointments
            .iter()
            .rev()
            .find(|appointment| {
                appointment.customer_id.as_str() == customer_id && appointment.is_missed()
            })
            .cloned()
    }

    /// Books `slot_id` and removes it from the open inventory.
    pub async fn rebook(
        &self,
        customer_id: &str,
        slot_id: &str,
    ) -> Result<Appointment, BackendError> {
        let mut state = self.state.write().await;
        let customer_id = CustomerId::from(customer_id);
        if !state.customers.contains_key(&customer_id) {
            return Err(BackendError::CustomerNotFound(customer_id.0));
        }

        let position = state
            .slots
            .iter()
            .position(|slot| slot.slot_id.0 == slot_id)
            .ok_or_else(|| BackendError::SlotNotFound(slot_id.to_string()))?;
        let slot = state.slots.remove(position);

        let appointment = Appointment::rebooked(customer_id, &slot);
        state.appointments.push(appointment.clone());
        Ok(appointment)
    }

    pub async fn send_confirmation(
        &self,
        customer_id: &str,
        appointment_id: Option<String>,
    ) -> Result<Confirmation, BackendError> {
        let mut state = self.state.write().await;
        let customer = state
            .customers
            .get(&CustomerId::from(customer_id))
            .cloned()
            .ok_or_else(|| BackendError::CustomerNotFound(customer_id.to_string()))?;

        let confirmation = Confirmation {
            customer_id: customer.customer_id,
            appointment_id,
            channels: CONFIRMATION_CHANNELS.iter().map(|channel| channel.to_string()).collect(),
            recipient: Recipient { email: customer.email, phone: customer.phone },
            sent_at: Utc::now(),
        };
        state.confirmations.push(confirmation.clone());
        Ok(confirmation)
    }

    /// Always opens a ticket, even for customers the backend does not know.
    pub async fn open_ticket(&self, request: EscalationRequest) -> EscalationTicket {
        let mut state = self.state.write().await;
        let customer_id = CustomerId::from(request.customer_id.as_str());
        let customer_name =
            state.customers.get(&customer_id).map(|customer| customer.name.clone());

        let mut ticket = EscalationTicket::open(customer_id, customer_name, request.reason);
        if let Some(intent) = request.intent {
            ticket = ticket.with_intent(intent);
        }
        if let Some(index) = request.failed_step_index {
            ticket = ticket.with_failed_step(index, request.failed_tool);
        }

        state.tickets.push(ticket.clone());
        ticket
    }

    pub async fn log_interaction(&self, record: InteractionRecord) {
        let mut state = self.state.write().await;
        state.interactions.push(record);
    }

    pub async fn tickets(&self) -> Vec<EscalationTicket> {
        self.state.read().await.tickets.clone()
    }

    pub async fn interactions(&self) -> Vec<InteractionRecord> {
        self.state.read().await.interactions.clone()
    }

    pub async fn confirmations(&self) -> Vec<Confirmation> {
        self.state.read().await.confirmations.clone()
    }

    pub async fn open_slot_ids(&self) -> Vec<String> {
        self.state.read().await.slots.iter().map(|slot| slot.slot_id.0.clone()).collect()
    }

    pub async fn appointments_for(&self, customer_id: &str) -> Vec<Appointment> {
        let state = self.state.read().await;
        state
            .appointments
            .iter()
            .filter(|appointment| appointment.customer_id.as_str() == customer_id)
            .cloned()
            .collect()
    }
}
