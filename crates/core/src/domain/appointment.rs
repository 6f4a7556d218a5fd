use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::customer::CustomerId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppointmentId(pub String);

impl AppointmentId {
    pub fn generate() -> Self {
        Self(format!("apt_{}", Uuid::new_v4().simple()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Completed,
    Missed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Missed => "missed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// An open slot in the appointment inventory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub slot_id: SlotId,
    pub service_type: String,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub appointment_id: AppointmentId,
    pub customer_id: CustomerId,
    pub slot_id: Option<SlotId>,
    pub service_type: String,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub status: AppointmentStatus,
    pub rebooked_from: Option<String>,
}

impl Appointment {
    /// A confirmed booking of `slot` that replaces a missed appointment.
    pub fn rebooked(customer_id: CustomerId, slot: &Slot) -> Self {
        Self {
            appointment_id: AppointmentId::generate(),
            customer_id,
            slot_id: Some(slot.slot_id.clone()),
            service_type: slot.service_type.clone(),
            starts_at: slot.starts_at,
            duration_minutes: slot.duration_minutes,
            status: AppointmentStatus::Confirmed,
            rebooked_from: Some("missed_appointment".to_string()),
        }
    }

    pub fn is_missed(&self) -> bool {
        self.status == AppointmentStatus::Missed
    }
}
