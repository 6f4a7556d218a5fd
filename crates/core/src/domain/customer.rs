use serde::{Deserialize, Serialize};

/// Customers with more misses than this cannot self-serve a rebooking.
pub const MAX_MISSED_APPOINTMENTS: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(pub String);

impl CustomerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CustomerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Suspended,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Closed => "closed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoyaltyTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: CustomerId,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub account_status: AccountStatus,
    pub loyalty_tier: LoyaltyTier,
    pub missed_appointment_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: String,
}

impl Eligibility {
    fn allowed() -> Self {
        Self { eligible: true, reason: "Customer is eligible for rebooking".to_string() }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self { eligible: false, reason: reason.into() }
    }

    pub fn customer_not_found() -> Self {
        Self::denied("Customer not found")
    }
}

impl Customer {
    /// Self-service rebooking rules, checked in order.
    pub fn rebook_eligibility(&self) -> Eligibility {
        if self.account_status != AccountStatus::Active {
            return Eligibility::denied(format!(
                "Account status is {}",
                self.account_status.as_str()
            ));
        }

        if self.missed_appointment_count > MAX_MISSED_APPOINTMENTS {
            return Eligibility::denied(format!(
                "Customer has exceeded missed appointment limit (max {MAX_MISSED_APPOINTMENTS})"
            ));
        }

        if self.loyalty_tier == LoyaltyTier::Bronze && self.missed_appointment_count > 0 {
            return Eligibility::denied("Bronze tier customers cannot rebook after a miss");
        }

        Eligibility::allowed()
    }
}
