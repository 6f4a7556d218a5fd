use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::customer::CustomerId;

/// One handled request, kept for analytics and compliance review.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub customer_id: CustomerId,
    pub intent: String,
    pub decision: String,
    pub actions: Vec<String>,
    pub status: String,
    pub recorded_at: DateTime<Utc>,
}
