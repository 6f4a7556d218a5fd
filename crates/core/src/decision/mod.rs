//! Structured decision records extracted from free text.
//!
//! A reasoning backend is asked to answer with a seven-field JSON record.
//! [`ResponseDecoder`] recovers that record from whatever the backend actually
//! produced, and [`validate`] decides whether it is usable. Callers only ever
//! see a fully valid [`DecodedResponse`] or a [`DecodeFailure`].

pub mod decoder;
pub mod validate;

use serde::{Deserialize, Serialize};
use serde_json::json;

pub use decoder::{DecodeFailure, DecodeStrategy, ResponseDecoder};
pub use validate::{validate, FieldValidationError, REQUIRED_FIELDS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    Automate,
    Escalate,
    Clarify,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automate => "AUTOMATE",
            Self::Escalate => "ESCALATE",
            Self::Clarify => "CLARIFY",
        }
    }

    /// Exact, case-sensitive match on the canonical spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AUTOMATE" => Some(Self::Automate),
            "ESCALATE" => Some(Self::Escalate),
            "CLARIFY" => Some(Self::Clarify),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DecodedResponse {
    pub intent: String,
    pub goal: String,
    pub decision: String,
    pub decision_type: DecisionType,
    pub reasoning: String,
    pub recommended_action: String,
    pub confidence: f64,
}

impl DecodedResponse {
    /// Canonical JSON form; decodes back to an equal record via the direct strategy.
    pub fn to_canonical_text(&self) -> String {
        json!({
            "intent": self.intent,
            "goal": self.goal,
            "decision": self.decision,
            "decision_type": self.decision_type.as_str(),
            "reasoning": self.reasoning,
            "recommended_action": self.recommended_action,
            "confidence": self.confidence,
        })
        .to_string()
    }
}
