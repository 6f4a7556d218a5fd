use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::{DecisionType, DecodedResponse};

/// Canonical field order; validation reports the first failure in this order.
pub const REQUIRED_FIELDS: [&str; 7] = [
    "intent",
    "goal",
    "decision",
    "decision_type",
    "reasoning",
    "recommended_action",
    "confidence",
];

#[derive(Clone, Debug, Error, PartialEq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum FieldValidationError {
    #[error("field `{field}` is missing")]
    Missing { field: &'static str },
    #[error("field `{field}` must be {expected}")]
    WrongType { field: &'static str, expected: &'static str },
    #[error("field `{field}` must not be empty")]
    Empty { field: &'static str },
    #[error("field `decision_type` must be one of AUTOMATE|ESCALATE|CLARIFY, got `{value}`")]
    UnknownDecisionType { value: String },
    #[error("field `confidence` must be within [0.0, 1.0], got {value}")]
    ConfidenceOutOfRange { value: f64 },
}

impl FieldValidationError {
    pub fn field(&self) -> &'static str {
        match self {
            Self::Missing { field } | Self::WrongType { field, .. } | Self::Empty { field } => {
                field
            }
            Self::UnknownDecisionType { .. } => "decision_type",
            Self::ConfidenceOutOfRange { .. } => "confidence",
        }
    }
}

/// Checks a parsed candidate record. No value is coerced or repaired.
pub fn validate(record: &Map<String, Value>) -> Result<DecodedResponse, FieldValidationError> {
    let intent = required_text(record, "intent")?;
    let goal = required_text(record, "goal")?;
    let decision = required_text(record, "decision")?;

    let raw_decision_type = required_text(record, "decision_type")?;
    let decision_type = DecisionType::parse(&raw_decision_type)
        .ok_or(FieldValidationError::UnknownDecisionType { value: raw_decision_type })?;

    let reasoning = required_text(record, "reasoning")?;
    let recommended_action = required_text(record, "recommended_action")?;

    let confidence = match record.get("confidence") {
        None => return Err(FieldValidationError::Missing { field: "confidence" }),
        Some(Value::Number(number)) => number.as_f64().ok_or(FieldValidationError::WrongType {
            field: "confidence",
            expected: "a number",
        })?,
        Some(_) => {
            return Err(FieldValidationError::WrongType {
                field: "confidence",
                expected: "a number",
            })
        }
    };
    if !(0.0..=1.0).contains(&confidence) {
        return Err(FieldValidationError::ConfidenceOutOfRange { value: confidence });
    }

    Ok(DecodedResponse {
        intent,
        goal,
        decision,
        decision_type,
        reasoning,
        recommended_action,
        confidence,
    })
}

fn required_text(
    record: &Map<String, Value>,
    field: &'static str,
) -> Result<String, FieldValidationError> {
    match record.get(field) {
        None => Err(FieldValidationError::Missing { field }),
        Some(Value::String(text)) if text.trim().is_empty() => {
            Err(FieldValidationError::Empty { field })
        }
        Some(Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(FieldValidationError::WrongType { field, expected: "a string" }),
    }
}
