use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::validate::{validate, FieldValidationError};
use super::DecodedResponse;
use crate::diagnostics::{
    head_chars, tail_chars, DiagnosticCategory, DiagnosticEvent, DiagnosticSink,
    NoopDiagnosticSink,
};

const HEAD_PREVIEW_CHARS: usize = 200;
const TAIL_PREVIEW_CHARS: usize = 100;
const CANDIDATE_PREVIEW_CHARS: usize = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStrategy {
    Direct,
    FencedBlock,
    BracketSpan,
}

impl DecodeStrategy {
    pub const ORDERED: [DecodeStrategy; 3] = [Self::Direct, Self::FencedBlock, Self::BracketSpan];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::FencedBlock => "fenced_block",
            Self::BracketSpan => "bracket_span",
        }
    }

    fn candidate<'a>(&self, raw: &'a str) -> Option<&'a str> {
        match self {
            Self::Direct => Some(raw.trim()),
            Self::FencedBlock => extract_fenced_block(raw),
            Self::BracketSpan => extract_bracket_span(raw),
        }
    }
}

/// Typed decode failure with bounded previews of the raw input.
#[derive(Clone, Debug, Error, PartialEq, Serialize)]
#[error("could not decode a structured decision from {raw_length} chars of text")]
pub struct DecodeFailure {
    pub first_200_chars: String,
    pub last_100_chars: String,
    pub raw_length: usize,
    /// Set when some candidate parsed as a record but failed validation.
    pub validation: Option<FieldValidationError>,
}

impl DecodeFailure {
    fn from_raw(raw: &str, validation: Option<FieldValidationError>) -> Self {
        Self {
            first_200_chars: head_chars(raw, HEAD_PREVIEW_CHARS),
            last_100_chars: tail_chars(raw, TAIL_PREVIEW_CHARS),
            raw_length: raw.chars().count(),
            validation,
        }
    }

    pub fn invalid_field(&self) -> Option<&'static str> {
        self.validation.as_ref().map(FieldValidationError::field)
    }
}

enum Attempt {
    NotFound,
    Unparseable(String),
    NotAnObject,
    Invalid(FieldValidationError),
    Valid(DecodedResponse),
}

impl Attempt {
    fn label(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unparseable(_) => "parse_error",
            Self::NotAnObject => "not_an_object",
            Self::Invalid(_) => "validation_error",
            Self::Valid(_) => "decoded",
        }
    }
}

/// Recovers a [`DecodedResponse`] from free text using three ordered strategies.
#[derive(Clone)]
pub struct ResponseDecoder {
    sink: Arc<dyn DiagnosticSink>,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new(Arc::new(NoopDiagnosticSink))
    }
}

impl ResponseDecoder {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { sink }
    }

    pub fn decode(&self, raw: &str) -> Result<DecodedResponse, DecodeFailure> {
        self.decode_with_correlation(raw, None)
    }

    pub fn decode_with_correlation(
        &self,
        raw: &str,
        correlation_id: Option<&str>,
    ) -> Result<DecodedResponse, DecodeFailure> {
        let mut first_validation_error = None;

        for strategy in DecodeStrategy::ORDERED {
            let candidate = strategy.candidate(raw);
            let attempt = candidate.map_or(Attempt::NotFound, attempt_candidate);

            let candidate_preview = candidate.map(|c| head_chars(c, CANDIDATE_PREVIEW_CHARS));
            let mut event = self
                .event("decode.attempt", correlation_id)
                .with_field("strategy", strategy.as_str())
                .with_field("outcome", attempt.label())
                .with_field("raw_length", raw.chars().count().to_string());
            if let Some(preview) = candidate_preview {
                event = event.with_field("candidate_preview", preview);
            }
            if let Attempt::Unparseable(error) = &attempt {
                event = event.with_field("parse_error", error.clone());
            }
            self.sink.emit(event);

            match attempt {
                Attempt::Valid(decoded) => {
                    self.sink.emit(
                        self.event("decode.succeeded", correlation_id)
                            .with_field("strategy", strategy.as_str())
                            .with_field("intent", decoded.intent.clone())
                            .with_field("decision_type", decoded.decision_type.as_str()),
                    );
                    return Ok(decoded);
                }
                Attempt::Invalid(error) => {
                    self.sink.emit(
                        self.event("decode.validation_failed", correlation_id)
                            .with_field("strategy", strategy.as_str())
                            .with_field("field", error.field())
                            .with_field("problem", error.to_string()),
                    );
                    if first_validation_error.is_none() {
                        first_validation_error = Some(error);
                    }
                }
                Attempt::NotFound | Attempt::Unparseable(_) | Attempt::NotAnObject => {}
            }
        }

        let failure = DecodeFailure::from_raw(raw, first_validation_error);
        let mut event = self
            .event("decode.failed", correlation_id)
            .with_field("raw_length", failure.raw_length.to_string())
            .with_field("first_200_chars", failure.first_200_chars.clone())
            .with_field("last_100_chars", failure.last_100_chars.clone());
        if let Some(field) = failure.invalid_field() {
            event = event.with_field("invalid_field", field);
        }
        self.sink.emit(event);

        Err(failure)
    }

    fn event(&self, kind: &str, correlation_id: Option<&str>) -> DiagnosticEvent {
        let event = DiagnosticEvent::new(kind, DiagnosticCategory::Decode);
        match correlation_id {
            Some(id) => event.with_correlation_id(id),
            None => event,
        }
    }
}

fn attempt_candidate(candidate: &str) -> Attempt {
    match serde_json::from_str::<Value>(candidate) {
        Err(error) => Attempt::Unparseable(error.to_string()),
        Ok(Value::Object(record)) => match validate(&record) {
            Ok(decoded) => Attempt::Valid(decoded),
            Err(error) => Attempt::Invalid(error),
        },
        Ok(_) => Attempt::NotAnObject,
    }
}

/// Interior of the first ```` ```json ```` fence, else of the first plain fence.
pub fn extract_fenced_block(text: &str) -> Option<&str> {
    const FENCE: &str = "```";

    let lowered = text.to_ascii_lowercase();
    let content_start = match lowered.find("```json") {
        Some(position) => position + "```json".len(),
        None => {
            let position = text.find(FENCE)? + FENCE.len();
            // Skip a language tag such as ```javascript on the opening line.
            let rest = &text[position..];
            let tag_len = rest
                .char_indices()
                .find(|(_, ch)| !ch.is_ascii_alphanumeric())
                .map_or(rest.len(), |(index, _)| index);
            position + tag_len
        }
    };

    let rest = text.get(content_start..)?;
    let end = rest.find(FENCE)?;
    Some(rest[..end].trim())
}

/// First top-level balanced `{...}` span. Braces inside JSON strings are ignored.
pub fn extract_bracket_span(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(index);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return start.map(|begin| &text[begin..=index]);
                }
            }
            _ => {}
        }
    }

    None
}
