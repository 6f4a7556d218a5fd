//! Write-only diagnostic side channel.
//!
//! Decoder and executor report what they did through a [`DiagnosticSink`] that
//! is injected by the caller. Emission never returns an error and never feeds
//! back into control flow; swapping the sink (or using [`NoopDiagnosticSink`])
//! must not change any result.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCategory {
    Decode,
    Plan,
    Runtime,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub event_id: String,
    pub kind: String,
    pub category: DiagnosticCategory,
    pub correlation_id: Option<String>,
    pub payload: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl DiagnosticEvent {
    pub fn new(kind: impl Into<String>, category: DiagnosticCategory) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            category,
            correlation_id: None,
            payload: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, event: DiagnosticEvent);
}

impl<S> DiagnosticSink for Arc<S>
where
    S: DiagnosticSink + ?Sized,
{
    fn emit(&self, event: DiagnosticEvent) {
        (**self).emit(event);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDiagnosticSink;

impl DiagnosticSink for NoopDiagnosticSink {
    fn emit(&self, _event: DiagnosticEvent) {}
}

/// Forwards every event to `tracing` at debug level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingDiagnosticSink;

impl DiagnosticSink for TracingDiagnosticSink {
    fn emit(&self, event: DiagnosticEvent) {
        let payload = serde_json::to_string(&event.payload).unwrap_or_default();
        tracing::debug!(
            event_name = %event.kind,
            category = ?event.category,
            correlation_id = event.correlation_id.as_deref().unwrap_or("unknown"),
            event_id = %event.event_id,
            payload = %payload,
            "diagnostic event"
        );
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDiagnosticSink {
    events: Arc<Mutex<Vec<DiagnosticEvent>>>,
}

impl InMemoryDiagnosticSink {
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.kind).collect()
    }
}

impl DiagnosticSink for InMemoryDiagnosticSink {
    fn emit(&self, event: DiagnosticEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// First `max_chars` characters of `text`.
pub fn head_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    text.chars().skip(total.saturating_sub(max_chars)).collect()
}
