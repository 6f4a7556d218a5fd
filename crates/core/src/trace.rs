use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::plan::ToolOutput;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEntryKind {
    Step,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Index of the plan step; for a fallback entry, the step that failed.
    pub step_index: usize,
    pub tool_name: String,
    pub kind: TraceEntryKind,
    pub parameters: Map<String, Value>,
    pub output: ToolOutput,
    pub expectation_passed: bool,
    /// False when the step ended before its tool was called.
    pub invoked: bool,
    /// Why the expectation failed, or why the tool was not invoked.
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only record of one plan execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    entries: Vec<TraceEntry>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn step_entries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter().filter(|entry| entry.kind == TraceEntryKind::Step)
    }

    pub fn fallback_entry(&self) -> Option<&TraceEntry> {
        self.entries.iter().find(|entry| entry.kind == TraceEntryKind::Fallback)
    }

    pub fn all_passed(&self) -> bool {
        self.entries.iter().all(|entry| entry.expectation_passed)
    }

    /// Names of the tools that were actually called, in call order.
    pub fn invoked_tool_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.invoked)
            .map(|entry| entry.tool_name.clone())
            .collect()
    }
}
