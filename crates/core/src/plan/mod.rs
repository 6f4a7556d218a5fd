//! Plans: ordered tool invocations with parameter bindings and postconditions.
//!
//! A [`Plan`] can only be obtained from [`PlanBuilder::build`], which rejects
//! back-references that do not point strictly backwards. The executor can
//! therefore assume every reference names an earlier step.

pub mod output;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use output::ToolOutput;

/// Per-request key/value table. Step outputs are stored under `output.<index>`.
pub type Facts = BTreeMap<String, Value>;

pub fn output_fact_key(step_index: usize) -> String {
    format!("output.{step_index}")
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlanConstructionError {
    #[error("plan for intent `{intent}` has no steps")]
    EmptyPlan { intent: String },
    #[error("step {step_index} has an empty tool name")]
    EmptyToolName { step_index: usize },
    #[error("fallback of step {step_index} has an empty tool name")]
    EmptyFallbackTool { step_index: usize },
    #[error(
        "step {step_index} parameter `{parameter}` references step {referenced_step}, which does not precede it"
    )]
    ForwardReference { step_index: usize, parameter: String, referenced_step: usize },
    #[error("invalid output reference `{reference}`: {reason}")]
    InvalidReference { reference: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Reference into a prior step's output, written `output.<step>.<field>[...]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutputRef {
    pub step: usize,
    pub path: Vec<PathSegment>,
}

impl OutputRef {
    pub fn new(step: usize, path: impl IntoIterator<Item = PathSegment>) -> Self {
        Self { step, path: path.into_iter().collect() }
    }

    /// Shorthand for a single top-level field.
    pub fn field(step: usize, field: impl Into<String>) -> Self {
        Self::new(step, [PathSegment::Field(field.into())])
    }

    /// Walks the path inside the facts table. `None` when any segment is absent.
    pub fn resolve<'a>(&self, facts: &'a Facts) -> Option<&'a Value> {
        let mut current = facts.get(&output_fact_key(self.step))?;
        for segment in &self.path {
            current = match (segment, current) {
                (PathSegment::Field(name), Value::Object(map)) => map.get(name)?,
                (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
                (PathSegment::Index(index), Value::Object(map)) => map.get(&index.to_string())?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output.{}", self.step)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for OutputRef {
    type Err = PlanConstructionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| PlanConstructionError::InvalidReference {
            reference: value.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = value.trim().split('.');
        if parts.next() != Some("output") {
            return Err(invalid("must start with `output.`"));
        }
        let step = parts
            .next()
            .ok_or_else(|| invalid("missing step index"))?
            .parse::<usize>()
            .map_err(|_| invalid("step index must be a non-negative integer"))?;

        let mut path = Vec::new();
        for part in parts {
            if part.is_empty() {
                return Err(invalid("empty path segment"));
            }
            match part.parse::<usize>() {
                Ok(index) => path.push(PathSegment::Index(index)),
                Err(_) => path.push(PathSegment::Field(part.to_string())),
            }
        }
        if path.is_empty() {
            return Err(invalid("must name at least one field"));
        }

        Ok(Self { step, path })
    }
}

impl TryFrom<String> for OutputRef {
    type Error = PlanConstructionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutputRef> for String {
    fn from(value: OutputRef) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Binding {
    Literal(Value),
    Reference(OutputRef),
}

/// Postcondition over a tool's output. A failed tool output never satisfies one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expectation {
    Succeeded,
    FieldEquals { field: String, value: Value },
    NonEmpty { field: String },
}

impl Expectation {
    pub fn field_equals(field: impl Into<String>, value: Value) -> Self {
        Self::FieldEquals { field: field.into(), value }
    }

    pub fn non_empty(field: impl Into<String>) -> Self {
        Self::NonEmpty { field: field.into() }
    }

    /// `Err` carries a human-readable reason for the violation.
    pub fn evaluate(&self, output: &ToolOutput) -> Result<(), String> {
        if !output.success {
            return Err(output.failure_reason().to_string());
        }

        match self {
            Self::Succeeded => Ok(()),
            Self::FieldEquals { field, value } => match output.field(field) {
                Some(actual) if actual == value => Ok(()),
                Some(actual) => Err(format!("expected `{field}` == {value}, got {actual}")),
                None => Err(format!("expected `{field}` == {value}, field is missing")),
            },
            Self::NonEmpty { field } => {
                let non_empty = match output.field(field) {
                    Some(Value::Array(items)) => !items.is_empty(),
                    Some(Value::Object(map)) => !map.is_empty(),
                    Some(Value::String(text)) => !text.is_empty(),
                    _ => false,
                };
                if non_empty {
                    Ok(())
                } else {
                    Err(format!("expected `{field}` to be non-empty"))
                }
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Succeeded => "tool succeeded".to_string(),
            Self::FieldEquals { field, value } => format!("`{field}` == {value}"),
            Self::NonEmpty { field } => format!("`{field}` is non-empty"),
        }
    }
}

/// Step executed when a step's expectation fails. Bindings are literal only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fallback {
    pub tool_name: String,
    pub bindings: BTreeMap<String, Value>,
}

impl Fallback {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self { tool_name: tool_name.into(), bindings: BTreeMap::new() }
    }

    pub fn with_binding(mut self, parameter: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(parameter.into(), value);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub tool_name: String,
    pub bindings: BTreeMap<String, Binding>,
    pub expectation: Expectation,
    pub on_fail: Option<Fallback>,
}

impl Step {
    pub fn new(tool_name: impl Into<String>, expectation: Expectation) -> Self {
        Self {
            tool_name: tool_name.into(),
            bindings: BTreeMap::new(),
            expectation,
            on_fail: None,
        }
    }

    pub fn with_literal(mut self, parameter: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(parameter.into(), Binding::Literal(value));
        self
    }

    pub fn with_reference(mut self, parameter: impl Into<String>, reference: OutputRef) -> Self {
        self.bindings.insert(parameter.into(), Binding::Reference(reference));
        self
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.on_fail = Some(fallback);
        self
    }
}

/// How a plan ends once every step has passed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanCompletion {
    #[default]
    Complete,
    /// Halt and present `field` of the final outputs to the caller for a choice.
    AwaitSelection { field: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Plan {
    intent: String,
    goal: String,
    steps: Vec<Step>,
    completion: PlanCompletion,
}

impl Plan {
    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn completion(&self) -> &PlanCompletion {
        &self.completion
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every tool a run of this plan may touch, fallbacks included.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for step in &self.steps {
            for name in std::iter::once(step.tool_name.as_str())
                .chain(step.on_fail.iter().map(|fallback| fallback.tool_name.as_str()))
            {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}

#[derive(Clone, Debug)]
pub struct PlanBuilder {
    intent: String,
    goal: String,
    steps: Vec<Step>,
    default_fallback: Option<Fallback>,
    completion: PlanCompletion,
}

impl PlanBuilder {
    pub fn new(intent: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            goal: goal.into(),
            steps: Vec::new(),
            default_fallback: None,
            completion: PlanCompletion::Complete,
        }
    }

    /// Fallback applied to every step that does not declare its own.
    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.default_fallback = Some(fallback);
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn completion(mut self, completion: PlanCompletion) -> Self {
        self.completion = completion;
        self
    }

    pub fn build(self) -> Result<Plan, PlanConstructionError> {
        if self.steps.is_empty() {
            return Err(PlanConstructionError::EmptyPlan { intent: self.intent });
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for (step_index, mut step) in self.steps.into_iter().enumerate() {
            if step.tool_name.trim().is_empty() {
                return Err(PlanConstructionError::EmptyToolName { step_index });
            }

            for (parameter, binding) in &step.bindings {
                if let Binding::Reference(reference) = binding {
                    if reference.step >= step_index {
                        return Err(PlanConstructionError::ForwardReference {
                            step_index,
                            parameter: parameter.clone(),
                            referenced_step: reference.step,
                        });
                    }
                }
            }

            if step.on_fail.is_none() {
                step.on_fail = self.default_fallback.clone();
            }
            if step.on_fail.as_ref().is_some_and(|fallback| fallback.tool_name.trim().is_empty()) {
                return Err(PlanConstructionError::EmptyFallbackTool { step_index });
            }

            steps.push(step);
        }

        Ok(Plan { intent: self.intent, goal: self.goal, steps, completion: self.completion })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        output_fact_key, Binding, Expectation, Facts, Fallback, OutputRef, PathSegment,
        PlanBuilder, PlanConstructionError, Step, ToolOutput,
    };

    fn rebook_plan_builder() -> PlanBuilder {
        PlanBuilder::new("missed_appointment_rebook", "Rebook the missed appointment")
            .fallback(
                Fallback::new("create_escalation_ticket").with_binding("customer_id", json!("c-1")),
            )
            .step(
                Step::new("check_eligibility", Expectation::field_equals("eligible", json!(true)))
                    .with_literal("customer_id", json!("c-1")),
            )
            .step(
                Step::new("get_available_slots", Expectation::non_empty("slots"))
                    .with_literal("customer_id", json!("c-1")),
            )
    }

    #[test]
    fn output_ref_parses_nested_paths() {
        let reference: OutputRef = "output.1.slots.0.slot_id".parse().expect("valid reference");
        assert_eq!(reference.step, 1);
        assert_eq!(
            reference.path,
            vec![
                PathSegment::Field("slots".to_string()),
                PathSegment::Index(0),
                PathSegment::Field("slot_id".to_string()),
            ]
        );
        assert_eq!(reference.to_string(), "output.1.slots.0.slot_id");
    }

    #[test]
    fn output_ref_rejects_malformed_text() {
        for raw in ["facts.customer_id", "output", "output.x.slots", "output.1", "output.1..a"] {
            assert!(
                matches!(
                    raw.parse::<OutputRef>(),
                    Err(PlanConstructionError::InvalidReference { .. })
                ),
                "`{raw}` should be rejected"
            );
        }
    }

    #[test]
    fn output_ref_resolves_against_facts() {
        let mut facts = Facts::new();
        facts.insert(output_fact_key(1), json!({"slots": [{"slot_id": "s1"}, {"slot_id": "s2"}]}));

        let first: OutputRef = "output.1.slots.0.slot_id".parse().expect("valid");
        let missing: OutputRef = "output.1.slots.5.slot_id".parse().expect("valid");
        let absent_step = OutputRef::field(3, "status");

        assert_eq!(first.resolve(&facts), Some(&json!("s1")));
        assert_eq!(missing.resolve(&facts), None);
        assert_eq!(absent_step.resolve(&facts), None);
    }

    #[test]
    fn builder_applies_default_fallback_and_keeps_order() {
        let plan = rebook_plan_builder().build().expect("plan should build");

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.steps()[0].tool_name, "check_eligibility");
        assert_eq!(plan.steps()[1].tool_name, "get_available_slots");
        assert!(plan
            .steps()
            .iter()
            .all(|step| step.on_fail.as_ref().map(|f| f.tool_name.as_str())
                == Some("create_escalation_ticket")));
        assert_eq!(
            plan.tool_names(),
            vec!["check_eligibility", "create_escalation_ticket", "get_available_slots"]
        );
    }

    #[test]
    fn builder_rejects_forward_and_self_references() {
        let forward = rebook_plan_builder()
            .step(
                Step::new("rebook_appointment", Expectation::Succeeded)
                    .with_reference("slot_id", OutputRef::field(3, "slot_id")),
            )
            .build();
        assert_eq!(
            forward,
            Err(PlanConstructionError::ForwardReference {
                step_index: 2,
                parameter: "slot_id".to_string(),
                referenced_step: 3,
            })
        );

        let self_reference = rebook_plan_builder()
            .step(
                Step::new("rebook_appointment", Expectation::Succeeded)
                    .with_reference("slot_id", OutputRef::field(2, "slot_id")),
            )
            .build();
        assert!(matches!(
            self_reference,
            Err(PlanConstructionError::ForwardReference { referenced_step: 2, .. })
        ));
    }

    #[test]
    fn builder_rejects_empty_plans_and_tool_names() {
        assert!(matches!(
            PlanBuilder::new("noop", "nothing").build(),
            Err(PlanConstructionError::EmptyPlan { .. })
        ));
        assert_eq!(
            PlanBuilder::new("x", "y").step(Step::new("  ", Expectation::Succeeded)).build(),
            Err(PlanConstructionError::EmptyToolName { step_index: 0 })
        );
    }

    #[test]
    fn failed_output_never_satisfies_an_expectation() {
        let failed = ToolOutput::failure("backend timeout").with_field("eligible", json!(true));
        assert_eq!(
            Expectation::field_equals("eligible", json!(true)).evaluate(&failed),
            Err("backend timeout".to_string())
        );
        assert!(Expectation::Succeeded.evaluate(&failed).is_err());
    }

    #[test]
    fn expectations_check_fields() {
        let output =
            ToolOutput::ok_json(json!({"eligible": false, "slots": [], "status": "confirmed"}));

        assert!(Expectation::field_equals("status", json!("confirmed")).evaluate(&output).is_ok());
        assert!(Expectation::field_equals("eligible", json!(true)).evaluate(&output).is_err());
        assert!(Expectation::field_equals("sent", json!(true)).evaluate(&output).is_err());
        assert_eq!(
            Expectation::non_empty("slots").evaluate(&output),
            Err("expected `slots` to be non-empty".to_string())
        );
    }

    #[test]
    fn bindings_serialize_with_textual_references() {
        let binding = Binding::Reference("output.2.appointment".parse().expect("valid"));
        let encoded = serde_json::to_value(&binding).expect("serialize");
        assert_eq!(encoded, json!({"kind": "reference", "value": "output.2.appointment"}));

        let decoded: Binding = serde_json::from_value(encoded).expect("deserialize");
        assert_eq!(decoded, binding);
    }
}
