//! Intent-keyed plan templates.
//!
//! Templates are plain data. Adding an intent means adding a template, never a
//! new branch in the executor. Every template is dry-built when the planner is
//! constructed, so a bad back-reference fails at startup instead of mid-request.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use caseflow_core::plan::{
    Expectation, Facts, Fallback, OutputRef, PathSegment, Plan, PlanBuilder, PlanCompletion,
    PlanConstructionError, Step,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::adapters::{
    CHECK_ELIGIBILITY, CREATE_ESCALATION_TICKET, GET_AVAILABLE_SLOTS, LOG_INTERACTION,
    REBOOK_APPOINTMENT, SEND_CONFIRMATION,
};

pub const REBOOK_INTENT: &str = "missed_appointment_rebook";
pub const OFFER_SLOTS_INTENT: &str = "missed_appointment_offer_slots";
pub const CONFIRM_SLOT_INTENT: &str = "missed_appointment_confirm_slot";
pub const REBOOK_EXCEPTION_INTENT: &str = "missed_appointment_rebook_exception";
pub const ESCALATION_INTENT: &str = "escalation";

pub const SELECTED_SLOT_FACT: &str = "selected_slot_id";
pub const ESCALATION_REASON_FACT: &str = "escalation_reason";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("no plan template exists for intent `{0}`")]
    UnknownIntent(String),
    #[error("intent `{intent}` requires fact `{fact}`")]
    MissingFact { intent: String, fact: String },
    #[error("template for intent `{intent}` is invalid: {source}")]
    Construction { intent: String, source: PlanConstructionError },
    #[error("template for intent `{intent}` is invalid: {reason}")]
    InvalidTemplate { intent: String, reason: String },
    #[error("could not load templates from `{path}`: {reason}")]
    TemplateFile { path: PathBuf, reason: String },
}

/// How a step parameter gets its value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum TemplateBinding {
    Literal { value: Value },
    /// Copied from the known facts when the plan is built.
    Fact { fact: String },
    /// Read from a prior step's output when the step runs.
    Output { reference: OutputRef },
    /// The fact when the caller supplied it, otherwise the output reference.
    FactOrOutput { fact: String, reference: OutputRef },
}

impl TemplateBinding {
    pub fn literal(value: Value) -> Self {
        Self::Literal { value }
    }

    pub fn fact(fact: impl Into<String>) -> Self {
        Self::Fact { fact: fact.into() }
    }

    pub fn output(step: usize, path: &str) -> Result<Self, PlanConstructionError> {
        Ok(Self::Output { reference: format!("output.{step}.{path}").parse()? })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FallbackTemplate {
    pub tool: String,
    #[serde(default)]
    pub bindings: BTreeMap<String, TemplateBinding>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub tool: String,
    #[serde(default)]
    pub bindings: BTreeMap<String, TemplateBinding>,
    #[serde(default = "default_expectation")]
    pub expect: Expectation,
    #[serde(default)]
    pub on_fail: Option<FallbackTemplate>,
}

fn default_expectation() -> Expectation {
    Expectation::Succeeded
}

impl StepTemplate {
    pub fn new(tool: impl Into<String>, expect: Expectation) -> Self {
        Self { tool: tool.into(), bindings: BTreeMap::new(), expect, on_fail: None }
    }

    pub fn bind(mut self, parameter: impl Into<String>, binding: TemplateBinding) -> Self {
        self.bindings.insert(parameter.into(), binding);
        self
    }

    pub fn on_fail(mut self, fallback: FallbackTemplate) -> Self {
        self.on_fail = Some(fallback);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanTemplate {
    pub intent: String,
    pub goal: String,
    #[serde(default)]
    pub required_facts: Vec<String>,
    pub steps: Vec<StepTemplate>,
    #[serde(default)]
    pub fallback: Option<FallbackTemplate>,
    #[serde(default)]
    pub completion: PlanCompletion,
}

impl PlanTemplate {
    /// Every fact the template copies at build time.
    fn referenced_facts(&self) -> Vec<&str> {
        let step_bindings = self.steps.iter().flat_map(|step| {
            step.bindings
                .values()
                .chain(step.on_fail.iter().flat_map(|fallback| fallback.bindings.values()))
        });
        let fallback_bindings =
            self.fallback.iter().flat_map(|fallback| fallback.bindings.values());

        let mut facts = self.required_facts.iter().map(String::as_str).collect::<Vec<_>>();
        for binding in step_bindings.chain(fallback_bindings) {
            if let TemplateBinding::Fact { fact } = binding {
                if !facts.contains(&fact.as_str()) {
                    facts.push(fact);
                }
            }
        }
        facts
    }

    pub fn tool_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let fallbacks = self.fallback.iter().map(|fallback| fallback.tool.as_str());
        for name in self
            .steps
            .iter()
            .flat_map(|step| {
                std::iter::once(step.tool.as_str())
                    .chain(step.on_fail.iter().map(|fallback| fallback.tool.as_str()))
            })
            .chain(fallbacks)
        {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    templates: Vec<PlanTemplate>,
}

#[derive(Clone, Debug)]
pub struct Planner {
    templates: BTreeMap<String, PlanTemplate>,
}

impl Default for Planner {
    fn default() -> Self {
        let templates = default_templates()
            .into_iter()
            .map(|template| (template.intent.clone(), template))
            .collect();
        Self { templates }
    }
}

impl Planner {
    pub fn new(templates: impl IntoIterator<Item = PlanTemplate>) -> Result<Self, PlannerError> {
        let templates = templates
            .into_iter()
            .map(|template| (template.intent.clone(), template))
            .collect::<BTreeMap<_, _>>();
        let planner = Self { templates };
        planner.validate()?;
        Ok(planner)
    }

    /// Default templates with the file's templates layered on top, keyed by intent.
    pub fn from_toml_file(path: &Path) -> Result<Self, PlannerError> {
        let template_error =
            |reason: String| PlannerError::TemplateFile { path: path.to_path_buf(), reason };

        let raw = fs::read_to_string(path).map_err(|error| template_error(error.to_string()))?;
        let file = toml::from_str::<TemplateFile>(&raw)
            .map_err(|error| template_error(error.to_string()))?;

        let mut templates = Self::default().templates;
        for template in file.templates {
            templates.insert(template.intent.clone(), template);
        }
        Self::new(templates.into_values())
    }

    pub fn intents(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    pub fn template(&self, intent: &str) -> Option<&PlanTemplate> {
        self.templates.get(intent)
    }

    pub fn supports(&self, intent: &str) -> bool {
        self.templates.contains_key(intent)
    }

    /// Dry-builds every template with placeholder facts.
    pub fn validate(&self) -> Result<(), PlannerError> {
        for template in self.templates.values() {
            let placeholders = template
                .referenced_facts()
                .into_iter()
                .map(|fact| (fact.to_string(), json!(format!("<{fact}>"))))
                .collect::<Facts>();
            self.build_plan(&template.intent, &template.goal, &placeholders)?;
        }
        Ok(())
    }

    /// Instantiates the template for `intent`. An empty `goal` falls back to the template's goal.
    pub fn build_plan(
        &self,
        intent: &str,
        goal: &str,
        known_facts: &Facts,
    ) -> Result<Plan, PlannerError> {
        let template = self
            .templates
            .get(intent)
            .ok_or_else(|| PlannerError::UnknownIntent(intent.to_string()))?;

        for fact in &template.required_facts {
            lookup_fact(intent, known_facts, fact)?;
        }

        let goal = if goal.trim().is_empty() { template.goal.as_str() } else { goal };
        let mut builder = PlanBuilder::new(intent, goal).completion(template.completion.clone());
        if let Some(fallback) = &template.fallback {
            builder = builder.fallback(resolve_fallback(intent, fallback, known_facts)?);
        }

        for step_template in &template.steps {
            let mut step = Step::new(step_template.tool.clone(), step_template.expect.clone());
            for (parameter, binding) in &step_template.bindings {
                step = match binding {
                    TemplateBinding::Literal { value } => {
                        step.with_literal(parameter, value.clone())
                    }
                    TemplateBinding::Fact { fact } => {
                        step.with_literal(parameter, lookup_fact(intent, known_facts, fact)?)
                    }
                    TemplateBinding::Output { reference } => {
                        step.with_reference(parameter, reference.clone())
                    }
                    TemplateBinding::FactOrOutput { fact, reference } => {
                        match known_facts.get(fact).filter(|value| !value.is_null()) {
                            Some(value) => step.with_literal(parameter, value.clone()),
                            None => step.with_reference(parameter, reference.clone()),
                        }
                    }
                };
            }
            if let Some(on_fail) = &step_template.on_fail {
                step = step.with_fallback(resolve_fallback(intent, on_fail, known_facts)?);
            }
            builder = builder.step(step);
        }

        builder
            .build()
            .map_err(|source| PlannerError::Construction { intent: intent.to_string(), source })
    }
}

fn lookup_fact(intent: &str, facts: &Facts, fact: &str) -> Result<Value, PlannerError> {
    facts.get(fact).filter(|value| !value.is_null()).cloned().ok_or_else(|| {
        PlannerError::MissingFact { intent: intent.to_string(), fact: fact.to_string() }
    })
}

fn resolve_fallback(
    intent: &str,
    template: &FallbackTemplate,
    facts: &Facts,
) -> Result<Fallback, PlannerError> {
    let mut fallback = Fallback::new(template.tool.clone());
    for (parameter, binding) in &template.bindings {
        let value = match binding {
            TemplateBinding::Literal { value } => value.clone(),
            TemplateBinding::Fact { fact } => lookup_fact(intent, facts, fact)?,
            TemplateBinding::Output { .. } | TemplateBinding::FactOrOutput { .. } => {
                return Err(PlannerError::InvalidTemplate {
                    intent: intent.to_string(),
                    reason: format!(
                        "fallback `{}` parameter `{parameter}` must be a literal or a fact",
                        template.tool
                    ),
                });
            }
        };
        fallback = fallback.with_binding(parameter, value);
    }
    Ok(fallback)
}

fn escalate(reason: &str) -> FallbackTemplate {
    let mut bindings = BTreeMap::new();
    bindings.insert("customer_id".to_string(), TemplateBinding::fact("customer_id"));
    bindings.insert("reason".to_string(), TemplateBinding::literal(json!(reason)));
    FallbackTemplate { tool: CREATE_ESCALATION_TICKET.to_string(), bindings }
}

fn customer_step(tool: &str, expect: Expectation) -> StepTemplate {
    StepTemplate::new(tool, expect).bind("customer_id", TemplateBinding::fact("customer_id"))
}

fn eligibility_step() -> StepTemplate {
    customer_step(CHECK_ELIGIBILITY, Expectation::field_equals("eligible", json!(true)))
        .on_fail(escalate("Customer not eligible for rebooking"))
}

fn slots_step() -> StepTemplate {
    customer_step(GET_AVAILABLE_SLOTS, Expectation::non_empty("slots"))
        .bind("limit", TemplateBinding::literal(json!(5)))
        .on_fail(escalate("No available slots"))
}

fn rebook_step(slot_id: TemplateBinding) -> StepTemplate {
    customer_step(REBOOK_APPOINTMENT, Expectation::field_equals("status", json!("confirmed")))
        .bind("slot_id", slot_id)
}

fn confirmation_step(appointment: TemplateBinding) -> StepTemplate {
    customer_step(SEND_CONFIRMATION, Expectation::field_equals("sent", json!(true)))
        .bind("appointment", appointment)
}

fn first_slot_or_selection(slots_step: usize) -> TemplateBinding {
    TemplateBinding::FactOrOutput {
        fact: SELECTED_SLOT_FACT.to_string(),
        reference: OutputRef::new(
            slots_step,
            [
                PathSegment::Field("slots".to_string()),
                PathSegment::Index(0),
                PathSegment::Field("slot_id".to_string()),
            ],
        ),
    }
}

fn appointment_of(rebook_step: usize) -> TemplateBinding {
    TemplateBinding::Output { reference: OutputRef::field(rebook_step, "appointment") }
}

fn customer_fact() -> Vec<String> {
    vec!["customer_id".to_string()]
}

/// Built-in templates for the missed-appointment domain.
pub fn default_templates() -> Vec<PlanTemplate> {
    vec![
        PlanTemplate {
            intent: REBOOK_INTENT.to_string(),
            goal: "Rebook the customer's missed appointment into the first open slot".to_string(),
            required_facts: customer_fact(),
            steps: vec![
                eligibility_step(),
                slots_step(),
                rebook_step(first_slot_or_selection(1)),
                confirmation_step(appointment_of(2)),
            ],
            fallback: Some(escalate("Automated rebooking could not be completed")),
            completion: PlanCompletion::Complete,
        },
        PlanTemplate {
            intent: OFFER_SLOTS_INTENT.to_string(),
            goal: "Offer open slots so the customer can pick one".to_string(),
            required_facts: customer_fact(),
            steps: vec![eligibility_step(), slots_step()],
            fallback: Some(escalate("Could not offer rebooking options")),
            completion: PlanCompletion::AwaitSelection { field: "slots".to_string() },
        },
        PlanTemplate {
            intent: CONFIRM_SLOT_INTENT.to_string(),
            goal: "Book the slot the customer selected".to_string(),
            required_facts: vec!["customer_id".to_string(), SELECTED_SLOT_FACT.to_string()],
            steps: vec![
                rebook_step(TemplateBinding::fact(SELECTED_SLOT_FACT)),
                confirmation_step(appointment_of(0)),
            ],
            fallback: Some(escalate("Selected slot could not be booked")),
            completion: PlanCompletion::Complete,
        },
        PlanTemplate {
            intent: REBOOK_EXCEPTION_INTENT.to_string(),
            goal: "Rebook under an approved exception to the eligibility limits".to_string(),
            required_facts: customer_fact(),
            steps: vec![
                customer_step(LOG_INTERACTION, Expectation::field_equals("logged", json!(true)))
                    .bind("intent", TemplateBinding::literal(json!(REBOOK_EXCEPTION_INTENT)))
                    .bind(
                        "decision",
                        TemplateBinding::literal(json!("eligibility limit waived by exception")),
                    )
                    .bind("status", TemplateBinding::literal(json!("override_applied"))),
                slots_step(),
                rebook_step(first_slot_or_selection(1)),
                confirmation_step(appointment_of(2)),
            ],
            fallback: Some(escalate("Exception rebooking could not be completed")),
            completion: PlanCompletion::Complete,
        },
        PlanTemplate {
            intent: ESCALATION_INTENT.to_string(),
            goal: "Route the request to a human agent".to_string(),
            required_facts: vec!["customer_id".to_string(), ESCALATION_REASON_FACT.to_string()],
            steps: vec![customer_step(CREATE_ESCALATION_TICKET, Expectation::Succeeded)
                .bind("reason", TemplateBinding::fact(ESCALATION_REASON_FACT))
                .bind("intent", TemplateBinding::fact("intent"))],
            fallback: None,
            completion: PlanCompletion::Complete,
        },
    ]
}
