use caseflow_agent::planner::{ESCALATION_REASON_FACT, SELECTED_SLOT_FACT};
use caseflow_agent::runtime::planner_from_config;
use caseflow_core::config::{AppConfig, LoadOptions};
use caseflow_core::Facts;
use serde_json::json;

use super::{CommandResult, EXIT_ABORTED, EXIT_CONFIG, EXIT_OK};

const COMMAND: &str = "plan";

#[derive(Clone, Debug, Default)]
pub struct PlanRequest {
    pub intent: String,
    pub customer_id: String,
    pub slot_id: Option<String>,
    pub reason: Option<String>,
}

impl PlanRequest {
    fn facts(&self) -> Facts {
        let mut facts = Facts::new();
        facts.insert("customer_id".to_string(), json!(self.customer_id));
        facts.insert("intent".to_string(), json!(self.intent));
        if let Some(slot_id) = &self.slot_id {
            facts.insert(SELECTED_SLOT_FACT.to_string(), json!(slot_id));
        }
        if let Some(reason) = &self.reason {
            facts.insert(ESCALATION_REASON_FACT.to_string(), json!(reason));
        }
        facts
    }
}

/// Builds the plan for an intent without running it.
pub fn run(options: LoadOptions, request: &PlanRequest) -> CommandResult {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "config_validation",
                error.to_string(),
                EXIT_CONFIG,
            )
        }
    };

    let planner = match planner_from_config(&config) {
        Ok(planner) => planner,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                error.error_class(),
                error.to_string(),
                EXIT_CONFIG,
            )
        }
    };

    match planner.build_plan(&request.intent, "", &request.facts()) {
        Ok(plan) => CommandResult::document(COMMAND, &plan, EXIT_OK),
        Err(error) => CommandResult::failure(COMMAND, "planner", error.to_string(), EXIT_ABORTED),
    }
}
