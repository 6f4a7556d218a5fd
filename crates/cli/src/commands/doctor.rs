use caseflow_agent::adapters::cx_registry;
use caseflow_agent::llm::{HttpLlmClient, LlmClient};
use caseflow_agent::planner::Planner;
use caseflow_agent::runtime::{backend_from_config, planner_from_config};
use caseflow_agent::tools::RetryPolicy;
use caseflow_core::config::{AppConfig, ClassifierKind, LoadOptions};
use caseflow_core::ApplicationError;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Skipped, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(options: LoadOptions, json_output: bool) -> String {
    let report = build_report(options);

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report(options: LoadOptions) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(options) {
        Ok(config) => {
            checks.push(DoctorCheck::pass(
                "config_validation",
                "configuration loaded and validated",
            ));
            checks.extend(check_agent_assets(&config));
            checks.push(check_llm_readiness(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            for name in ["template_validation", "fixtures_load", "tool_coverage", "llm_readiness"] {
                checks.push(DoctorCheck::skipped(
                    name,
                    "skipped because configuration did not load",
                ));
            }
        }
    }

    let any_failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if any_failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if any_failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_agent_assets(config: &AppConfig) -> Vec<DoctorCheck> {
    let planner = planner_from_config(config)
        .and_then(|planner| {
            planner
                .validate()
                .map_err(|error| ApplicationError::Configuration(error.to_string()))?;
            Ok(planner)
        })
        .map_err(|error| error.to_string());
    let templates = match &planner {
        Ok(planner) => DoctorCheck::pass(
            "template_validation",
            format!("{} templates: {}", planner.intents().len(), planner.intents().join(", ")),
        ),
        Err(error) => DoctorCheck::fail("template_validation", error.clone()),
    };

    let backend = backend_from_config(config);
    let fixtures = match &backend {
        Ok(_) => DoctorCheck::pass(
            "fixtures_load",
            match &config.agent.fixtures_path {
                Some(path) => format!("loaded `{}`", path.display()),
                None => "using bundled demo fixtures".to_string(),
            },
        ),
        Err(error) => DoctorCheck::fail("fixtures_load", error.to_string()),
    };

    let coverage = match (&planner, backend) {
        (Ok(planner), Ok(backend)) => {
            let registry = cx_registry(
                backend,
                RetryPolicy::with_max_retries(config.agent.slot_lookup_retries),
            );
            let missing = unregistered_tools(planner, |name| registry.contains(name));
            if missing.is_empty() {
                DoctorCheck::pass(
                    "tool_coverage",
                    format!("every template tool is among {} registered tools", registry.len()),
                )
            } else {
                let details = format!("unregistered: {}", missing.join(", "));
                DoctorCheck::fail("tool_coverage", details)
            }
        }
        _ => {
            DoctorCheck::skipped("tool_coverage", "skipped because templates or fixtures failed")
        }
    };

    vec![templates, fixtures, coverage]
}

/// `intent/tool` pairs naming a tool the registry does not know.
fn unregistered_tools(planner: &Planner, is_registered: impl Fn(&str) -> bool) -> Vec<String> {
    planner
        .intents()
        .into_iter()
        .filter_map(|intent| planner.template(intent))
        .flat_map(|template| {
            template
                .tool_names()
                .into_iter()
                .filter(|tool| !is_registered(*tool))
                .map(|tool| format!("{}/{tool}", template.intent))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn check_llm_readiness(config: &AppConfig) -> DoctorCheck {
    if config.agent.classifier == ClassifierKind::Keyword {
        return DoctorCheck::skipped("llm_readiness", "keyword classifier does not call an llm");
    }

    match HttpLlmClient::from_config(&config.llm) {
        Ok(client) => DoctorCheck::pass(
            "llm_readiness",
            format!(
                "{} `{}` at {}",
                client.provider_name(),
                client.model_name(),
                config.llm.effective_base_url()
            ),
        ),
        Err(error) => DoctorCheck::fail("llm_readiness", error.to_string()),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
