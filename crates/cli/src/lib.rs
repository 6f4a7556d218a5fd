pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use caseflow_core::config::{
    AppConfig, ClassifierKind, ConfigOverrides, LlmProvider, LoadOptions, LogFormat, LoggingConfig,
};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "caseflow",
    about = "Caseflow customer-support agent CLI",
    long_about = "Classify customer messages, plan and execute support procedures, and inspect agent readiness.",
    after_help = "Examples:\n  caseflow handle --customer-id 123 --message \"I missed my appointment, rebook me\"\n  caseflow plan --intent missed_appointment_rebook --customer-id 123\n  caseflow doctor --json"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Config file path (default: caseflow.toml)")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Classifier override: keyword or reasoning")]
    classifier: Option<ClassifierKind>,
    #[arg(long, global = true, help = "LLM provider override: openai, anthropic or ollama")]
    llm_provider: Option<LlmProvider>,
    #[arg(long, global = true, help = "LLM model override")]
    llm_model: Option<String>,
    #[arg(long, global = true, help = "Log level override")]
    log_level: Option<String>,
    #[arg(long, global = true, help = "Backend fixtures JSON file")]
    fixtures: Option<PathBuf>,
    #[arg(long, global = true, help = "Plan templates TOML file")]
    templates: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run one customer message through the agent and print the response")]
    Handle {
        #[arg(long)]
        customer_id: String,
        #[arg(long)]
        message: String,
    },
    #[command(about = "Decode a structured decision from model output (file or stdin)")]
    Decode {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    #[command(about = "Build and print the plan for an intent without executing it")]
    Plan {
        #[arg(long)]
        intent: String,
        #[arg(long)]
        customer_id: String,
        #[arg(long, help = "Selected slot id for missed_appointment_confirm_slot")]
        slot: Option<String>,
        #[arg(long, help = "Escalation reason for the escalation intent")]
        reason: Option<String>,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, templates, fixtures, tool coverage and llm readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

impl Cli {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            require_file: self.config.is_some(),
            config_path: self.config.clone(),
            overrides: ConfigOverrides {
                classifier: self.classifier,
                log_level: self.log_level.clone(),
                llm_provider: self.llm_provider,
                llm_model: self.llm_model.clone(),
                fixtures_path: self.fixtures.clone(),
                templates_path: self.templates.clone(),
            },
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_logging(logging: &LoggingConfig) {
    use tracing::Level;

    let log_level = logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    // Another subscriber (tests, embedding) wins.
    let _ = match logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = cli.load_options();

    let logging = AppConfig::load(options.clone())
        .map(|config| config.logging)
        .unwrap_or_else(|_| AppConfig::default().logging);
    init_logging(&logging);
    tracing::debug!(event_name = "system.cli.start", command = ?cli.command, "caseflow cli");

    let result = match cli.command {
        Command::Handle { customer_id, message } => {
            commands::handle::run(options, &customer_id, &message)
        }
        Command::Decode { file } => commands::decode::run(file.as_deref()),
        Command::Plan { intent, customer_id, slot, reason } => commands::plan::run(
            options,
            &commands::plan::PlanRequest { intent, customer_id, slot_id: slot, reason },
        ),
        Command::Config => commands::CommandResult {
            exit_code: commands::EXIT_OK,
            output: commands::config::run(options),
        },
        Command::Doctor { json } => commands::CommandResult {
            exit_code: commands::EXIT_OK,
            output: commands::doctor::run(options, json),
        },
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
