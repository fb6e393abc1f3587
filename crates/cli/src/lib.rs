pub mod commands;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::process::ExitCode;

use charter_core::EntityKind;

#[derive(Debug, Parser)]
#[command(
    name = "charter",
    about = "Charter operator CLI",
    long_about = "Operate entity formation workflows and compliance calendars, apply migrations, \
                  and inspect configuration.",
    after_help = "Examples:\n  charter doctor --json\n  charter workflow create --name \"Acme LLC\" \
                  --jurisdiction WY\n  charter calendar monitor cal_0123456789abcdef01234567"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, filing templates, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Create and advance formation workflows")]
    Workflow(WorkflowCommand),
    #[command(subcommand, about = "Generate and monitor compliance calendars")]
    Calendar(CalendarCommand),
}

#[derive(Debug, Subcommand)]
pub enum WorkflowCommand {
    #[command(about = "Start a formation workflow for a new entity")]
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, help = "Jurisdiction name or two-letter code")]
        jurisdiction: String,
        #[arg(long, value_parser = parse_entity_kind, default_value = "llc")]
        kind: EntityKind,
        #[arg(long)]
        email: Option<String>,
    },
    #[command(about = "Execute one step; manual steps need --input")]
    Execute {
        workflow_id: String,
        step_id: String,
        #[arg(long, help = "JSON payload passed to the step")]
        input: Option<String>,
    },
    #[command(about = "Show the full workflow record")]
    Show { workflow_id: String },
    #[command(about = "List steps that can run now, and failed steps that can be retried")]
    Next { workflow_id: String },
}

#[derive(Debug, Subcommand)]
pub enum CalendarCommand {
    #[command(about = "Generate (or merge into) the compliance calendar of an entity")]
    Generate {
        #[arg(long)]
        entity_ref: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        jurisdiction: String,
        #[arg(long, help = "Formation date as YYYY-MM-DD")]
        formation_date: NaiveDate,
        #[arg(long)]
        years: Option<u32>,
    },
    #[command(about = "Append more years to an existing calendar")]
    Extend {
        calendar_id: String,
        #[arg(long, default_value_t = 1)]
        years: u32,
    },
    #[command(about = "Show the full calendar record")]
    Show { calendar_id: String },
    #[command(about = "Classify events and prepare filings that are due")]
    Monitor {
        calendar_id: String,
        #[arg(long, help = "Evaluate as of this date (YYYY-MM-DD) instead of today")]
        as_of: Option<NaiveDate>,
    },
    #[command(about = "Monitor every stored calendar")]
    Sweep {
        #[arg(long, help = "Evaluate as of this date (YYYY-MM-DD) instead of today")]
        as_of: Option<NaiveDate>,
    },
}

fn parse_entity_kind(value: &str) -> Result<EntityKind, String> {
    EntityKind::parse(value).ok_or_else(|| format!("unknown entity kind `{value}`"))
}

/// Diagnostics go to stderr so stdout stays a single JSON document.
/// `CHARTER_CLI_LOG` takes an env-filter directive and defaults to `warn`.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("CHARTER_CLI_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Workflow(command) => commands::workflow::run(command),
        Command::Calendar(command) => commands::calendar::run(command),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
