mod cmds;

use std::io;
use std::io::IsTerminal;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use checkin_config::AppConfig;
use checkin_lifecycle::{
    AlignReference, AlignRequest, AuditScope, CheckInManager, EnrollmentParams, Frequency,
    LifecycleError, RepairOutcome, SeriesKey, StoreError, SubmitRequest,
};

#[derive(Debug, Parser)]
#[command(
    name = "checkin",
    version,
    about = "Schedule, link, audit and repair recurring client check-ins"
)]
struct Cli {
    /// Configuration file; missing files fall back to defaults.
    #[arg(long, global = true, default_value = "config/checkin.toml")]
    config: PathBuf,
    /// Print results as JSON instead of the human summary.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Plan a new series for a client and persist its slots.
    CreateSeries {
        #[arg(long)]
        client: String,
        #[arg(long)]
        form: String,
        #[arg(long)]
        coach: String,
        /// Program start (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// First check-in date; defaults to start + 7 days.
        #[arg(long)]
        first_date: Option<NaiveDate>,
        /// Due time as HH:MM; defaults to `schedule.default_due_time`.
        #[arg(long)]
        due_time: Option<String>,
        #[arg(long, value_enum, default_value = "weekly")]
        frequency: CliFrequency,
        #[arg(long)]
        duration: i64,
    },
    /// Record a submitted response and complete its slot.
    #[command(group(ArgGroup::new("target").required(true).args(["slot", "sequence"])))]
    Submit {
        #[arg(long)]
        client: String,
        #[arg(long)]
        form: String,
        #[arg(long)]
        coach: String,
        #[arg(long)]
        slot: Option<String>,
        #[arg(long)]
        sequence: Option<u32>,
        /// Caller-chosen id; makes retries of the same submission idempotent.
        #[arg(long)]
        response_id: Option<String>,
        #[arg(long)]
        score: f64,
        /// RFC 3339 timestamp; defaults to now.
        #[arg(long)]
        submitted_at: Option<DateTime<Utc>>,
    },
    /// Scan slots and responses for broken links.  Read-only.
    Audit {
        #[arg(long)]
        client: Option<String>,
        #[arg(long, requires = "client")]
        form: Option<String>,
    },
    /// Fix the inconsistencies an audit reports.
    Repair {
        #[arg(long)]
        client: Option<String>,
        #[arg(long, requires = "client")]
        form: Option<String>,
        /// Plan only; nothing is written.
        #[arg(long)]
        dry_run: bool,
        /// Skip the interactive confirmation.
        #[arg(long)]
        yes: bool,
    },
    /// Shift a client's schedule so slot 1 lands on a reference date.
    #[command(group(
        ArgGroup::new("reference")
            .required(true)
            .args(["reference_client", "reference_date"])
    ))]
    Align {
        #[arg(long)]
        client: String,
        #[arg(long)]
        form: Option<String>,
        #[arg(long)]
        reference_client: Option<String>,
        #[arg(long)]
        reference_date: Option<NaiveDate>,
    },
    /// Show effective configuration and store health.
    Doctor,
    /// Show the most recent repair journal records.
    Journal {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliFrequency {
    Once,
    Weekly,
    Fortnightly,
}

impl From<CliFrequency> for Frequency {
    fn from(value: CliFrequency) -> Self {
        match value {
            CliFrequency::Once => Frequency::Once,
            CliFrequency::Weekly => Frequency::Weekly,
            CliFrequency::Fortnightly => Frequency::Fortnightly,
        }
    }
}

fn audit_scope(client: Option<String>, form: Option<String>) -> AuditScope {
    match (client, form) {
        (Some(client), Some(form)) => AuditScope::Series(SeriesKey::new(client, form)),
        (Some(client), None) => AuditScope::Client(client),
        _ => AuditScope::All,
    }
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

/// Machine-readable form of a failed command, printed under `--json`.
fn error_payload(err: &anyhow::Error) -> serde_json::Value {
    let code = err
        .chain()
        .find_map(|cause| {
            if let Some(err) = cause.downcast_ref::<LifecycleError>() {
                Some(err.code())
            } else {
                cause.downcast_ref::<StoreError>().map(|_| "write_error")
            }
        })
        .unwrap_or("error");
    serde_json::json!({ "error": code, "message": err.to_string() })
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let json = cli.json;

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if json => {
            println!("{}", error_payload(&err));
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load_from(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if let Commands::Doctor = cli.command {
        return cmds::run_doctor(&cli.config, &config);
    }
    if let Commands::Journal { limit } = cli.command {
        return cmds::run_journal(&config, limit.max(1), cli.json);
    }

    let manager = CheckInManager::open(config)?;
    match cli.command {
        Commands::CreateSeries {
            client,
            form,
            coach,
            start_date,
            first_date,
            due_time,
            frequency,
            duration,
        } => {
            let params = EnrollmentParams {
                client_id: client,
                form_id: form,
                coach_id: coach,
                start_date,
                first_check_in_date: first_date,
                due_time,
                frequency: frequency.into(),
                duration,
                check_in_window: None,
            };
            let today = manager.generator().settings().local_date(Utc::now());
            let anchor = manager.create_series(&params, today).await?;
            emit(cli.json, &anchor, cmds::print_created)?;
        }
        Commands::Submit {
            client,
            form,
            coach,
            slot,
            sequence,
            response_id,
            score,
            submitted_at,
        } => {
            let request = SubmitRequest {
                client_id: client,
                form_id: form,
                coach_id: coach,
                slot_id: slot,
                sequence_number: sequence,
                response_id,
                submitted_at: submitted_at.unwrap_or_else(Utc::now),
                score,
            };
            let result = manager.submit_response(&request).await?;
            emit(cli.json, &result, cmds::print_link)?;
        }
        Commands::Audit { client, form } => {
            let report = manager.audit(&audit_scope(client, form)).await?;
            emit(cli.json, &report, cmds::print_audit)?;
        }
        Commands::Repair {
            client,
            form,
            dry_run,
            yes,
        } => {
            let scope = audit_scope(client, form);
            if !dry_run && !yes && !confirm_repair(&manager, &scope).await? {
                println!("repair cancelled");
                return Ok(());
            }
            let summary = manager.repair(&scope, dry_run).await?;
            emit(cli.json, &summary, cmds::print_repair)?;
            let failed = summary.count(RepairOutcome::Failed);
            if failed > 0 {
                bail!("{failed} repair actions failed; re-run once the store is healthy");
            }
        }
        Commands::Align {
            client,
            form,
            reference_client,
            reference_date,
        } => {
            let reference = match (reference_client, reference_date) {
                (Some(other), _) => AlignReference::Client(other),
                (None, Some(date)) => AlignReference::Date(date),
                (None, None) => bail!("align requires --reference-client or --reference-date"),
            };
            let request = AlignRequest {
                client_id: client,
                form_id: form,
                reference,
            };
            let summary = manager.align(&request).await?;
            emit(cli.json, &summary, cmds::print_align)?;
            if !summary.is_complete() {
                bail!("alignment incomplete; re-run the same command to finish it");
            }
        }
        Commands::Doctor | Commands::Journal { .. } => {}
    }

    Ok(())
}

/// Preview the plan and ask for a typed confirmation before writing.
async fn confirm_repair(manager: &CheckInManager, scope: &AuditScope) -> Result<bool> {
    if !io::stdin().is_terminal() {
        bail!("refusing to repair in non-interactive mode without --yes (or pass --dry-run)");
    }

    let preview = manager.repair(scope, true).await?;
    let planned = preview.count(RepairOutcome::Planned);
    println!("repair preview for {scope}");
    println!("- writes planned: {planned}");
    println!("- manual review:  {}", preview.count(RepairOutcome::ManualReviewRequired));
    println!("- unresolved:     {}", preview.count(RepairOutcome::Unresolved));
    if planned == 0 {
        println!("nothing to write");
        return Ok(false);
    }

    print!("This rewrites {planned} link(s) and journals each change. Type 'REPAIR' to continue: ");
    io::stdout().flush()?;
    let mut confirmation = String::new();
    io::stdin().read_line(&mut confirmation)?;
    Ok(confirmation.trim() == "REPAIR")
}
