//! Campo CLI - offline-first field data capture
//!
//! Records queue locally and only leave the device on an explicit `campo
//! sync`, so the tool stays usable with no connectivity at all.

use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use campo_core::db::LocalStore;
use campo_core::protocol::{AttendanceRecord, CardAssignmentRecord, CollectionRecord};
use campo_core::sync::{SyncClient, SyncEngine};
use campo_core::timefmt::normalize_time;
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, shells};
use serde::Serialize;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "campo")]
#[command(about = "Capture field work offline and sync it on demand")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to the local database file
    #[arg(long, value_name = "PATH", global = true)]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how many records are waiting to be uploaded
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record a worker's attendance for a day
    Attendance {
        worker_id: i64,
        /// Date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<String>,
        /// Check-in time; locale formats like "9:30 a. m." are accepted
        #[arg(long)]
        check_in: Option<String>,
        /// Check-out time
        #[arg(long)]
        check_out: Option<String>,
        #[arg(long)]
        field_id: Option<i64>,
        #[arg(long)]
        task_type_id: Option<i64>,
    },
    /// Record a harvest collection
    Collection {
        worker_id: i64,
        card_id: i64,
        container_id: i64,
        quantity: f64,
        /// Date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        field_id: Option<i64>,
    },
    /// Assign a card to a worker for a day
    Assign {
        card_id: i64,
        worker_id: i64,
        /// Date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<String>,
    },
    /// Remove a card assignment (queues a delete for the next sync)
    Unassign {
        card_id: i64,
        /// Date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<String>,
    },
    /// Upload pending records, then refresh local data from the server
    Sync,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] campo_core::Error),
    #[error(transparent)]
    TimeFormat(#[from] campo_core::timefmt::TimeFormatError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid date: {0} (expected YYYY-MM-DD)")]
    InvalidDate(String),
    #[error("Quantity must not be negative")]
    NegativeQuantity,
    #[error(
        "Sync is not configured. Set CAMPO_API_URL and CAMPO_API_TOKEN to enable `campo sync`."
    )]
    SyncNotConfigured,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("campo=info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Status { json } => run_status(&db_path, json),
        Commands::Attendance {
            worker_id,
            date,
            check_in,
            check_out,
            field_id,
            task_type_id,
        } => run_attendance(
            &db_path,
            worker_id,
            date,
            check_in.as_deref(),
            check_out.as_deref(),
            field_id,
            task_type_id,
        ),
        Commands::Collection {
            worker_id,
            card_id,
            container_id,
            quantity,
            date,
            field_id,
        } => run_collection(
            &db_path, worker_id, card_id, container_id, quantity, date, field_id,
        ),
        Commands::Assign {
            card_id,
            worker_id,
            date,
        } => run_assign(&db_path, card_id, worker_id, date),
        Commands::Unassign { card_id, date } => run_unassign(&db_path, card_id, date),
        Commands::Sync => run_sync(&db_path).await,
        Commands::Completions { shell } => run_completions(shell),
    }
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    attendances: usize,
    collections: usize,
    card_assignments: usize,
    total: usize,
}

fn run_status(db_path: &Path, as_json: bool) -> Result<(), CliError> {
    let store = LocalStore::open(db_path)?;
    let counts = store.pending_counts()?;

    if as_json {
        let output = StatusOutput {
            attendances: counts.attendances,
            collections: counts.collections,
            card_assignments: counts.card_assignments,
            total: counts.total(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("attendances:      {}", counts.attendances);
        println!("collections:      {}", counts.collections);
        println!("card assignments: {}", counts.card_assignments);
        println!("total pending:    {}", counts.total());
    }
    Ok(())
}

fn run_attendance(
    db_path: &Path,
    worker_id: i64,
    date: Option<String>,
    check_in: Option<&str>,
    check_out: Option<&str>,
    field_id: Option<i64>,
    task_type_id: Option<i64>,
) -> Result<(), CliError> {
    let record = AttendanceRecord {
        worker_id,
        date: resolve_date(date)?,
        // Normalize up front so a bad time fails here, not at sync time.
        check_in: normalize_time(check_in)?,
        check_out: normalize_time(check_out)?,
        field_id,
        task_type_id,
    };

    let store = LocalStore::open(db_path)?;
    let id = store.queue_attendance(&record)?;
    println!("queued attendance #{id}");
    Ok(())
}

fn run_collection(
    db_path: &Path,
    worker_id: i64,
    card_id: i64,
    container_id: i64,
    quantity: f64,
    date: Option<String>,
    field_id: Option<i64>,
) -> Result<(), CliError> {
    if quantity < 0.0 {
        return Err(CliError::NegativeQuantity);
    }
    let record = CollectionRecord {
        worker_id,
        card_id,
        date: resolve_date(date)?,
        container_id,
        quantity,
        field_id,
    };

    let store = LocalStore::open(db_path)?;
    let id = store.queue_collection(&record)?;
    println!("queued collection #{id}");
    Ok(())
}

fn run_assign(
    db_path: &Path,
    card_id: i64,
    worker_id: i64,
    date: Option<String>,
) -> Result<(), CliError> {
    let record = CardAssignmentRecord {
        card_id,
        worker_id,
        date: resolve_date(date)?,
        deleted_at: None,
    };

    let store = LocalStore::open(db_path)?;
    let id = store.queue_card_assignment(&record)?;
    println!("queued assignment #{id}");
    Ok(())
}

fn run_unassign(db_path: &Path, card_id: i64, date: Option<String>) -> Result<(), CliError> {
    // The worker id is irrelevant for a delete; the server matches on
    // (date, card) only.
    let record = CardAssignmentRecord {
        card_id,
        worker_id: 0,
        date: resolve_date(date)?,
        deleted_at: Some(Utc::now().to_rfc3339()),
    };

    let store = LocalStore::open(db_path)?;
    let id = store.queue_card_assignment(&record)?;
    println!("queued unassignment #{id}");
    Ok(())
}

async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    let (endpoint, token) = sync_config_from_env().ok_or(CliError::SyncNotConfigured)?;
    tracing::info!(db = %db_path.display(), "Starting sync cycle");

    let mut store = LocalStore::open(db_path)?;
    let engine = SyncEngine::new(SyncClient::new(endpoint, token)?);
    let report = engine.run(&mut store).await?;

    if report.uploaded.is_empty() {
        println!("nothing to upload");
    } else {
        for (entity, count) in &report.uploaded {
            if *count > 0 {
                println!("uploaded {count} {entity}");
            }
        }
    }
    println!("local data refreshed");
    Ok(())
}

fn run_completions(shell: CompletionShell) -> Result<(), CliError> {
    let mut command = Cli::command();
    let mut buffer = Vec::new();
    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut command, "campo", &mut buffer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut command, "campo", &mut buffer),
        CompletionShell::Fish => generate(shells::Fish, &mut command, "campo", &mut buffer),
    }
    io::stdout().write_all(&buffer)?;
    Ok(())
}

fn resolve_date(date: Option<String>) -> Result<String, CliError> {
    match date {
        None => Ok(Utc::now().date_naive().format("%Y-%m-%d").to_string()),
        Some(raw) => {
            let trimmed = raw.trim();
            if chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_err() {
                return Err(CliError::InvalidDate(trimmed.to_string()));
            }
            Ok(trimmed.to_string())
        }
    }
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("CAMPO_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("campo")
        .join("campo.db")
}

fn sync_config_from_env() -> Option<(String, String)> {
    let endpoint = env::var("CAMPO_API_URL").ok()?;
    let token = env::var("CAMPO_API_TOKEN").ok()?;
    if endpoint.trim().is_empty() || token.trim().is_empty() {
        return None;
    }
    Some((endpoint, token))
}
