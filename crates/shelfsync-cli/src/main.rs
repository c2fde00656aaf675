use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use shelfsync_core::{AppConfig, Database, ExitCode, NewTask, TaskStatus};
use shelfsync_reconcile::{
    MatchScorer, Services, TaskResult, deduplicate, extract_from_filename, parse_publication,
    search_terms,
};

// ─── CLI Definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "shelfsync",
    about = "Reconcile a channel's book publications and files with a catalog",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format. Also enabled by setting SHELFSYNC_JSON=1.
    #[arg(long, global = true)]
    json: bool,

    /// Config file (defaults to ~/.config/shelfsync/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of `logging.level`.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the oldest unprocessed publications.
    Process {
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Run the download queue worker until interrupted.
    Worker {
        /// Handle at most one task and exit.
        #[arg(long)]
        once: bool,
    },

    /// Queue a file for download.
    Enqueue {
        #[arg(long)]
        message_id: i64,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        file_id: Option<String>,
        #[arg(long)]
        book_id: Option<Uuid>,
        #[arg(long, default_value = "0")]
        priority: i32,
    },

    /// List download tasks, newest first.
    Tasks {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Re-queue a failed task.
    Retry {
        task_id: i64,
        #[arg(long, default_value = "0")]
        delay_secs: i64,
    },

    /// Fail tasks stuck in `processing` longer than the given age.
    ResetStuck {
        #[arg(long, default_value = "30")]
        minutes: i64,
    },

    /// Parse a publication text file and print the extracted fields.
    Parse { file: PathBuf },

    /// Show how a file name would be matched against the catalog.
    Match {
        filename: String,
        #[arg(long, default_value = "5")]
        limit: usize,
    },

    /// Merge catalog records sharing a title and author.
    Dedup {
        #[arg(long)]
        title: String,
        #[arg(long)]
        author: String,
    },

    /// Show the effective config, or write a default one.
    Config {
        #[arg(long)]
        init: bool,
    },

    /// Catalog, queue and ledger counts.
    Stats,
}

// ─── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let start = Instant::now();
    let cli = Cli::parse();

    let json_output = cli.json || std::env::var("SHELFSYNC_JSON").as_deref() == Ok("1");
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::config_path);
    let config = AppConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    init_tracing(&config, cli.verbose)?;

    match cli.command {
        Commands::Process { count } => {
            let services = init_services(&config);
            let orchestrator = services.orchestrator()?;
            let outcomes = orchestrator.process_many(count.max(1)).await;
            let dur = start.elapsed().as_millis();

            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "items": outcomes, "total": outcomes.len() },
                    "meta": { "duration_ms": dur }
                }))?;
            } else {
                for outcome in &outcomes {
                    let mark = if outcome.success { "✓" } else { "✗" };
                    println!("{mark} {}", outcome.message);
                    for action in &outcome.actions {
                        println!("    {action}");
                    }
                }
            }
        }

        Commands::Worker { once } => {
            let services = init_services(&config);
            let worker = services.worker()?;

            if once {
                let result = worker.run_once().await?;
                services.shutdown().await;
                let dur = start.elapsed().as_millis();
                if json_output {
                    print_json(&serde_json::json!({"status":"ok","data":result,"meta":{"duration_ms":dur}}))?;
                } else {
                    println!("{}", describe_task_result(&result));
                }
            } else {
                let (tx, rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("interrupt received, finishing current task");
                        let _ = tx.send(true);
                    }
                });
                let stats = worker.run(rx).await;
                let dur = start.elapsed().as_millis();
                if json_output {
                    print_json(&serde_json::json!({"status":"ok","data":stats,"meta":{"duration_ms":dur}}))?;
                } else {
                    println!(
                        "Worker stopped: {} attached, {} skipped, {} failed",
                        stats.attached, stats.skipped, stats.failed
                    );
                }
            }
        }

        Commands::Enqueue { message_id, channel, file_id, book_id, priority } => {
            let db = open_db(&config)?;
            let mut task = NewTask::new(message_id, channel).with_priority(priority);
            if let Some(file_id) = file_id {
                task = task.with_file(file_id);
            }
            if let Some(book_id) = book_id {
                task = task.with_book(book_id);
            }
            let id = db.enqueue(&task)?;
            let dur = start.elapsed().as_millis();
            if json_output {
                print_json(&serde_json::json!({"status":"ok","data":{"task_id":id},"meta":{"duration_ms":dur}}))?;
            } else {
                println!("Queued task {id}");
            }
        }

        Commands::Tasks { status, limit } => {
            let db = open_db(&config)?;
            let tasks = db.list_tasks(status, limit)?;
            let dur = start.elapsed().as_millis();

            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "items": tasks, "total": tasks.len() },
                    "meta": { "duration_ms": dur }
                }))?;
            } else if tasks.is_empty() {
                println!("No tasks.");
            } else {
                for task in &tasks {
                    println!(
                        "{id:>6}  {status:<10}  {channel}/{message}  retries={retries}  {error}",
                        id = task.id,
                        status = task.status,
                        channel = task.channel_id,
                        message = task.message_id,
                        retries = task.retry_count,
                        error = task.error_message.as_deref().unwrap_or(""),
                    );
                }
            }
        }

        Commands::Retry { task_id, delay_secs } => {
            let db = open_db(&config)?;
            let id = db.retry_task(task_id, chrono::Duration::seconds(delay_secs.max(0)))?;
            let dur = start.elapsed().as_millis();
            if json_output {
                print_json(&serde_json::json!({"status":"ok","data":{"failed_task":task_id,"task_id":id},"meta":{"duration_ms":dur}}))?;
            } else {
                println!("Task {task_id} re-queued as {id}");
            }
        }

        Commands::ResetStuck { minutes } => {
            let db = open_db(&config)?;
            let reset = db.reset_stuck_tasks(chrono::Duration::minutes(minutes.max(0)))?;
            let dur = start.elapsed().as_millis();
            if json_output {
                print_json(&serde_json::json!({"status":"ok","data":{"reset":reset},"meta":{"duration_ms":dur}}))?;
            } else {
                println!("Marked {reset} stuck task(s) failed");
            }
        }

        Commands::Parse { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let parsed = parse_publication(&text);
            let dur = start.elapsed().as_millis();
            if json_output {
                print_json(&serde_json::json!({"status":"ok","data":parsed,"meta":{"duration_ms":dur}}))?;
            } else {
                println!("{}", serde_json::to_string_pretty(&parsed)?);
            }
        }

        Commands::Match { filename, limit } => {
            let db = open_db(&config)?;
            let extracted = extract_from_filename(&filename);
            let terms = search_terms(&filename);
            let candidates = db.search_candidates(&terms, config.matching.candidate_limit)?;
            let scorer = MatchScorer::from_config(&config.matching);
            let mut ranked = scorer.rank(&extracted, &terms, &candidates);
            ranked.truncate(limit);
            let dur = start.elapsed().as_millis();

            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": {
                        "extracted": extracted,
                        "terms": terms,
                        "threshold": scorer.threshold(),
                        "items": ranked,
                    },
                    "meta": { "duration_ms": dur }
                }))?;
            } else {
                println!("Author: {}", extracted.author);
                println!("Title:  {}", extracted.title);
                println!("Terms:  {}", terms.join(" "));
                if ranked.is_empty() {
                    println!("No candidates in the catalog.");
                }
                for candidate in &ranked {
                    let mark = if candidate.score >= scorer.threshold() { "✓" } else { " " };
                    println!(
                        "{mark} {score:>3}  {id}  {title} — {author}",
                        score = candidate.score,
                        id = &candidate.record.id.to_string()[..8],
                        title = candidate.record.title,
                        author = candidate.record.author,
                    );
                }
            }
        }

        Commands::Dedup { title, author } => {
            let db = open_db(&config)?;
            let outcome = deduplicate(&db, &title, &author)?;
            let dur = start.elapsed().as_millis();
            if json_output {
                print_json(&serde_json::json!({"status":"ok","data":outcome,"meta":{"duration_ms":dur}}))?;
            } else {
                match outcome.canonical_id {
                    None => println!("No records for «{title}» by {author}"),
                    Some(id) => {
                        println!("Canonical record: {id}");
                        println!("Removed: {}", outcome.removed.len());
                        if let Some(from) = outcome.file_copied_from {
                            println!("File copied from: {from}");
                        }
                        for error in &outcome.errors {
                            eprintln!("  ! {error}");
                        }
                    }
                }
            }
            if !outcome.is_success() {
                std::process::exit(ExitCode::GeneralError as i32);
            }
        }

        Commands::Config { init } => {
            if init {
                if config_path.exists() {
                    eprintln!("Config already exists: {}", config_path.display());
                    std::process::exit(ExitCode::InvalidArgs as i32);
                }
                AppConfig::default().save_to(&config_path)?;
                println!("Wrote default config to {}", config_path.display());
            } else {
                let dur = start.elapsed().as_millis();
                if json_output {
                    print_json(&serde_json::json!({
                        "status": "ok",
                        "data": { "path": config_path, "config": config },
                        "meta": { "duration_ms": dur }
                    }))?;
                } else {
                    println!("# {}", config_path.display());
                    print!("{}", toml::to_string_pretty(&config)?);
                }
                if let Err(e) = config.validate() {
                    eprintln!("warning: {e}");
                }
            }
        }

        Commands::Stats => {
            let db = open_db(&config)?;
            let records = db.count_records()?;
            let with_files = db.count_records_with_files()?;
            let ledger = db.count_ledger()?;
            let tasks = db.task_counts()?;
            let dur = start.elapsed().as_millis();

            if json_output {
                let task_map: serde_json::Map<String, serde_json::Value> = tasks
                    .iter()
                    .map(|(status, n)| (status.to_string(), serde_json::json!(n)))
                    .collect();
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": {
                        "records": records,
                        "records_with_files": with_files,
                        "ledger_entries": ledger,
                        "tasks": task_map,
                    },
                    "meta": { "duration_ms": dur }
                }))?;
            } else {
                println!("Catalog statistics:");
                println!("  Records:         {records}");
                println!("  With files:      {with_files}");
                println!("  Ledger entries:  {ledger}");
                for (status, n) in &tasks {
                    println!("  Tasks {status:<10} {n}");
                }
            }
        }
    }

    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn init_tracing(config: &AppConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing tracing subscriber")?;
    Ok(())
}

/// Services for the long-running commands; exits when required settings are missing.
fn init_services(config: &AppConfig) -> Services {
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        std::process::exit(ExitCode::ConfigError as i32);
    }
    match Services::init(config) {
        Ok(services) => services,
        Err(e) => {
            warn!(error = %e, "startup failed");
            eprintln!("Cannot start: {e}");
            std::process::exit(ExitCode::ConfigError as i32);
        }
    }
}

fn describe_task_result(result: &TaskResult) -> String {
    match result {
        TaskResult::Idle => "Queue is empty".to_string(),
        TaskResult::Attached { task_id, book_id } => format!("Task {task_id}: attached to {book_id}"),
        TaskResult::Skipped { task_id, reason } => format!("Task {task_id}: skipped ({reason})"),
        TaskResult::Failed { task_id, error } => format!("Task {task_id}: failed: {error}"),
    }
}

fn print_json(val: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(val)?);
    Ok(())
}

fn open_db(config: &AppConfig) -> Result<Database> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open_with_timeout(&db_path, config.database.busy_timeout_ms)?)
}
