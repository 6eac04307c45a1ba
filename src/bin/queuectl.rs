//! queuectl CLI: operator interface to the job queue.

use clap::{Parser, Subcommand};
use queuectl::config::Config;
use queuectl::db::Db;
use queuectl::model::{ConfigKey, JobId, JobState, NewJob};
use queuectl::supervisor;
use queuectl::telemetry::{TelemetryConfig, init_telemetry};
use queuectl::worker::{Shutdown, Worker};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "queuectl", version, about = "Durable background job queue on SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a job from JSON, e.g. '{"command":"echo hi"}'
    Enqueue {
        /// Job JSON with `command` and optional `id` and `max_retries`
        job: String,
    },
    /// List jobs, newest first
    List {
        /// Filter by state (pending, processing, completed, failed, dead) or "all"
        #[arg(long, default_value = "all")]
        state: String,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 10)]
        limit: u32,
        /// Jobs to skip
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Show job counts and active workers
    Status,
    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Queue-wide settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Worker process management
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead-lettered jobs
    List {
        #[arg(long, default_value_t = 10)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Move a dead-lettered job back to pending
    Retry {
        /// Job ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print a setting (max-retries, backoff-base)
    Get { key: String },
    /// Change a setting
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum WorkerAction {
    /// Spawn detached worker processes
    Start {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Signal all registered workers to stop after their current job
    Stop,
    /// Run a worker in the foreground
    Run,
    /// Drop stale workers and requeue their jobs
    Reap,
    /// List registered workers
    List,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // One OS thread per worker; cross-worker concurrency comes from processes.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let _guard = init_telemetry(TelemetryConfig {
            endpoint: config.otel_endpoint.clone(),
            service_name: "queuectl".to_string(),
            log_level: config.log_level.clone(),
        })?;

        let db = Db::open(&config.db_path).await?;
        let result = dispatch(cli.command, &config, db.clone()).await;
        db.close().await;
        result
    })
}

async fn dispatch(command: Command, config: &Config, db: Db) -> anyhow::Result<()> {
    match command {
        Command::Enqueue { job } => cmd_enqueue(&db, &job).await,
        Command::List {
            state,
            limit,
            offset,
        } => cmd_list(&db, &state, limit, offset).await,
        Command::Status => cmd_status(&db).await,
        Command::Dlq { action } => match action {
            DlqAction::List { limit, offset } => cmd_dlq_list(&db, limit, offset).await,
            DlqAction::Retry { id } => {
                let job = db.retry_dlq(&JobId::from(id)).await?;
                println!("Requeued: {} (max retries: {})", job.id, job.max_retries);
                Ok(())
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Get { key } => {
                let key: ConfigKey = key.parse()?;
                println!("{key} = {}", db.config_value(key).await?);
                Ok(())
            }
            ConfigAction::Set { key, value } => {
                let key: ConfigKey = key.parse()?;
                db.set_config(key, &value).await?;
                println!("{key} = {}", db.config_value(key).await?);
                Ok(())
            }
        },
        Command::Worker { action } => match action {
            WorkerAction::Start { count } => {
                let pids = supervisor::start_workers(count, &config.db_path, &config.log_file)?;
                for pid in &pids {
                    println!("Started worker {pid}");
                }
                println!("Logs: {}", config.log_file.display());
                Ok(())
            }
            WorkerAction::Stop => {
                let report = supervisor::stop_workers(&db).await?;
                if report.total() == 0 {
                    println!("No registered workers.");
                }
                for pid in &report.signalled {
                    println!("Signalled worker {pid}");
                }
                for pid in &report.already_gone {
                    println!("Removed worker {pid} (process already gone)");
                }
                for (pid, reason) in &report.failed {
                    println!("Could not stop worker {pid}: {reason}");
                }
                Ok(())
            }
            WorkerAction::Run => cmd_worker_run(config, db).await,
            WorkerAction::Reap => {
                let report = db.reap_stale_workers(config.stale_after).await?;
                println!(
                    "Reaped {} worker(s), requeued {} job(s)",
                    report.workers.len(),
                    report.requeued_jobs
                );
                Ok(())
            }
            WorkerAction::List => cmd_worker_list(&db).await,
        },
    }
}

async fn cmd_enqueue(db: &Db, json: &str) -> anyhow::Result<()> {
    let new: NewJob = serde_json::from_str(json)?;
    let job = db.create_job(new).await?;
    println!("Enqueued: {} (max retries: {})", job.id, job.max_retries);
    Ok(())
}

async fn cmd_list(db: &Db, state: &str, limit: u32, offset: u32) -> anyhow::Result<()> {
    let filter = match state {
        "all" => None,
        s => Some(s.parse::<JobState>()?),
    };

    if filter == Some(JobState::Dead) {
        return cmd_dlq_list(db, limit, offset).await;
    }

    let jobs = db.list_jobs(filter, limit, offset).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<8}  {:<16}  COMMAND",
        "ID", "STATE", "ATTEMPTS", "CREATED"
    );
    println!("{}", "-".repeat(100));

    for job in &jobs {
        println!(
            "{:<36}  {:<10}  {:<8}  {:<16}  {}",
            job.id,
            job.state,
            format!("{}/{}", job.attempts, job.max_retries),
            job.created_at.format("%Y-%m-%d %H:%M").to_string(),
            truncate(&job.command, 40)
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_status(db: &Db) -> anyhow::Result<()> {
    let counts = db.counts_by_state().await?;
    let workers = db.list_active_workers().await?;

    println!("Jobs:");
    for state in JobState::ALL {
        println!("  {:<11} {}", format!("{state}:"), counts.get(state));
    }
    println!("  {:<11} {}", "total:", counts.total());

    println!("\nWorkers: {}", workers.len());
    for w in &workers {
        println!(
            "  pid {:<8} started {}  last heartbeat {}",
            w.pid,
            w.started_at.format("%Y-%m-%d %H:%M:%S"),
            w.last_heartbeat.format("%H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_dlq_list(db: &Db, limit: u32, offset: u32) -> anyhow::Result<()> {
    let entries = db.list_dlq(limit, offset).await?;
    if entries.is_empty() {
        println!("Dead-letter queue is empty.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<8}  {:<16}  {:<30}  COMMAND",
        "ID", "ATTEMPTS", "FAILED", "ERROR"
    );
    println!("{}", "-".repeat(110));

    for entry in &entries {
        println!(
            "{:<36}  {:<8}  {:<16}  {:<30}  {}",
            entry.id,
            entry.attempts,
            entry.failed_at.format("%Y-%m-%d %H:%M").to_string(),
            truncate(entry.error.as_deref().unwrap_or("-"), 30),
            truncate(&entry.command, 40)
        );
    }

    println!("\n{} of {} entries", entries.len(), db.count_dlq().await?);
    Ok(())
}

async fn cmd_worker_list(db: &Db) -> anyhow::Result<()> {
    let workers = db.list_active_workers().await?;
    if workers.is_empty() {
        println!("No registered workers.");
        return Ok(());
    }
    for w in &workers {
        println!(
            "{}  started {}  last heartbeat {}",
            w.pid, w.started_at, w.last_heartbeat
        );
    }
    Ok(())
}

async fn cmd_worker_run(config: &Config, db: Db) -> anyhow::Result<()> {
    let worker = Worker::new(Arc::new(db), config.worker_config());
    tokio::spawn(wait_for_stop(worker.shutdown_handle()));
    worker.run().await?;
    Ok(())
}

/// Request shutdown on the first SIGTERM or SIGINT.
async fn wait_for_stop(shutdown: Shutdown) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();

    tracing::info!("shutdown requested, finishing current job");
    shutdown.request();
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
