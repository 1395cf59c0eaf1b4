//! Admin tool for the lifecycle mailer.
//!
//! ```bash
//! campaignctl status
//! campaignctl disable
//! campaignctl event --user-id 42 --kind integration-connected
//! campaignctl retry-job --job-id 17
//! campaignctl run-once
//! ```

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use lifecycle_mailer::config;
use lifecycle_mailer::db;
use lifecycle_mailer::scheduler::{self, UserEvent};
use lifecycle_mailer::transport::{HttpTransport, LogTransport, MessageTransport};
use lifecycle_mailer::worker::Worker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and steer the lifecycle campaign worker")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the worker switch and job counts
    Status,
    /// Turn the periodic worker on
    Enable,
    /// Turn the periodic worker off
    Disable,
    /// Run one processing cycle now, even when the worker is disabled
    RunOnce {
        /// Log messages instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
    /// Schedule the next campaign step for a user
    Schedule {
        #[arg(long)]
        user_id: i64,
    },
    /// Apply a lifecycle event to a user
    Event {
        #[arg(long)]
        user_id: i64,
        #[arg(long, value_enum)]
        kind: UserEvent,
    },
    /// Re-queue a failed job
    RetryJob {
        #[arg(long)]
        job_id: i64,
    },
    /// List every job of a user
    Jobs {
        #[arg(long)]
        user_id: i64,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct StatusView {
    enabled: bool,
    jobs: db::JobCounts,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load(Some(&cli.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;
    let now = Utc::now();

    match cli.command {
        Command::Status => {
            let view = StatusView {
                enabled: db::load_worker_enabled(&pool).await?,
                jobs: db::count_jobs_by_status(&pool).await?,
            };
            print_json(&view)?;
        }
        Command::Enable => {
            db::store_worker_enabled(&pool, true, now).await?;
            println!("worker enabled");
        }
        Command::Disable => {
            db::store_worker_enabled(&pool, false, now).await?;
            println!("worker disabled");
        }
        Command::RunOnce { dry_run } => {
            let transport: Arc<dyn MessageTransport> = if dry_run || cfg.transport.dry_run {
                Arc::new(LogTransport)
            } else {
                Arc::new(HttpTransport::from_config(&cfg.transport)?)
            };
            let worker =
                Worker::load(pool.clone(), transport, cfg.worker.clone(), cfg.retry).await?;
            print_json(&worker.run_now().await)?;
        }
        Command::Schedule { user_id } => {
            if db::get_user(&pool, user_id).await?.is_none() {
                return Err(anyhow!("user {} not found", user_id));
            }
            match scheduler::schedule_next(&pool, user_id, now).await? {
                Some(job) => print_json(&job)?,
                None => println!("nothing to schedule for user {}", user_id),
            }
        }
        Command::Event { user_id, kind } => {
            let outcome = scheduler::handle_user_event(&pool, user_id, kind, now).await?;
            print_json(&outcome)?;
        }
        Command::RetryJob { job_id } => match scheduler::retry_failed_job(&pool, job_id, now).await? {
            Some(job) => print_json(&job)?,
            None => println!("a retry of job {} is already pending", job_id),
        },
        Command::Jobs { user_id } => {
            print_json(&db::list_jobs_for_user(&pool, user_id).await?)?;
        }
    }

    pool.close().await;
    Ok(())
}
