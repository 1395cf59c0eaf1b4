use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use lifecycle_mailer::config;
use lifecycle_mailer::db;
use lifecycle_mailer::transport::{HttpTransport, LogTransport, MessageTransport};
use lifecycle_mailer::worker::Worker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Run the lifecycle campaign worker")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;

    let transport: Arc<dyn MessageTransport> = if cfg.transport.dry_run {
        info!("dry run: messages are logged, not sent");
        Arc::new(LogTransport)
    } else {
        Arc::new(HttpTransport::from_config(&cfg.transport)?)
    };

    let worker = Arc::new(
        Worker::load(pool.clone(), transport, cfg.worker.clone(), cfg.retry).await?,
    );
    worker.start().await;
    info!(enabled = worker.is_enabled(), "lifecycle mailer running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    worker.stop().await;
    pool.close().await;
    info!("shutdown complete");
    Ok(())
}
