//! Simple Bank task worker
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌───────────────┐    ┌──────────┐
//! │  Config  │───▶│ Postgres │───▶│ TaskProcessor │───▶│  Mailer  │
//! │  (YAML)  │    │ (tasks)  │    │  (N workers)  │    │  (log)   │
//! └──────────┘    └──────────┘    └───────────────┘    └──────────┘
//! ```
//!
//! Usage: `simple_bank [--env <name>]` loads `config/<name>.yaml` (default `dev`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;

use simple_bank::config::AppConfig;
use simple_bank::mail::LogEmailSender;
use simple_bank::store::Store;
use simple_bank::store::postgres::PgBackend;
use simple_bank::worker::{
    PgTaskQueue, ProcessorConfig, SendVerifyEmailHandler, TASK_SEND_VERIFY_EMAIL, TaskProcessor,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = simple_bank::logging::init_logging(&app_config)?;

    tracing::info!(
        env = %env,
        git_hash = env!("GIT_HASH"),
        "Starting Simple Bank task worker"
    );

    let database_url = app_config
        .postgres_url
        .as_deref()
        .context("postgres_url must be set")?;
    let backend = PgBackend::connect(database_url, &app_config.store).await?;
    backend.health_check().await?;
    backend.migrate().await?;

    let mut store = Store::new(Arc::new(backend.clone()));
    if let Some(ms) = app_config.store.tx_timeout_ms {
        store = store.with_tx_timeout(Duration::from_millis(ms));
    }

    let mailer = Arc::new(LogEmailSender::new(
        app_config.verify_email.from_name.clone(),
        app_config.verify_email.from_address.clone(),
    ));
    let queue = Arc::new(PgTaskQueue::new(backend.pool().clone()));
    let processor_config = ProcessorConfig::from_worker_config(&app_config.worker)?;

    let processor = Arc::new(TaskProcessor::new(queue, processor_config).handle(
        TASK_SEND_VERIFY_EMAIL,
        Arc::new(SendVerifyEmailHandler::new(
            store,
            mailer,
            app_config.verify_email.clone(),
        )),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(processor.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, draining in-flight tasks");
    let _ = shutdown_tx.send(true);

    worker.await.context("Task processor panicked")?;
    tracing::info!("Simple Bank task worker stopped");
    Ok(())
}
