//! Sweeper - deletes expired upload buckets from a mail store
//!
//! Runs the upload repository cleanup as a task and prints its final
//! details as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use mailstore::{
    BucketNameGenerator, CleanupScope, InMemoryTaskManager, Repositories, RetentionCleanupTask,
    StoreConfig, TaskManager, TaskStatus,
};

/// Upload bucket retention sweep.
#[derive(Parser, Debug)]
#[command(name = "sweeper", about = "Delete expired upload buckets")]
struct Cli {
    /// Which upload buckets to delete: `expired` or `all`.
    #[arg(long)]
    scope: Option<String>,

    /// Path to a storage JSON file (defaults to ~/.config/mailstore/storage.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds to wait for the sweep before reporting its current state.
    #[arg(long, default_value_t = 3600)]
    timeout: u64,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(TaskStatus::Completed) => {}
        Ok(status) => {
            error!("Cleanup ended with status {:?}", status);
            std::process::exit(1);
        }
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> Result<TaskStatus> {
    // Validate before touching any store
    let scope = CleanupScope::parse(cli.scope.as_deref())?;

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let store_config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::load()?,
    };
    let repositories = Repositories::open(&store_config, BucketNameGenerator::system())
        .context("Failed to open mail store")?;

    let manager = InMemoryTaskManager::new();
    let task = RetentionCleanupTask::for_repositories(&repositories, scope, store_config.retention());
    let task_id = manager.submit(Arc::new(task)).await?;
    info!("Submitted {} cleanup as task {}", scope, task_id);
    println!("{}", serde_json::json!({ "taskId": task_id }));

    let details = manager
        .await_task(&task_id, Duration::from_secs(cli.timeout))
        .await?;
    println!("{}", serde_json::to_string_pretty(&details)?);
    Ok(details.status)
}
