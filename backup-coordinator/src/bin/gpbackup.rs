//! gpbackup - back up a database across every segment of a cluster

use anyhow::Result;
use backup_coordinator::backup::run_backup;
use backup_coordinator::cli::{self, BackupArgs};
use backup_coordinator::config::Settings;
use backup_coordinator::context::RunContext;
use backup_coordinator::database::DatabaseConnector;
use backup_coordinator::pg::PgConnector;
use clap::Parser;
use segment_helper::daemon::shutdown::ShutdownCoordinator;
use segment_helper::utils;
use std::process::ExitCode;
use std::sync::Arc;

async fn run(args: BackupArgs) -> Result<()> {
    let settings = Arc::new(Settings::load(args.common.config.as_deref())?);
    utils::logger::init(
        "gpbackup",
        args.common.log_level(&settings.log_level),
        settings.log_dir.as_deref(),
    )?;
    tracing::info!("Starting gpbackup v{}", env!("CARGO_PKG_VERSION"));

    let options = args.options()?;
    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.spawn_listener();

    let connector = PgConnector::new(&settings, options.jobs);
    let db = connector.connect(&options.dbname).await?;
    let ctx = RunContext::new(options, settings, shutdown.token());
    let result = run_backup(&ctx, db).await;
    listener.abort();

    let outcome = result?;
    tracing::info!(
        tables = outcome.tables,
        "Backup {} written to {}",
        outcome.timestamp,
        outcome.file_paths.coordinator_dir().display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(BackupArgs::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Backup failed");
            eprintln!("{}", cli::critical(&e));
            ExitCode::FAILURE
        }
    }
}
