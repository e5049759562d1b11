//! gprestore - restore a backup set onto a cluster

use anyhow::Result;
use backup_coordinator::cli::{self, RestoreArgs};
use backup_coordinator::config::Settings;
use backup_coordinator::context::RunContext;
use backup_coordinator::pg::PgConnector;
use backup_coordinator::restore::run_restore;
use clap::Parser;
use segment_helper::daemon::shutdown::ShutdownCoordinator;
use segment_helper::utils;
use std::process::ExitCode;
use std::sync::Arc;

async fn run(args: RestoreArgs) -> Result<()> {
    let settings = Arc::new(Settings::load(args.common.config.as_deref())?);
    utils::logger::init(
        "gprestore",
        args.common.log_level(&settings.log_level),
        settings.log_dir.as_deref(),
    )?;
    tracing::info!("Starting gprestore v{}", env!("CARGO_PKG_VERSION"));

    let options = args.options()?;
    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.spawn_listener();

    let connector = PgConnector::new(&settings, options.jobs);
    let ctx = RunContext::new(options, settings, shutdown.token());
    let result = run_restore(&ctx, &connector).await;
    listener.abort();

    let summary = result?;
    tracing::info!(
        database = %summary.database,
        "Restored {} of {} tables",
        summary.tables_restored,
        summary.tables_total
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(RestoreArgs::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Restore failed");
            eprintln!("{}", cli::critical(&e));
            ExitCode::FAILURE
        }
    }
}
