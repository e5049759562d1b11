//! gpbackup_helper - per-segment helper entry point
//!
//! Started by the coordinator on each segment host. Reports events as JSON
//! lines on stdout and logs to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use segment_helper::config::HelperConfig;
use segment_helper::daemon::shutdown::ShutdownCoordinator;
use segment_helper::executor::{self, Direction, Helper, HelperJob};
use segment_helper::pipe::SkipSignal;
use segment_helper::transfer::codec::Compression;
use segment_helper::{protocol, utils, BackupTimestamp, EventSink, HelperError, SegmentPaths};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Whether this helper backs up or restores table data
    #[arg(long, value_enum)]
    direction: Direction,

    /// Content id of the segment this helper serves
    #[arg(long, allow_negative_numbers = true)]
    content: i32,

    /// Backup timestamp
    #[arg(long)]
    timestamp: String,

    /// Segment backup directory holding the control files
    #[arg(long, value_name = "DIR")]
    dir: PathBuf,

    /// Coordinator process id used in control file names
    #[arg(long)]
    pid: u32,

    /// Backup directory of a source segment, as CONTENT=DIR (restore only)
    #[arg(long = "source-dir", value_parser = parse_source_dir)]
    source_dirs: Vec<(i32, PathBuf)>,

    /// none, zstd or zstd:<level>
    #[arg(long, default_value = "zstd")]
    compression: Compression,

    #[arg(long)]
    single_data_file: bool,

    #[arg(long)]
    on_error_continue: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

fn parse_source_dir(value: &str) -> std::result::Result<(i32, PathBuf), String> {
    let (content, dir) = value
        .split_once('=')
        .ok_or_else(|| format!("expected CONTENT=DIR, got {value}"))?;
    let content = content
        .parse()
        .map_err(|_| format!("bad content id in {value}"))?;
    Ok((content, PathBuf::from(dir)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => HelperConfig::from_file(path)?,
        None => HelperConfig::default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init("gpbackup_helper", log_level, config.log.dir.as_deref())?;

    let timestamp = BackupTimestamp::parse(&args.timestamp)?;
    let paths = SegmentPaths::new(args.dir.clone(), args.content, timestamp, args.pid);

    tracing::info!(
        "Starting gpbackup_helper v{} for segment {} ({:?})",
        env!("CARGO_PKG_VERSION"),
        args.content,
        args.direction
    );

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.spawn_listener();

    let mut source_dirs: BTreeMap<i32, PathBuf> = args.source_dirs.into_iter().collect();
    source_dirs.entry(args.content).or_insert_with(|| args.dir.clone());

    let job = HelperJob {
        direction: args.direction,
        paths: paths.clone(),
        source_dirs,
        compression: args.compression,
        single_data_file: args.single_data_file,
        on_error_continue: args.on_error_continue,
    };
    let helper = Helper::new(
        job,
        &config.pipe,
        SkipSignal::new(),
        EventSink::Stdout,
        shutdown.token(),
    );

    let result = helper.run().await;
    listener.abort();

    match result {
        Ok(_) => Ok(()),
        Err(HelperError::Cancelled) => {
            let entries = protocol::read_oid_file(&paths.oid_file())
                .await
                .unwrap_or_default();
            executor::remove_unconsumed(&paths, &entries).await;
            Err(HelperError::Cancelled).context("helper interrupted")
        }
        Err(e) => Err(e.into()),
    }
}
