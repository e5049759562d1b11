//! Logging configuration using tracing.
//!
//! Helpers keep stdout for the event stream, so log lines go to stderr and,
//! when a log directory is configured, to a per-day `<program>_YYYYMMDD.log`.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with the specified level
pub fn init(program: &str, level: &str, log_dir: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(log_file_name(program, chrono::Local::now().date_naive()));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(())
}

pub fn log_file_name(program: &str, day: chrono::NaiveDate) -> String {
    format!("{}_{}.log", program, day.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name() {
        let day = chrono::NaiveDate::from_ymd_opt(2022, 9, 8).unwrap();
        assert_eq!(log_file_name("gpbackup_helper", day), "gpbackup_helper_20220908.log");
    }
}
