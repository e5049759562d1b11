//! Human-readable report files written next to the TOC.

use crate::backup_config::{BackupConfig, BackupStatus};
use crate::error::Result;
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Aligned `key: value` lines.
#[derive(Debug, Default)]
struct Fields {
    lines: Vec<(String, String)>,
}

impl Fields {
    fn add(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.lines.push((key.to_string(), value.to_string()));
        self
    }

    fn render(&self, out: &mut String) {
        for (key, value) in &self.lines {
            let _ = writeln!(out, "{:<24}{}", format!("{key}:"), value);
        }
    }
}

fn duration(start: &DateTime<Local>, end: &DateTime<Local>) -> String {
    let secs = (*end - *start).num_seconds().max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

fn section(config: &BackupConfig) -> &'static str {
    match (config.metadataonly, config.dataonly) {
        (true, _) => "Metadata Only",
        (_, true) => "Data Only",
        _ => "All Sections",
    }
}

fn filtering(config: &BackupConfig) -> String {
    let mut parts = Vec::new();
    for (label, list) in [
        ("Include Schema", &config.includeschemas),
        ("Exclude Schema", &config.excludeschemas),
        ("Include Table", &config.includerelations),
        ("Exclude Table", &config.excluderelations),
    ] {
        if !list.is_empty() {
            parts.push(format!("{label} Filter"));
        }
    }
    if parts.is_empty() {
        "None".to_string()
    } else {
        parts.join(", ")
    }
}

/// Everything the backup report shows.
#[derive(Debug)]
pub struct BackupReport<'a> {
    pub config: &'a BackupConfig,
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    /// Objects in the backup by TOC object type.
    pub object_counts: BTreeMap<String, usize>,
    pub error: Option<String>,
}

impl BackupReport<'_> {
    pub fn render(&self) -> String {
        let config = self.config;
        let mut out = String::from("Backup Report\n\n");

        let mut header = Fields::default();
        header
            .add("timestamp key", &config.timestamp)
            .add("database version", &config.databaseversion)
            .add("gpbackup version", &config.backupversion);
        header.render(&mut out);
        out.push('\n');

        let mut flags = Fields::default();
        flags
            .add("database name", &config.databasename)
            .add(
                "compression",
                if config.compressed {
                    config.compressiontype.as_str()
                } else {
                    "None"
                },
            )
            .add(
                "plugin executable",
                if config.plugin.is_empty() {
                    "None"
                } else {
                    config.plugin.as_str()
                },
            )
            .add("backup section", section(config))
            .add("object filtering", filtering(config))
            .add("includes statistics", yes_no(config.withstatistics))
            .add(
                "data file format",
                if config.singledatafile {
                    "Single Data File Per Segment"
                } else {
                    "Multiple Data Files Per Segment"
                },
            )
            .add("incremental", yes_no(config.incremental));
        if config.incremental {
            if let Some(base) = config.restoreplan.first() {
                flags.add("incremental base", &base.timestamp);
            }
        }
        flags.render(&mut out);
        out.push('\n');

        let mut times = Fields::default();
        times
            .add("start time", self.start.format(TIME_FORMAT))
            .add("end time", self.end.format(TIME_FORMAT))
            .add("duration", duration(&self.start, &self.end));
        times.render(&mut out);
        out.push('\n');

        let mut status = Fields::default();
        status.add(
            "backup status",
            match config.status {
                BackupStatus::Success => "Success",
                BackupStatus::Failure => "Failure",
                BackupStatus::InProgress => "In Progress",
            },
        );
        if let Some(error) = &self.error {
            status.add("backup error", error);
        }
        if let Some(count) = config.segmentcount {
            status.add("segment count", count);
        }
        status.render(&mut out);

        if !self.object_counts.is_empty() {
            out.push_str("\ncount of database objects in backup:\n");
            let mut counts = Fields::default();
            for (objecttype, count) in &self.object_counts {
                counts.add(&objecttype.to_lowercase(), count);
            }
            counts.render(&mut out);
        }
        out
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.render()).await?;
        Ok(())
    }
}

/// Everything the restore report shows.
#[derive(Debug)]
pub struct RestoreReport {
    pub backup_timestamp: String,
    pub restore_timestamp: String,
    pub database: String,
    pub database_version: String,
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub tables_restored: usize,
    pub tables_total: usize,
    pub data_errors: usize,
    pub metadata_errors: usize,
    pub error: Option<String>,
}

impl RestoreReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.data_errors == 0 && self.metadata_errors == 0
    }

    pub fn render(&self) -> String {
        let mut out = String::from("Restore Report\n\n");

        let mut fields = Fields::default();
        fields
            .add("timestamp key", &self.backup_timestamp)
            .add("restore timestamp", &self.restore_timestamp)
            .add("database version", &self.database_version)
            .add("restore version", env!("CARGO_PKG_VERSION"))
            .add("database name", &self.database);
        fields.render(&mut out);
        out.push('\n');

        let mut times = Fields::default();
        times
            .add("start time", self.start.format(TIME_FORMAT))
            .add("end time", self.end.format(TIME_FORMAT))
            .add("duration", duration(&self.start, &self.end));
        times.render(&mut out);
        out.push('\n');

        let mut status = Fields::default();
        status
            .add(
                "restore status",
                if self.succeeded() { "Success" } else { "Failure" },
            )
            .add(
                "tables restored",
                format!("{} of {}", self.tables_restored, self.tables_total),
            );
        if self.data_errors > 0 {
            status.add("data errors", self.data_errors);
        }
        if self.metadata_errors > 0 {
            status.add("metadata errors", self.metadata_errors);
        }
        if let Some(error) = &self.error {
            status.add("restore error", error);
        }
        status.render(&mut out);
        out
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.render()).await?;
        Ok(())
    }
}

/// Write a sorted, newline-separated error-table file. Nothing is written
/// for an empty set.
pub async fn write_error_tables(path: &Path, tables: &std::collections::BTreeSet<String>) -> Result<bool> {
    if tables.is_empty() {
        return Ok(false);
    }
    let content = tables.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
    tokio::fs::write(path, content).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_config::sample_config;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn times() -> (DateTime<Local>, DateTime<Local>) {
        let start = Local.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (start, start + chrono::Duration::seconds(3725))
    }

    #[test]
    fn test_backup_report_fields() {
        let mut config = sample_config("20240101000000");
        config.includerelations = vec!["public.sales".into()];
        config.status = BackupStatus::Success;
        let (start, end) = times();
        let report = BackupReport {
            config: &config,
            start,
            end,
            object_counts: BTreeMap::from([("TABLE".to_string(), 1)]),
            error: None,
        }
        .render();

        assert!(report.contains("timestamp key:          20240101000000\n"));
        assert!(report.contains("object filtering:       Include Table Filter\n"));
        assert!(report.contains("duration:               1:02:05\n"));
        assert!(report.contains("backup status:          Success\n"));
        assert!(report.contains("segment count:          3\n"));
        assert!(report.contains("table:                  1\n"));
    }

    #[test]
    fn test_restore_report_status_follows_errors() {
        let (start, end) = times();
        let mut report = RestoreReport {
            backup_timestamp: "20240101000000".into(),
            restore_timestamp: "20240102000000".into(),
            database: "restoredb".into(),
            database_version: "7.1.0".into(),
            start,
            end,
            tables_restored: 2,
            tables_total: 3,
            data_errors: 1,
            metadata_errors: 0,
            error: None,
        };
        assert!(!report.succeeded());
        let text = report.render();
        assert!(text.contains("restore status:         Failure\n"));
        assert!(text.contains("tables restored:        2 of 3\n"));
        assert!(text.contains("data errors:            1\n"));

        report.data_errors = 0;
        assert!(report.render().contains("restore status:         Success\n"));
    }

    #[tokio::test]
    async fn test_error_tables_file_format() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gpbackup_20240101000000_error_tables_data");
        assert!(!write_error_tables(&path, &BTreeSet::new()).await.unwrap());
        assert!(!path.exists());

        let tables: BTreeSet<String> = ["public.b", "public.a", "public.b"]
            .into_iter()
            .map(String::from)
            .collect();
        assert!(write_error_tables(&path, &tables).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "public.a\npublic.b");
    }
}
