//! Control files shared by the coordinator and a segment helper.
//!
//! The oid file assigns work, one `oid,batch,source_content` line per handoff
//! in processing order. The script file carries the COPY command the database
//! runs for each table. The error file collects table failures.

use crate::fs::paths::COORDINATOR_CONTENT;
use crate::utils::errors::{HelperError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Source content of a batch with no backing data file.
pub const EMPTY_SOURCE: i32 = COORDINATOR_CONTENT;

/// One unit of helper work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OidEntry {
    pub oid: u32,
    pub batch: usize,
    /// Segment whose backup data feeds this batch; [`EMPTY_SOURCE`] for none.
    pub source_content: i32,
}

impl OidEntry {
    pub fn new(oid: u32, batch: usize, source_content: i32) -> Self {
        Self {
            oid,
            batch,
            source_content,
        }
    }

    pub fn has_data(&self) -> bool {
        self.source_content != EMPTY_SOURCE
    }
}

pub fn format_oid_file(entries: &[OidEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{},{},{}\n", e.oid, e.batch, e.source_content))
        .collect()
}

pub fn parse_oid_file(content: &str) -> Result<Vec<OidEntry>> {
    let mut entries = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let invalid = |reason: &str| HelperError::InvalidOidFile {
            line: idx + 1,
            reason: reason.to_string(),
        };
        let fields: Vec<&str> = line.split(',').collect();
        let entry = match fields.as_slice() {
            [oid, batch, source] => OidEntry::new(
                oid.parse().map_err(|_| invalid("bad oid"))?,
                batch.parse().map_err(|_| invalid("bad batch"))?,
                source.parse().map_err(|_| invalid("bad source content"))?,
            ),
            _ => return Err(invalid("expected oid,batch,source_content")),
        };
        entries.push(entry);
    }
    Ok(entries)
}

pub async fn write_oid_file(path: &Path, entries: &[OidEntry]) -> Result<()> {
    tokio::fs::write(path, format_oid_file(entries)).await?;
    Ok(())
}

pub async fn read_oid_file(path: &Path) -> Result<Vec<OidEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_oid_file(&content)
}

/// COPY command for one table, as the database will run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub oid: u32,
    pub table: String,
    pub command: String,
}

pub async fn write_script_file(path: &Path, entries: &[ScriptEntry]) -> Result<()> {
    let yaml = serde_yaml::to_string(entries).map_err(|e| HelperError::InvalidScript(e.to_string()))?;
    tokio::fs::write(path, yaml).await?;
    Ok(())
}

pub async fn read_script_file(path: &Path) -> Result<Vec<ScriptEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    serde_yaml::from_str(&content).map_err(|e| HelperError::InvalidScript(e.to_string()))
}

/// Append a failure line to the error file, creating it on first use.
pub fn append_error(path: &Path, oid: u32, message: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{oid}: {}", message.replace('\n', " "))?;
    Ok(())
}

/// Failures recorded in an error file; empty when the file does not exist.
pub fn read_errors(path: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}
