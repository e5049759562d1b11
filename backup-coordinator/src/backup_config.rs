//! `gpbackup_<ts>_config.yaml`: how a backup set was taken.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    InProgress,
    Success,
    Failure,
}

/// Backup set holding the most recent data of some tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePlanEntry {
    pub timestamp: String,
    pub tablefqns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub backupdir: String,
    pub backupversion: String,
    pub compressed: bool,
    #[serde(default)]
    pub compressiontype: String,
    pub databasename: String,
    pub databaseversion: String,
    /// Absent in configs written before segment counts were recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentcount: Option<usize>,
    #[serde(default)]
    pub dataonly: bool,
    #[serde(default)]
    pub metadataonly: bool,
    #[serde(default)]
    pub withoutglobals: bool,
    #[serde(default)]
    pub withstatistics: bool,
    #[serde(default)]
    pub leafpartitiondata: bool,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub singledatafile: bool,
    #[serde(default)]
    pub includeschemas: Vec<String>,
    #[serde(default)]
    pub excludeschemas: Vec<String>,
    #[serde(default)]
    pub includerelations: Vec<String>,
    #[serde(default)]
    pub excluderelations: Vec<String>,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub restoreplan: Vec<RestorePlanEntry>,
    pub timestamp: String,
    #[serde(default)]
    pub endtime: String,
    pub status: BackupStatus,
}

impl BackupConfig {
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.to_yaml()?).await?;
        Ok(())
    }

    pub async fn read_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&content)
    }

    /// Scope filters of two backups match, so one can be the base of an
    /// incremental backup of the other.
    pub fn same_scope(&self, other: &BackupConfig) -> bool {
        self.databasename == other.databasename
            && self.includeschemas == other.includeschemas
            && self.excludeschemas == other.excludeschemas
            && self.includerelations == other.includerelations
            && self.excluderelations == other.excluderelations
            && self.leafpartitiondata == other.leafpartitiondata
            && self.singledatafile == other.singledatafile
            && self.compressiontype == other.compressiontype
            && self.plugin == other.plugin
            && self.backupdir == other.backupdir
    }

    /// Timestamp whose backup set holds the data of `fqn`.
    pub fn data_timestamp(&self, fqn: &str) -> Option<&str> {
        self.restoreplan
            .iter()
            .find(|entry| entry.tablefqns.iter().any(|t| t == fqn))
            .map(|entry| entry.timestamp.as_str())
    }
}

#[cfg(test)]
pub(crate) fn sample_config(timestamp: &str) -> BackupConfig {
    BackupConfig {
        backupdir: "/tmp/bk".into(),
        backupversion: env!("CARGO_PKG_VERSION").into(),
        compressed: true,
        compressiontype: "zstd".into(),
        databasename: "testdb".into(),
        databaseversion: "7.1.0".into(),
        segmentcount: Some(3),
        dataonly: false,
        metadataonly: false,
        withoutglobals: false,
        withstatistics: false,
        leafpartitiondata: true,
        incremental: false,
        singledatafile: false,
        includeschemas: vec![],
        excludeschemas: vec![],
        includerelations: vec![],
        excluderelations: vec![],
        plugin: String::new(),
        restoreplan: vec![RestorePlanEntry {
            timestamp: timestamp.into(),
            tablefqns: vec!["public.sales".into()],
        }],
        timestamp: timestamp.into(),
        endtime: String::new(),
        status: BackupStatus::Success,
    }
}
