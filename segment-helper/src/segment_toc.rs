//! Per-segment table of contents for single-data-file backups.
//!
//! Maps each table oid to the `[startbyte, endbyte)` range its (possibly
//! compressed) data occupies inside the segment's data file.

use crate::utils::errors::{HelperError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDataEntry {
    pub startbyte: u64,
    pub endbyte: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentToc {
    pub dataentries: BTreeMap<u32, SegmentDataEntry>,
}

impl SegmentToc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, oid: u32, startbyte: u64, endbyte: u64) {
        self.dataentries
            .insert(oid, SegmentDataEntry { startbyte, endbyte });
    }

    pub fn entry(&self, oid: u32) -> Result<SegmentDataEntry> {
        self.dataentries
            .get(&oid)
            .copied()
            .ok_or(HelperError::MissingTocEntry(oid))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| HelperError::CorruptToc(e.to_string()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let toc: SegmentToc =
            serde_yaml::from_str(content).map_err(|e| HelperError::CorruptToc(e.to_string()))?;
        for (oid, entry) in &toc.dataentries {
            if entry.endbyte < entry.startbyte {
                return Err(HelperError::CorruptToc(format!(
                    "entry {oid} ends at {} before it starts at {}",
                    entry.endbyte, entry.startbyte
                )));
            }
        }
        Ok(toc)
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.to_yaml()?).await?;
        Ok(())
    }

    pub async fn read_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&content)
    }
}
