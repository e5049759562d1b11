use crate::error::{CoordinatorError, Result};
use segment_helper::fs::paths::{seg_prefix_from_data_dir, COORDINATOR_CONTENT};
use segment_helper::{BackupTimestamp, FilePathInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub content: i32,
    pub hostname: String,
    pub port: u16,
    pub datadir: PathBuf,
}

/// Primary segments plus the coordinator, keyed by content id. Read-only once
/// built.
#[derive(Debug, Clone)]
pub struct Cluster {
    segments: BTreeMap<i32, SegmentDescriptor>,
}

impl Cluster {
    pub fn new(descriptors: Vec<SegmentDescriptor>) -> Result<Self> {
        let segments: BTreeMap<i32, SegmentDescriptor> =
            descriptors.into_iter().map(|d| (d.content, d)).collect();
        if !segments.contains_key(&COORDINATOR_CONTENT) {
            return Err(CoordinatorError::Database(
                "segment configuration has no coordinator (content -1)".into(),
            ));
        }
        if segments.len() < 2 {
            return Err(CoordinatorError::Database(
                "segment configuration has no primary segments".into(),
            ));
        }
        Ok(Self { segments })
    }

    pub fn coordinator(&self) -> Option<&SegmentDescriptor> {
        self.segments.get(&COORDINATOR_CONTENT)
    }

    /// Primary segments in content order.
    pub fn primaries(&self) -> impl Iterator<Item = &SegmentDescriptor> {
        self.segments.values().filter(|d| d.content >= 0)
    }

    pub fn segment(&self, content: i32) -> Option<&SegmentDescriptor> {
        self.segments.get(&content)
    }

    pub fn segment_count(&self) -> usize {
        self.primaries().count()
    }

    pub fn contents(&self) -> Vec<i32> {
        self.primaries().map(|d| d.content).collect()
    }

    pub fn data_dirs(&self) -> BTreeMap<i32, PathBuf> {
        self.segments
            .iter()
            .map(|(c, d)| (*c, d.datadir.clone()))
            .collect()
    }

    pub fn seg_prefix(&self) -> String {
        self.coordinator()
            .map(|d| seg_prefix_from_data_dir(&d.datadir))
            .unwrap_or_else(|| "gpseg".into())
    }

    pub fn file_paths(
        &self,
        timestamp: BackupTimestamp,
        backup_dir: Option<PathBuf>,
        pid: u32,
    ) -> FilePathInfo {
        FilePathInfo::new(timestamp, backup_dir, self.seg_prefix(), self.data_dirs(), pid)
    }
}

#[cfg(test)]
pub(crate) fn descriptors(root: &std::path::Path, primaries: usize) -> Vec<SegmentDescriptor> {
    (-1..primaries as i32)
        .map(|content| SegmentDescriptor {
            content,
            hostname: "localhost".into(),
            port: 6000 + (content + 1) as u16,
            datadir: root.join(format!("demoDataDir{content}")),
        })
        .collect()
}
