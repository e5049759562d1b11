//! Backup directory layout and file naming.
//!
//! Every artifact of a backup lives under
//! `<backup-dir>/<segprefix><content>/backups/<YYYYMMDD>/<timestamp>/`, or under
//! `<segment data dir>/backups/<YYYYMMDD>/<timestamp>/` when no backup
//! directory is given. Content `-1` is the coordinator.

use crate::timestamp::BackupTimestamp;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Placeholder the database substitutes with each segment's content id.
pub const SEGID_TOKEN: &str = "<SEGID>";

/// Placeholder the database substitutes with each segment's data directory.
pub const SEG_DATA_DIR_TOKEN: &str = "<SEG_DATA_DIR>";

pub const COORDINATOR_CONTENT: i32 = -1;

/// Paths for one backup set across the whole cluster.
#[derive(Debug, Clone)]
pub struct FilePathInfo {
    backup_dir: Option<PathBuf>,
    timestamp: BackupTimestamp,
    seg_prefix: String,
    pid: u32,
    data_dirs: BTreeMap<i32, PathBuf>,
}

impl FilePathInfo {
    pub fn new(
        timestamp: BackupTimestamp,
        backup_dir: Option<PathBuf>,
        seg_prefix: impl Into<String>,
        data_dirs: BTreeMap<i32, PathBuf>,
        pid: u32,
    ) -> Self {
        Self {
            backup_dir,
            timestamp,
            seg_prefix: seg_prefix.into(),
            pid,
            data_dirs,
        }
    }

    /// Same layout, different backup set (incremental restore plans).
    pub fn with_timestamp(&self, timestamp: BackupTimestamp) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    pub fn timestamp(&self) -> &BackupTimestamp {
        &self.timestamp
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn segment_dir(&self, content: i32) -> PathBuf {
        let root = match &self.backup_dir {
            Some(dir) => dir.join(format!("{}{}", self.seg_prefix, content)),
            None => self.data_dirs.get(&content).cloned().unwrap_or_default(),
        };
        root.join("backups")
            .join(self.timestamp.date_dir())
            .join(self.timestamp.as_str())
    }

    /// Segment directory as the database sees it from every segment: the
    /// content id becomes [`SEGID_TOKEN`], or the whole root becomes
    /// [`SEG_DATA_DIR_TOKEN`] when backups live in the data directories.
    pub fn segment_dir_template(&self) -> String {
        let root = match &self.backup_dir {
            Some(dir) => dir
                .join(format!("{}{}", self.seg_prefix, SEGID_TOKEN))
                .display()
                .to_string(),
            None => SEG_DATA_DIR_TOKEN.to_string(),
        };
        format!(
            "{}/backups/{}/{}",
            root,
            self.timestamp.date_dir(),
            self.timestamp
        )
    }

    /// Helper pipe base path with segment placeholders.
    pub fn pipe_template(&self) -> String {
        format!(
            "{}/gpbackup_{}_{}_pipe_{}",
            self.segment_dir_template(),
            SEGID_TOKEN,
            self.timestamp,
            self.pid
        )
    }

    pub fn backup_dir(&self) -> Option<&Path> {
        self.backup_dir.as_deref()
    }

    pub fn contents(&self) -> impl Iterator<Item = i32> + '_ {
        self.data_dirs.keys().copied()
    }

    pub fn segment(&self, content: i32) -> SegmentPaths {
        SegmentPaths {
            dir: self.segment_dir(content),
            content,
            timestamp: self.timestamp.clone(),
            pid: self.pid,
        }
    }

    pub fn coordinator_dir(&self) -> PathBuf {
        self.segment_dir(COORDINATOR_CONTENT)
    }

    fn coordinator_file(&self, suffix: &str) -> PathBuf {
        self.coordinator_dir()
            .join(format!("gpbackup_{}_{}", self.timestamp, suffix))
    }

    pub fn config_path(&self) -> PathBuf {
        self.coordinator_file("config.yaml")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.coordinator_file("metadata.sql")
    }

    pub fn toc_path(&self) -> PathBuf {
        self.coordinator_file("toc.yaml")
    }

    pub fn report_path(&self) -> PathBuf {
        self.coordinator_file("report")
    }

    pub fn statistics_path(&self) -> PathBuf {
        self.coordinator_file("statistics.sql")
    }

    pub fn plugin_config_path(&self) -> PathBuf {
        self.coordinator_file("plugin_config.yaml")
    }

    /// `phase` is `data` or `metadata`.
    pub fn error_tables_path(&self, phase: &str) -> PathBuf {
        self.coordinator_file(&format!("error_tables_{phase}"))
    }

    pub fn restore_report_path(&self, restore_timestamp: &BackupTimestamp) -> PathBuf {
        self.coordinator_dir().join(format!(
            "gprestore_{}_{}_report",
            self.timestamp, restore_timestamp
        ))
    }
}

/// Paths owned by the helper of one segment.
#[derive(Debug, Clone)]
pub struct SegmentPaths {
    dir: PathBuf,
    content: i32,
    timestamp: BackupTimestamp,
    pid: u32,
}

impl SegmentPaths {
    pub fn new(dir: PathBuf, content: i32, timestamp: BackupTimestamp, pid: u32) -> Self {
        Self {
            dir,
            content,
            timestamp,
            pid,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn content(&self) -> i32 {
        self.content
    }

    pub fn timestamp(&self) -> &BackupTimestamp {
        &self.timestamp
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn helper_file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!(
            "gpbackup_{}_{}_{}_{}",
            self.content, self.timestamp, suffix, self.pid
        ))
    }

    pub fn oid_file(&self) -> PathBuf {
        self.helper_file("oid")
    }

    pub fn script_file(&self) -> PathBuf {
        self.helper_file("script")
    }

    pub fn pipe(&self) -> PathBuf {
        self.helper_file("pipe")
    }

    pub fn table_pipe(&self, oid: u32, batch: usize) -> PathBuf {
        suffixed(&self.pipe(), &format!("_{oid}_{batch}"))
    }

    pub fn error_file(&self) -> PathBuf {
        suffixed(&self.pipe(), "_error")
    }

    pub fn skip_file(&self, oid: u32) -> PathBuf {
        suffixed(&self.pipe(), &format!("_skip_{oid}"))
    }

    /// Per-table data file written by `file_content`'s helper.
    pub fn table_data(&self, file_content: i32, oid: u32, extension: &str) -> PathBuf {
        self.dir.join(format!(
            "gpbackup_{}_{}_{}{}",
            file_content, self.timestamp, oid, extension
        ))
    }

    pub fn single_data(&self, file_content: i32) -> PathBuf {
        self.dir
            .join(format!("gpbackup_{}_{}", file_content, self.timestamp))
    }

    pub fn segment_toc(&self, file_content: i32) -> PathBuf {
        self.dir
            .join(format!("gpbackup_{}_{}_toc.yaml", file_content, self.timestamp))
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// `demoDataDir-1` -> `demoDataDir`, `gpseg-1` -> `gpseg`.
pub fn seg_prefix_from_data_dir(coordinator_data_dir: &Path) -> String {
    let base = coordinator_data_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    base.strip_suffix("-1").unwrap_or(&base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(backup_dir: Option<&str>) -> FilePathInfo {
        let mut dirs = BTreeMap::new();
        dirs.insert(-1, PathBuf::from("/data/demoDataDir-1"));
        dirs.insert(0, PathBuf::from("/data/demoDataDir0"));
        FilePathInfo::new(
            BackupTimestamp::parse("20190809230424").unwrap(),
            backup_dir.map(PathBuf::from),
            "demoDataDir",
            dirs,
            4242,
        )
    }

    #[test]
    fn test_layout_with_backup_dir() {
        let info = info(Some("/tmp/bk"));
        assert_eq!(
            info.toc_path(),
            PathBuf::from("/tmp/bk/demoDataDir-1/backups/20190809/20190809230424/gpbackup_20190809230424_toc.yaml")
        );
        assert_eq!(
            info.segment_dir_template(),
            "/tmp/bk/demoDataDir<SEGID>/backups/20190809/20190809230424"
        );
        assert_eq!(
            info.pipe_template(),
            "/tmp/bk/demoDataDir<SEGID>/backups/20190809/20190809230424/gpbackup_<SEGID>_20190809230424_pipe_4242"
        );
    }

    #[test]
    fn test_layout_without_backup_dir() {
        let info = info(None);
        assert_eq!(
            info.segment_dir(0),
            PathBuf::from("/data/demoDataDir0/backups/20190809/20190809230424")
        );
        assert_eq!(
            info.segment_dir_template(),
            "<SEG_DATA_DIR>/backups/20190809/20190809230424"
        );
    }

    #[test]
    fn test_helper_file_names() {
        let seg = info(None).segment(0);
        let dir = "/data/demoDataDir0/backups/20190809/20190809230424";
        assert_eq!(
            seg.oid_file(),
            PathBuf::from(format!("{dir}/gpbackup_0_20190809230424_oid_4242"))
        );
        assert_eq!(
            seg.skip_file(16384),
            PathBuf::from(format!("{dir}/gpbackup_0_20190809230424_pipe_4242_skip_16384"))
        );
        assert_eq!(
            seg.error_file(),
            PathBuf::from(format!("{dir}/gpbackup_0_20190809230424_pipe_4242_error"))
        );
        assert_eq!(
            seg.table_data(3, 16384, ".zst"),
            PathBuf::from(format!("{dir}/gpbackup_3_20190809230424_16384.zst"))
        );
    }

    #[test]
    fn test_seg_prefix() {
        assert_eq!(seg_prefix_from_data_dir(Path::new("/data/demoDataDir-1")), "demoDataDir");
        assert_eq!(seg_prefix_from_data_dir(Path::new("/data/gpseg-1")), "gpseg");
    }
}
