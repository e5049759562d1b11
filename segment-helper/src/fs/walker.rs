//! Directory scans over a backup directory.
//!
//! Used to find the helper artifacts (oid, script, pipe, error and skip files)
//! a run leaves behind, and to enumerate the data files of a backup set.

use crate::timestamp::BackupTimestamp;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Helper-owned file categories that must not outlive a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    OidFile,
    ScriptFile,
    Pipe,
    ErrorFile,
    SkipFile,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
}

/// A backup file found in a segment directory.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

/// Classify a file name as a helper artifact of `timestamp`.
pub fn classify(file_name: &str, timestamp: &BackupTimestamp) -> Option<ArtifactKind> {
    let rest = file_name.strip_prefix("gpbackup_")?;
    let (_content, rest) = rest.split_once('_')?;
    let rest = rest.strip_prefix(timestamp.as_str())?.strip_prefix('_')?;

    if rest.starts_with("oid_") {
        return Some(ArtifactKind::OidFile);
    }
    if rest.starts_with("script_") {
        return Some(ArtifactKind::ScriptFile);
    }
    let after_pipe = rest.strip_prefix("pipe_")?;
    let tail = after_pipe.trim_start_matches(|c: char| c.is_ascii_digit());
    if tail.starts_with("_error") {
        Some(ArtifactKind::ErrorFile)
    } else if tail.starts_with("_skip_") {
        Some(ArtifactKind::SkipFile)
    } else {
        Some(ArtifactKind::Pipe)
    }
}

fn top_level_files(dir: &Path) -> impl Iterator<Item = DirEntry> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
}

/// All helper artifacts of `timestamp` in `dir`. A missing directory has none.
pub fn find_helper_artifacts(dir: &Path, timestamp: &BackupTimestamp) -> Vec<Artifact> {
    if !dir.exists() {
        return Vec::new();
    }
    top_level_files(dir)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy();
            classify(&name, timestamp).map(|kind| Artifact {
                path: entry.path().to_path_buf(),
                kind,
            })
        })
        .collect()
}

/// Remove every helper artifact of `timestamp` in `dir`, returning how many
/// were removed.
pub fn remove_helper_artifacts(dir: &Path, timestamp: &BackupTimestamp) -> std::io::Result<usize> {
    let mut removed = 0;
    for artifact in find_helper_artifacts(dir, timestamp) {
        match std::fs::remove_file(&artifact.path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Backup files of `timestamp` in `dir` that are not helper artifacts.
pub fn list_backup_files(dir: &Path, timestamp: &BackupTimestamp) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in top_level_files(dir) {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.contains(timestamp.as_str()) || classify(&name, timestamp).is_some() {
            continue;
        }
        let metadata = entry.metadata().map_err(std::io::Error::other)?;
        files.push(FileInfo {
            path: entry.path().to_path_buf(),
            size: metadata.len(),
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
