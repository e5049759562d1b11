//! Where backup files live after a backup and come from before a restore.
//!
//! Files are always written to and read from the backup directory layout.
//! A storage plugin additionally pushes each finished file out (`put`) and
//! pulls it back before a restore reads it (`get`).

use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn put(&self, path: &Path) -> Result<()>;

    async fn get(&self, path: &Path) -> Result<()>;

    fn name(&self) -> &str;
}

/// Files stay in the backup directory.
pub struct LocalStorage;

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn put(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        ""
    }
}

/// `--plugin-config` file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub executablepath: PathBuf,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl PluginConfig {
    pub async fn read_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CoordinatorError::Storage(format!("{}: {}", path.display(), e)))?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// Runs `<executable> backup_file|restore_file <config> <path>` per file.
pub struct PluginStorage {
    config: PluginConfig,
    config_path: PathBuf,
    name: String,
}

impl PluginStorage {
    pub async fn from_config_file(config_path: &Path) -> Result<Self> {
        let config = PluginConfig::read_from(config_path).await?;
        let name = config
            .executablepath
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self {
            config,
            config_path: config_path.to_path_buf(),
            name,
        })
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    async fn run(&self, action: &str, path: &Path) -> Result<()> {
        debug!(plugin = %self.name, action, path = %path.display(), "Running storage plugin");
        let output = tokio::process::Command::new(&self.config.executablepath)
            .arg(action)
            .arg(&self.config_path)
            .arg(path)
            .output()
            .await
            .map_err(|e| {
                CoordinatorError::Storage(format!(
                    "cannot run {}: {}",
                    self.config.executablepath.display(),
                    e
                ))
            })?;
        if !output.status.success() {
            return Err(CoordinatorError::Storage(format!(
                "{} {} {} failed: {}",
                self.name,
                action,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for PluginStorage {
    async fn put(&self, path: &Path) -> Result<()> {
        self.run("backup_file", path).await
    }

    async fn get(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.run("restore_file", path).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub async fn open(plugin_config: Option<&Path>) -> Result<Box<dyn StorageBackend>> {
    match plugin_config {
        Some(path) => Ok(Box::new(PluginStorage::from_config_file(path).await?)),
        None => Ok(Box::new(LocalStorage)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Plugin that copies files into `store` by base name.
    fn write_plugin(dir: &Path, store: &Path) -> PathBuf {
        let script = dir.join("copy_plugin.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nset -e\ncase \"$1\" in\n  backup_file) cp \"$3\" \"{store}/$(basename \"$3\")\" ;;\n  restore_file) cp \"{store}/$(basename \"$3\")\" \"$3\" ;;\n  *) exit 2 ;;\nesac\n",
                store = store.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[tokio::test]
    async fn test_plugin_put_then_get() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("store");
        std::fs::create_dir(&store).unwrap();
        let plugin = write_plugin(dir.path(), &store);
        let config_path = dir.path().join("plugin.yaml");
        std::fs::write(
            &config_path,
            format!("executablepath: {}\noptions:\n  bucket: b1\n", plugin.display()),
        )
        .unwrap();

        let storage = open(Some(&config_path)).await.unwrap();
        assert_eq!(storage.name(), "copy_plugin.sh");

        let file = dir.path().join("gpbackup_20240101000000_toc.yaml");
        std::fs::write(&file, "dataentries: []\n").unwrap();
        storage.put(&file).await.unwrap();
        std::fs::remove_file(&file).unwrap();

        storage.get(&file).await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "dataentries: []\n");
    }

    #[tokio::test]
    async fn test_plugin_failure_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("store");
        std::fs::create_dir(&store).unwrap();
        let plugin = write_plugin(dir.path(), &store);
        let config_path = dir.path().join("plugin.yaml");
        std::fs::write(&config_path, format!("executablepath: {}\n", plugin.display())).unwrap();

        let storage = open(Some(&config_path)).await.unwrap();
        let err = storage.get(&dir.path().join("never_backed_up")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Storage(_)));
    }

    #[tokio::test]
    async fn test_local_storage_is_noop() {
        let storage = open(None).await.unwrap();
        storage.put(Path::new("/nonexistent")).await.unwrap();
        storage.get(Path::new("/nonexistent")).await.unwrap();
    }
}
