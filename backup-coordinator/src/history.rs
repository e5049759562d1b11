//! Backup history database (`gpbackup_history.db`).
//!
//! One row per backup, holding its config and final status. An incremental
//! backup asks it for the newest successful backup taken with the same scope.

use crate::backup_config::{BackupConfig, BackupStatus};
use crate::error::{CoordinatorError, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

pub type HistoryPool = Pool<SqliteConnectionManager>;

pub const HISTORY_FILE: &str = "gpbackup_history.db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backups (
  timestamp TEXT PRIMARY KEY,
  database_name TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'inprogress' CHECK(status IN ('inprogress','success','failure')),
  incremental INTEGER NOT NULL DEFAULT 0,
  segment_count INTEGER,
  config TEXT NOT NULL,
  end_time TEXT
);

CREATE INDEX IF NOT EXISTS idx_backups_database ON backups(database_name, timestamp DESC);
"#;

pub fn create_pool(path: &Path) -> Result<HistoryPool> {
    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::builder().max_size(2).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch(
        "PRAGMA journal_mode = DELETE;
         PRAGMA synchronous = FULL;",
    )?;
    Ok(pool)
}

pub fn migrate(pool: &HistoryPool) -> Result<()> {
    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn status_str(status: BackupStatus) -> &'static str {
    match status {
        BackupStatus::InProgress => "inprogress",
        BackupStatus::Success => "success",
        BackupStatus::Failure => "failure",
    }
}

fn row_to_config(row: &Row) -> rusqlite::Result<String> {
    row.get("config")
}

fn parse(json: String) -> Result<BackupConfig> {
    serde_json::from_str(&json)
        .map_err(|e| CoordinatorError::History(format!("stored config is unreadable: {e}")))
}

pub fn insert(conn: &Connection, config: &BackupConfig) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO backups (timestamp, database_name, status, incremental, segment_count, config, end_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            config.timestamp,
            config.databasename,
            status_str(config.status),
            config.incremental,
            config.segmentcount.map(|c| c as i64),
            serde_json::to_string(config)?,
            (!config.endtime.is_empty()).then_some(config.endtime.as_str()),
        ],
    )?;
    Ok(())
}

pub fn find_by_timestamp(conn: &Connection, timestamp: &str) -> Result<Option<BackupConfig>> {
    let json = conn
        .query_row(
            "SELECT config FROM backups WHERE timestamp = ?",
            params![timestamp],
            row_to_config,
        )
        .optional()?;
    json.map(parse).transpose()
}

/// Newest successful backup `config` can build on incrementally.
pub fn find_latest_compatible(conn: &Connection, config: &BackupConfig) -> Result<Option<BackupConfig>> {
    let mut stmt = conn.prepare(
        "SELECT config FROM backups WHERE database_name = ? AND status = 'success' AND timestamp < ?
         ORDER BY timestamp DESC",
    )?;
    let rows = stmt.query_map(params![config.databasename, config.timestamp], row_to_config)?;
    for json in rows {
        let candidate = parse(json?)?;
        if !candidate.metadataonly && candidate.same_scope(config) {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Async handle over the history pool.
#[derive(Clone)]
pub struct History {
    pool: HistoryPool,
}

impl History {
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let pool = tokio::task::spawn_blocking(move || -> Result<HistoryPool> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let pool = create_pool(&path)?;
            migrate(&pool)?;
            Ok(pool)
        })
        .await
        .map_err(|e| CoordinatorError::History(e.to_string()))??;
        Ok(Self { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| CoordinatorError::History(e.to_string()))?
    }

    pub async fn record(&self, config: &BackupConfig) -> Result<()> {
        let config = config.clone();
        self.with_conn(move |conn| insert(conn, &config)).await
    }

    pub async fn find(&self, timestamp: &str) -> Result<Option<BackupConfig>> {
        let timestamp = timestamp.to_string();
        self.with_conn(move |conn| find_by_timestamp(conn, &timestamp))
            .await
    }

    pub async fn latest_compatible(&self, config: &BackupConfig) -> Result<Option<BackupConfig>> {
        let config = config.clone();
        self.with_conn(move |conn| find_latest_compatible(conn, &config))
            .await
    }
}
