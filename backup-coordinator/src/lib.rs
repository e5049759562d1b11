//! Backup Coordinator Library
//!
//! Coordinator side of `gpbackup` and `gprestore`: scope selection, the table
//! of contents, helper supervision, cluster resize mapping and the backup and
//! restore orchestration built on them.

pub mod backup;
pub mod backup_config;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod helpers;
pub mod history;
pub mod pg;
pub mod postdata;
pub mod report;
pub mod resize;
pub mod restore;
pub mod scope;
pub mod storage;
pub mod toc;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{BackupOptions, RestoreOptions, RunContext};
pub use error::{CoordinatorError, Result};
