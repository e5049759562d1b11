//! Custom error types for the segment helper.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid timestamp {0}: expected 14 digits in YYYYMMDDHHMMSS form")]
    InvalidTimestamp(String),

    #[error("Corrupt segment table of contents: {0}")]
    CorruptToc(String),

    #[error("No data entry for table oid {0} in segment table of contents")]
    MissingTocEntry(u32),

    #[error("Invalid oid file line {line}: {reason}")]
    InvalidOidFile { line: usize, reason: String },

    #[error("Invalid script file: {0}")]
    InvalidScript(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Table oid {oid} cannot move from {from} to {to}")]
    InvalidTransition {
        oid: u32,
        from: &'static str,
        to: &'static str,
    },

    #[error("Helper cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, HelperError>;
