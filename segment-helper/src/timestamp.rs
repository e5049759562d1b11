//! Backup timestamps: the 14-digit key every backup artifact is named by.

use crate::utils::errors::{HelperError, Result};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const FORMAT: &str = "%Y%m%d%H%M%S";

/// `YYYYMMDDHHMMSS`, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackupTimestamp(String);

impl BackupTimestamp {
    pub fn now() -> Self {
        Self(Local::now().format(FORMAT).to_string())
    }

    pub fn parse(value: &str) -> Result<Self> {
        if value.len() != 14 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(HelperError::InvalidTimestamp(value.to_string()));
        }
        NaiveDateTime::parse_from_str(value, FORMAT)
            .map_err(|_| HelperError::InvalidTimestamp(value.to_string()))?;
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `YYYYMMDD` directory level of the backup layout.
    pub fn date_dir(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for BackupTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BackupTimestamp {
    type Err = HelperError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BackupTimestamp {
    type Error = HelperError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BackupTimestamp> for String {
    fn from(ts: BackupTimestamp) -> Self {
        ts.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let ts = BackupTimestamp::parse("20190809230424").unwrap();
        assert_eq!(ts.date_dir(), "20190809");
        assert_eq!(ts.to_string(), "20190809230424");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(BackupTimestamp::parse("2019080923042").is_err());
        assert!(BackupTimestamp::parse("2019080923042x").is_err());
        assert!(BackupTimestamp::parse("20191309230424").is_err());
    }

    #[test]
    fn test_now_round_trips() {
        let ts = BackupTimestamp::now();
        assert_eq!(BackupTimestamp::parse(ts.as_str()).unwrap(), ts);
    }
}
