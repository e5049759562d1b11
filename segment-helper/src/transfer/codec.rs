//! Table data compression.

use crate::utils::errors::{HelperError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl Compression {
    /// From the `compressiontype` recorded in a backup config.
    pub fn from_type(compression_type: &str, level: i32) -> Result<Self> {
        match compression_type {
            "" | "none" => Ok(Compression::None),
            "zstd" => Ok(Compression::Zstd { level }),
            other => Err(HelperError::Compression(format!(
                "unsupported compression type {other}"
            ))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd { .. } => "zstd",
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, Compression::None)
    }

    /// Suffix of per-table data files.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Zstd { .. } => ".zst",
        }
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd { level } => {
                zstd::encode_all(data, *level).map_err(|e| HelperError::Compression(e.to_string()))
            }
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zstd { .. } => {
                zstd::decode_all(data).map_err(|e| HelperError::Compression(e.to_string()))
            }
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => f.write_str("none"),
            Compression::Zstd { level } => write!(f, "zstd:{level}"),
        }
    }
}

/// `none`, `zstd` or `zstd:<level>`.
impl FromStr for Compression {
    type Err = HelperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("zstd", level)) => {
                let level = level
                    .parse()
                    .map_err(|_| HelperError::Compression(format!("bad zstd level {level}")))?;
                Ok(Compression::Zstd { level })
            }
            Some(_) => Err(HelperError::Compression(format!("unsupported compression {s}"))),
            None => Compression::from_type(s, DEFAULT_ZSTD_LEVEL),
        }
    }
}
