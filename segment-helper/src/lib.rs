//! Segment Helper Library
//!
//! Per-segment side of a backup or restore: backup directory layout, the
//! segment pipe protocol, the segment table of contents and the helper that
//! streams one segment's table data.

pub mod config;
pub mod daemon;
pub mod events;
pub mod executor;
pub mod fs;
pub mod pipe;
pub mod protocol;
pub mod segment_toc;
pub mod state;
pub mod timestamp;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::HelperConfig;
pub use events::{EventSink, HelperEvent};
pub use executor::{Direction, Helper, HelperJob, HelperSummary};
pub use fs::paths::{FilePathInfo, SegmentPaths};
pub use timestamp::BackupTimestamp;
pub use utils::errors::HelperError;
pub type Result<T> = std::result::Result<T, HelperError>;
