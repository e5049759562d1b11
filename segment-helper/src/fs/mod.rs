//! Backup directory layout and scans.

pub mod paths;
pub mod walker;
