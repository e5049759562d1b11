//! Utility modules for the segment helper.

pub mod errors;
pub mod logger;

pub use errors::{HelperError, Result};
