//! Table data encoding and progress reporting.

pub mod codec;
pub mod progress;
