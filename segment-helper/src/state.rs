//! Per-table helper state machine.
//!
//! `Idle -> Assigned -> Streaming -> {Done, Failed, Skipped}`. A table may
//! also be skipped or fail straight from `Assigned`, before any data moved.

use crate::utils::errors::{HelperError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableState {
    Idle,
    Assigned,
    Streaming,
    Done,
    Failed,
    Skipped,
}

impl TableState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableState::Idle => "idle",
            TableState::Assigned => "assigned",
            TableState::Streaming => "streaming",
            TableState::Done => "done",
            TableState::Failed => "failed",
            TableState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TableState::Done | TableState::Failed | TableState::Skipped)
    }

    pub fn can_transition(&self, to: TableState) -> bool {
        use TableState::*;
        matches!(
            (self, to),
            (Idle, Assigned)
                | (Assigned, Streaming)
                | (Assigned, Skipped)
                | (Assigned, Failed)
                | (Streaming, Done)
                | (Streaming, Failed)
                | (Streaming, Skipped)
        )
    }

    /// Move to `to`, rejecting transitions the machine does not allow.
    pub fn transition(self, oid: u32, to: TableState) -> Result<TableState> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(HelperError::InvalidTransition {
                oid,
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}
