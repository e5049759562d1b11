//! Events a helper reports to the coordinator.
//!
//! Process helpers write one JSON object per line on stdout; in-process
//! helpers send the same values over a channel.

use serde::{Deserialize, Serialize};
use std::io::Write;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum HelperEvent {
    #[serde(rename = "helper:started")]
    Started { content: i32, tables: usize },

    #[serde(rename = "table:started")]
    TableStarted { content: i32, oid: u32 },

    /// Every batch of the table has been handed off.
    #[serde(rename = "table:done")]
    TableDone { content: i32, oid: u32, bytes: u64 },

    #[serde(rename = "table:skipped")]
    TableSkipped { content: i32, oid: u32 },

    #[serde(rename = "table:failed")]
    TableFailed {
        content: i32,
        oid: u32,
        error: String,
    },

    #[serde(rename = "helper:heartbeat")]
    Heartbeat { content: i32 },

    #[serde(rename = "helper:finished")]
    Finished {
        content: i32,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl HelperEvent {
    pub fn content(&self) -> i32 {
        match self {
            HelperEvent::Started { content, .. }
            | HelperEvent::TableStarted { content, .. }
            | HelperEvent::TableDone { content, .. }
            | HelperEvent::TableSkipped { content, .. }
            | HelperEvent::TableFailed { content, .. }
            | HelperEvent::Heartbeat { content }
            | HelperEvent::Finished { content, .. } => *content,
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse one stdout line. Lines that are not events are ignored.
    pub fn from_line(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

/// Where a helper sends its events.
#[derive(Debug, Clone)]
pub enum EventSink {
    Channel(mpsc::UnboundedSender<HelperEvent>),
    Stdout,
}

impl EventSink {
    pub fn emit(&self, event: HelperEvent) {
        match self {
            EventSink::Channel(tx) => {
                // The coordinator dropping its receiver means the run is over.
                let _ = tx.send(event);
            }
            EventSink::Stdout => match event.to_line() {
                Ok(line) => {
                    let mut out = std::io::stdout().lock();
                    if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
                        warn!("Failed to write helper event: {}", e);
                    }
                }
                Err(e) => warn!("Failed to serialize helper event: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let event = HelperEvent::TableDone {
            content: 1,
            oid: 16384,
            bytes: 42,
        };
        let line = event.to_line().unwrap();
        assert!(line.starts_with(r#"{"type":"table:done","payload":{"#));
        assert_eq!(HelperEvent::from_line(&line), Some(event));
    }

    #[test]
    fn test_from_line_ignores_noise() {
        assert_eq!(HelperEvent::from_line("not json"), None);
        assert_eq!(
            HelperEvent::from_line(r#"{"type":"helper:heartbeat","payload":{"content":3}}"#)
                .map(|e| e.content()),
            Some(3)
        );
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::Channel(tx);
        sink.emit(HelperEvent::Heartbeat { content: 0 });
        assert_eq!(rx.recv().await, Some(HelperEvent::Heartbeat { content: 0 }));
    }
}
