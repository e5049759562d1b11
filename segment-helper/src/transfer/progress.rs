//! Table-level progress tracking for data passes.
//!
//! Produces the `table X of Y` lines printed while tables are backed up or
//! restored, and a closing summary.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TableProgress {
    pub total_tables: usize,

    /// Tables finished so far
    pub tables_processed: usize,

    pub rows: u64,

    /// Last table finished
    pub current_table: Option<String>,
}

impl TableProgress {
    pub fn new(total_tables: usize) -> Self {
        Self {
            total_tables,
            tables_processed: 0,
            rows: 0,
            current_table: None,
        }
    }

    /// Percentage complete (0-100)
    pub fn percent_complete(&self) -> f64 {
        if self.total_tables == 0 {
            100.0
        } else {
            (self.tables_processed as f64 / self.total_tables as f64) * 100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.tables_processed >= self.total_tables
    }
}

pub struct ProgressTracker {
    start_time: Instant,
    progress: TableProgress,
}

impl ProgressTracker {
    pub fn new(total_tables: usize) -> Self {
        Self {
            start_time: Instant::now(),
            progress: TableProgress::new(total_tables),
        }
    }

    /// Record a finished table and return its progress line.
    pub fn table_rows(&mut self, table: &str, rows: u64) -> String {
        self.progress.tables_processed += 1;
        self.progress.rows += rows;
        self.progress.current_table = Some(table.to_string());
        format!(
            "table {} of {}: {} ({} rows)",
            self.progress.tables_processed, self.progress.total_tables, table, rows
        )
    }

    /// Summary line once the pass ends.
    pub fn summary(&self) -> String {
        format!(
            "{} of {} tables, {} rows in {}",
            self.progress.tables_processed,
            self.progress.total_tables,
            self.progress.rows,
            format_duration(self.elapsed().as_secs()),
        )
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn progress(&self) -> &TableProgress {
        &self.progress
    }
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
