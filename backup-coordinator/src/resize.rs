//! Mapping a backup's source segments onto the destination cluster.
//!
//! Destination `d` restores every source `s` with `s % M == d`, one batch per
//! source: batch `b` reads source `d + b*M`. Destinations with fewer sources
//! than `ceil(N/M)` get empty batches so every destination runs the same
//! number of batches per table. Replicated tables hold a full copy on every
//! source, so each destination reads one copy from source `d % N`.

use crate::error::{CoordinatorError, Result};
use segment_helper::protocol::{OidEntry, EMPTY_SOURCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMapping {
    source_count: usize,
    dest_count: usize,
}

impl SegmentMapping {
    /// Check the backup's segment count against the destination cluster.
    /// Runs before any data moves.
    pub fn resolve(
        backup_count: Option<usize>,
        dest_count: usize,
        resize_cluster: bool,
        timestamp: &str,
    ) -> Result<Self> {
        match backup_count {
            None if resize_cluster => Err(CoordinatorError::SegmentCountUnknown(timestamp.to_string())),
            // Configs without a segment count predate resize support and were
            // always restored onto a same-sized cluster.
            None => Ok(Self::identity(dest_count)),
            Some(n) if n != dest_count && !resize_cluster => {
                Err(CoordinatorError::SegmentCountMismatch {
                    backup: n,
                    current: dest_count,
                })
            }
            Some(n) => Ok(Self {
                source_count: n,
                dest_count,
            }),
        }
    }

    pub fn identity(count: usize) -> Self {
        Self {
            source_count: count,
            dest_count: count,
        }
    }

    pub fn source_count(&self) -> usize {
        self.source_count
    }

    pub fn dest_count(&self) -> usize {
        self.dest_count
    }

    pub fn is_resize(&self) -> bool {
        self.source_count != self.dest_count
    }

    pub fn batch_count(&self, replicated: bool) -> usize {
        if replicated || self.dest_count == 0 {
            1
        } else {
            self.source_count.div_ceil(self.dest_count)
        }
    }

    /// Oid file entries for one table on destination `dest`.
    pub fn entries(&self, oid: u32, dest: i32, replicated: bool) -> Vec<OidEntry> {
        let d = dest as usize;
        if replicated {
            let source = if self.source_count == 0 {
                EMPTY_SOURCE
            } else {
                (d % self.source_count) as i32
            };
            return vec![OidEntry::new(oid, 0, source)];
        }
        (0..self.batch_count(false))
            .map(|batch| {
                let s = d + batch * self.dest_count;
                let source = if s < self.source_count {
                    s as i32
                } else {
                    EMPTY_SOURCE
                };
                OidEntry::new(oid, batch, source)
            })
            .collect()
    }

    /// Source segments any destination reads from.
    pub fn sources(&self) -> impl Iterator<Item = i32> {
        0..self.source_count as i32
    }
}
