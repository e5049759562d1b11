//! The database the coordinator backs up from and restores into.
//!
//! Catalog reads, DDL text and bulk data transfer all come from this
//! collaborator. Data moves per table through the handoff files of a
//! [`PipeSet`]: on backup the database publishes one file per segment, on
//! restore it consumes every batch the helpers publish.

use crate::cluster::SegmentDescriptor;
use crate::error::{CoordinatorError, Result};
use crate::toc::{AoEntry, Section};
use async_trait::async_trait;
use segment_helper::pipe::{self, SkipWatcher, WaitOutcome};
use segment_helper::SegmentPaths;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    pub attributes: Vec<String>,
    /// Qualified root for leaf partitions.
    pub partition_root: Option<String>,
    pub is_partition_parent: bool,
    pub is_replicated: bool,
    pub is_append_optimized: bool,
}

impl Relation {
    pub fn fqn(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn attribute_string(&self) -> String {
        if self.attributes.is_empty() {
            String::new()
        } else {
            format!("({})", self.attributes.join(", "))
        }
    }
}

/// One DDL statement with its TOC identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataObject {
    pub section: Section,
    pub schema: String,
    pub name: String,
    pub objecttype: String,
    pub referenceobject: String,
    pub statement: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Rows come from a different segment layout; skip the per-segment
    /// distribution check.
    pub resize: bool,
}

/// Handoff files for one table across every destination segment.
#[derive(Debug, Clone)]
pub struct PipeSet {
    pub oid: u32,
    /// Batches per segment, in order.
    pub batches: usize,
    pub segments: BTreeMap<i32, SegmentPaths>,
    /// `<pipe>` path with segment placeholders, for databases that run the
    /// transfer on the segments themselves.
    pub pipe_template: String,
    pub watcher: SkipWatcher,
    pub cancel: CancellationToken,
}

impl PipeSet {
    pub fn contents(&self) -> impl Iterator<Item = i32> + '_ {
        self.segments.keys().copied()
    }

    fn paths(&self, content: i32) -> Result<&SegmentPaths> {
        self.segments
            .get(&content)
            .ok_or_else(|| CoordinatorError::Database(format!("no pipe for segment {content}")))
    }

    /// Wait for a helper to publish `batch` on `content` and consume it.
    /// `None` when the table was skipped.
    pub async fn read_batch(&self, content: i32, batch: usize) -> Result<Option<Vec<u8>>> {
        let paths = self.paths(content)?;
        let handoff = paths.table_pipe(self.oid, batch);
        let outcome = self
            .watcher
            .wait_for(&paths.skip_file(self.oid), || handoff.exists(), &self.cancel)
            .await;
        match outcome {
            WaitOutcome::Ready => {
                let data = pipe::take(&handoff).await?;
                self.watcher.signal().raise();
                Ok(data)
            }
            WaitOutcome::Skipped => Ok(None),
            WaitOutcome::Cancelled => Err(CoordinatorError::Cancelled),
        }
    }

    /// Hand a segment's rows to its helper.
    pub async fn write_segment(&self, content: i32, rows: &[u8]) -> Result<()> {
        let paths = self.paths(content)?;
        pipe::publish(&paths.table_pipe(self.oid, 0), rows).await?;
        self.watcher.signal().raise();
        Ok(())
    }
}

/// Shell program a segment runs to hand one table's rows to its helper.
pub fn backup_program(pipe_template: &str, oid: u32) -> String {
    let handoff = format!("{pipe_template}_{oid}_0");
    format!("cat - > {handoff}.part && mv {handoff}.part {handoff}")
}

/// Shell program a segment runs to stream every batch of one table from its
/// helper. Exits non-zero as soon as the table's skip file appears.
pub fn restore_program(pipe_template: &str, oid: u32, batches: usize, poll_secs: f64) -> String {
    let skip = format!("{pipe_template}_skip_{oid}");
    let handoff = format!("{pipe_template}_{oid}_$b");
    format!(
        "for b in $(seq 0 {last}); do \
while [ ! -e {handoff} ]; do [ -e {skip} ] && exit 1; sleep {poll_secs}; done; \
cat {handoff} && rm -f {handoff}; done",
        last = batches.saturating_sub(1),
    )
}

/// `COPY` statement recorded in helper script files and run by [`Database`]
/// implementations that transfer on the segments.
pub fn copy_statement(fqn: &str, attributes: &str, to_segments: bool, program: &str) -> String {
    let direction = if to_segments { "TO" } else { "FROM" };
    format!(
        "COPY {fqn}{sep}{attributes} {direction} PROGRAM '{}' WITH CSV DELIMITER ',' ON SEGMENT;",
        program.replace('\'', "''"),
        sep = if attributes.is_empty() { "" } else { " " },
    )
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Primary segments and the coordinator. A plain catalog read.
    async fn segment_configuration(&self) -> Result<Vec<SegmentDescriptor>>;

    async fn version(&self) -> Result<String>;

    /// User tables, leaf partitions included.
    async fn relations(&self) -> Result<Vec<Relation>>;

    /// DDL for `relations` and the objects around them, in dependency order
    /// within each section. Global objects only with `include_globals`.
    async fn metadata(&self, relations: &[Relation], include_globals: bool) -> Result<Vec<MetadataObject>>;

    async fn statistics(&self, relations: &[Relation]) -> Result<Vec<MetadataObject>>;

    /// Modification state of the append-optimized tables among `relations`,
    /// keyed by qualified name.
    async fn modification_counts(&self, relations: &[Relation]) -> Result<BTreeMap<String, AoEntry>>;

    async fn execute(&self, sql: &str) -> Result<()>;

    /// Publish every segment's rows of `relation`. Returns rows copied.
    async fn copy_to_segments(&self, relation: &Relation, pipes: &PipeSet) -> Result<u64>;

    /// Load every batch of every segment into `fqn`. Returns rows loaded.
    async fn copy_from_segments(
        &self,
        fqn: &str,
        attributes: &str,
        pipes: &PipeSet,
        options: &CopyOptions,
    ) -> Result<u64>;

    async fn truncate(&self, fqn: &str) -> Result<()>;

    async fn analyze(&self, fqn: &str) -> Result<()>;

    /// Merge leaf statistics into the root partition.
    async fn analyze_root_partition(&self, fqn: &str) -> Result<()>;

    /// Set the distribution policy to `numsegments` segments and move rows
    /// accordingly.
    async fn redistribute(&self, fqn: &str, numsegments: usize, replicated: bool) -> Result<()>;
}

#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(&self, dbname: &str) -> Result<Arc<dyn Database>>;

    async fn create_database(&self, dbname: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use segment_helper::pipe::SkipSignal;
    use segment_helper::BackupTimestamp;
    use std::time::Duration;

    fn pipe_set(dir: &std::path::Path) -> PipeSet {
        let ts = BackupTimestamp::parse("20240101000000").unwrap();
        let mut segments = BTreeMap::new();
        segments.insert(0, SegmentPaths::new(dir.to_path_buf(), 0, ts, 1));
        PipeSet {
            oid: 5,
            batches: 1,
            segments,
            pipe_template: String::new(),
            watcher: SkipWatcher::new(SkipSignal::new(), Duration::from_millis(5)),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_attribute_string() {
        let mut rel = Relation {
            oid: 1,
            schema: "public".into(),
            name: "sales".into(),
            attributes: vec!["id".into(), "amount".into()],
            partition_root: None,
            is_partition_parent: false,
            is_replicated: false,
            is_append_optimized: false,
        };
        assert_eq!(rel.attribute_string(), "(id, amount)");
        rel.attributes.clear();
        assert_eq!(rel.attribute_string(), "");
        assert_eq!(rel.fqn(), "public.sales");
    }

    #[test]
    fn test_copy_statements_use_segment_tokens() {
        let template = "/bk/gpseg<SEGID>/backups/20240101/20240101000000/gpbackup_<SEGID>_20240101000000_pipe_7";
        let backup = copy_statement("public.sales", "(id, amount)", true, &backup_program(template, 42));
        assert!(backup.starts_with("COPY public.sales (id, amount) TO PROGRAM 'cat - > "));
        assert!(backup.contains("pipe_7_42_0.part && mv"));
        assert!(backup.ends_with("ON SEGMENT;"));

        let restore = restore_program(template, 42, 2, 0.05);
        assert!(restore.contains("$(seq 0 1)"));
        assert!(restore.contains("pipe_7_skip_42 ] && exit 1"));
        let restore = copy_statement("public.sales", "", false, &restore);
        assert!(restore.starts_with("COPY public.sales FROM PROGRAM 'for b in"));
    }

    #[tokio::test]
    async fn test_read_batch_consumes_or_skips() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipes = pipe_set(dir.path());
        let paths = pipes.segments[&0].clone();

        pipe::publish(&paths.table_pipe(5, 0), b"1\n").await.unwrap();
        assert_eq!(pipes.read_batch(0, 0).await.unwrap().unwrap(), b"1\n");
        assert!(!paths.table_pipe(5, 0).exists());

        pipe::create_marker(&paths.skip_file(5)).unwrap();
        assert!(pipes.read_batch(0, 0).await.unwrap().is_none());
        assert!(pipes.read_batch(3, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_consuming_a_batch_wakes_the_producer() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut pipes = pipe_set(dir.path());
        let signal = SkipSignal::new();
        pipes.watcher = SkipWatcher::new(signal.clone(), Duration::from_secs(60));
        let paths = pipes.segments[&0].clone();
        let handoff = paths.table_pipe(5, 0);
        pipe::publish(&handoff, b"1\n").await.unwrap();

        let producer = SkipWatcher::new(signal, Duration::from_secs(60));
        let skip_file = paths.skip_file(5);
        let waiting = tokio::spawn({
            let handoff = handoff.clone();
            async move {
                producer
                    .wait_for(&skip_file, || !handoff.exists(), &CancellationToken::new())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(pipes.read_batch(0, 0).await.unwrap().unwrap(), b"1\n");
        let outcome = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Ready);
    }
}
