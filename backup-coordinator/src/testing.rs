//! In-memory cluster used by the orchestrator tests.
//!
//! Rows are CSV lines kept per segment. A distributed table keeps each row on
//! segment `key mod numsegments`, the key being the first field; a replicated
//! table keeps a full copy on every segment. DDL goes through a small parser
//! that understands the statements [`MemoryDatabase::metadata`] produces.

use crate::cluster::{descriptors, SegmentDescriptor};
use crate::config::{HelperMode, Settings};
use crate::context::{BackupOptions, RestoreOptions, RunContext};
use crate::database::{CopyOptions, Database, DatabaseConnector, MetadataObject, PipeSet, Relation};
use crate::error::{CoordinatorError, Result};
use crate::toc::{AoEntry, Section};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::try_join_all;
use segment_helper::transfer::codec::Compression;
use segment_helper::BackupTimestamp;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
struct MemTable {
    oid: u32,
    /// Column definitions, `name type`.
    columns: Vec<String>,
    replicated: bool,
    access_method: Option<String>,
    numsegments: usize,
    parent: Option<String>,
    range: Option<(i64, i64)>,
    partitioned: bool,
    rows: BTreeMap<i32, Vec<String>>,
    indexes: BTreeSet<String>,
    constraints: BTreeSet<String>,
    reltuples: f64,
    modcount: u64,
}

impl MemTable {
    fn column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter_map(|c| c.split_whitespace().next().map(String::from))
            .collect()
    }
}

#[derive(Debug, Default)]
struct MemDatabase {
    schemas: BTreeSet<String>,
    tables: BTreeMap<String, MemTable>,
    statements: Vec<String>,
}

impl MemDatabase {
    fn new() -> Self {
        Self {
            schemas: BTreeSet::from(["public".to_string()]),
            ..Default::default()
        }
    }

    fn table(&self, fqn: &str) -> Result<&MemTable> {
        self.tables.get(fqn).ok_or_else(|| missing_relation(fqn))
    }

    fn table_mut(&mut self, fqn: &str) -> Result<&mut MemTable> {
        self.tables.get_mut(fqn).ok_or_else(|| missing_relation(fqn))
    }

    fn children(&self, fqn: &str) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, t)| t.parent.as_deref() == Some(fqn))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// `fqn` itself, or its leaves when it is partitioned.
    fn storage_tables(&self, fqn: &str) -> Vec<String> {
        match self.tables.get(fqn) {
            Some(t) if t.partitioned => self
                .children(fqn)
                .iter()
                .flat_map(|child| self.storage_tables(child))
                .collect(),
            Some(_) => vec![fqn.to_string()],
            None => Vec::new(),
        }
    }

    fn root_of(&self, fqn: &str) -> Option<String> {
        let mut current = self.tables.get(fqn)?.parent.clone()?;
        while let Some(parent) = self.tables.get(&current).and_then(|t| t.parent.clone()) {
            current = parent;
        }
        Some(current)
    }

    fn count(&self, fqn: &str) -> usize {
        self.storage_tables(fqn)
            .iter()
            .filter_map(|name| self.tables.get(name))
            .map(|t| {
                if t.replicated {
                    t.rows.values().next().map_or(0, Vec::len)
                } else {
                    t.rows.values().map(Vec::len).sum()
                }
            })
            .sum()
    }

    /// Leaf holding `key` under partitioned `fqn`.
    fn route(&self, fqn: &str, key: i64) -> Result<String> {
        for child in self.children(fqn) {
            let Some(table) = self.tables.get(&child) else {
                continue;
            };
            if table.range.is_some_and(|(lo, hi)| lo <= key && key < hi) {
                return if table.partitioned {
                    self.route(&child, key)
                } else {
                    Ok(child)
                };
            }
        }
        Err(CoordinatorError::Database(format!(
            "no partition of relation \"{fqn}\" found for row with key {key}"
        )))
    }

    fn store(&mut self, fqn: &str, content: i32, row: String) -> Result<()> {
        let target = if self.table(fqn)?.partitioned {
            self.route(fqn, row_key(&row)?)?
        } else {
            fqn.to_string()
        };
        self.table_mut(&target)?.rows.entry(content).or_default().push(row);
        Ok(())
    }

    fn apply(&mut self, statement: &str, segment_count: usize, next_oid: &mut u32, roles: &mut BTreeSet<String>) -> Result<()> {
        let upper = statement.to_ascii_uppercase();
        if upper.starts_with("SET ") || upper.starts_with("RESET ") {
            return Ok(());
        }
        if let Some(name) = strip_prefix_ci(statement, "CREATE SCHEMA ") {
            let name = name.trim().to_string();
            if !self.schemas.insert(name.clone()) {
                return Err(CoordinatorError::Database(format!("schema \"{name}\" already exists")));
            }
            return Ok(());
        }
        if let Some(name) = strip_prefix_ci(statement, "CREATE ROLE ") {
            let name = name.split_whitespace().next().unwrap_or_default().to_string();
            if !roles.insert(name.clone()) {
                return Err(CoordinatorError::Database(format!("role \"{name}\" already exists")));
            }
            return Ok(());
        }
        if let Some(rest) = strip_prefix_ci(statement, "CREATE TABLE ") {
            return self.create_table(rest, segment_count, next_oid);
        }
        if let Some(rest) = strip_prefix_ci(statement, "CREATE INDEX ") {
            let mut words = rest.split_whitespace();
            let name = words.next().unwrap_or_default().to_string();
            let fqn = match (words.next(), words.next()) {
                (Some(on), Some(fqn)) if on.eq_ignore_ascii_case("ON") => fqn.to_string(),
                _ => return Err(syntax_error(statement)),
            };
            self.table_mut(&fqn)?.indexes.insert(name);
            return Ok(());
        }
        if let Some(rest) = strip_prefix_ci(statement, "ALTER TABLE ") {
            let rest = strip_prefix_ci(rest, "ONLY ").unwrap_or(rest);
            let mut words = rest.split_whitespace();
            let fqn = words.next().unwrap_or_default().to_string();
            let name = match (words.next(), words.next(), words.next()) {
                (Some(add), Some(constraint), Some(name))
                    if add.eq_ignore_ascii_case("ADD") && constraint.eq_ignore_ascii_case("CONSTRAINT") =>
                {
                    name.to_string()
                }
                _ => return Err(syntax_error(statement)),
            };
            self.table_mut(&fqn)?.constraints.insert(name);
            return Ok(());
        }
        if let Some(rest) = strip_prefix_ci(statement, "UPDATE pg_class SET ") {
            let reltuples = rest
                .split("reltuples = ")
                .nth(1)
                .and_then(|v| v.split("::").next())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .ok_or_else(|| syntax_error(statement))?;
            let fqn = rest.split('\'').nth(1).ok_or_else(|| syntax_error(statement))?;
            self.table_mut(fqn)?.reltuples = reltuples;
            return Ok(());
        }
        Err(syntax_error(statement))
    }

    fn create_table(&mut self, rest: &str, segment_count: usize, next_oid: &mut u32) -> Result<()> {
        let fqn: String = rest
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != '(')
            .collect();
        let Some((schema, _)) = fqn.split_once('.') else {
            return Err(syntax_error(rest));
        };
        if !self.schemas.contains(schema) {
            return Err(CoordinatorError::Database(format!("schema \"{schema}\" does not exist")));
        }
        if self.tables.contains_key(&fqn) {
            return Err(CoordinatorError::Database(format!("relation \"{fqn}\" already exists")));
        }
        let tail = rest[fqn.len()..].trim();

        let table = if let Some(partition) = strip_prefix_ci(tail, "PARTITION OF ") {
            let parent_name = partition.split_whitespace().next().unwrap_or_default().to_string();
            let parent = self.table(&parent_name)?;
            let bounds: Vec<i64> = partition
                .split(['(', ')'])
                .filter_map(|part| part.trim().parse().ok())
                .collect();
            let range = match bounds.as_slice() {
                [lo, hi] => (*lo, *hi),
                _ => return Err(syntax_error(rest)),
            };
            MemTable {
                columns: parent.columns.clone(),
                replicated: parent.replicated,
                access_method: parent.access_method.clone(),
                numsegments: parent.numsegments,
                parent: Some(parent_name),
                range: Some(range),
                partitioned: partition.to_ascii_uppercase().contains("PARTITION BY"),
                ..Default::default()
            }
        } else {
            let open = tail.find('(').ok_or_else(|| syntax_error(rest))?;
            let close = tail.find(')').ok_or_else(|| syntax_error(rest))?;
            let columns = tail[open + 1..close]
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            let options = tail[close + 1..].to_ascii_uppercase();
            let access_method = options
                .split("USING ")
                .nth(1)
                .and_then(|v| v.split_whitespace().next())
                .map(|am| am.to_ascii_lowercase());
            MemTable {
                columns,
                replicated: options.contains("DISTRIBUTED REPLICATED"),
                access_method,
                numsegments: segment_count,
                partitioned: options.contains("PARTITION BY"),
                ..Default::default()
            }
        };

        *next_oid += 1;
        self.tables.insert(
            fqn,
            MemTable {
                oid: *next_oid,
                ..table
            },
        );
        Ok(())
    }

    fn create_sql(&self, fqn: &str, table: &MemTable) -> String {
        if let (Some(parent), Some((lo, hi))) = (&table.parent, table.range) {
            return format!("CREATE TABLE {fqn} PARTITION OF {parent} FOR VALUES FROM ({lo}) TO ({hi});");
        }
        let mut sql = format!("CREATE TABLE {fqn} ({})", table.columns.join(", "));
        if let Some(am) = &table.access_method {
            sql.push_str(&format!(" USING {am}"));
        }
        if table.partitioned {
            let key = table.column_names().into_iter().next().unwrap_or_default();
            sql.push_str(&format!(" PARTITION BY RANGE ({key})"));
        }
        if table.replicated {
            sql.push_str(" DISTRIBUTED REPLICATED;");
        } else {
            let key = table.column_names().into_iter().next().unwrap_or_default();
            sql.push_str(&format!(" DISTRIBUTED BY ({key});"));
        }
        sql
    }
}

fn missing_relation(fqn: &str) -> CoordinatorError {
    CoordinatorError::Database(format!("relation \"{fqn}\" does not exist"))
}

fn syntax_error(statement: &str) -> CoordinatorError {
    let near = statement.split_whitespace().next().unwrap_or_default();
    CoordinatorError::Database(format!("syntax error at or near \"{near}\""))
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

/// Distribution key of a CSV row.
fn row_key(row: &str) -> Result<i64> {
    let field = row.split(',').next().unwrap_or_default();
    field.trim().parse().map_err(|_| {
        CoordinatorError::Database(format!("invalid input syntax for type bigint: \"{field}\""))
    })
}

fn home_segment(row: &str, numsegments: usize) -> Result<i32> {
    Ok(row_key(row)?.rem_euclid(numsegments.max(1) as i64) as i32)
}

/// Split on `;` outside single-quoted literals.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in sql.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                current.push(c);
            }
            ';' if !quoted => {
                statements.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    statements.push(current.trim().to_string());
    statements.retain(|s| !s.is_empty());
    statements
}

#[derive(Debug)]
struct ClusterState {
    segments: Vec<SegmentDescriptor>,
    roles: BTreeSet<String>,
    databases: BTreeMap<String, MemDatabase>,
    next_oid: u32,
}

/// Table copies in flight, and the most seen at once.
#[derive(Debug, Default)]
struct CopyGauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay_ms: AtomicU64,
}

struct CopyGuard(Arc<CopyGauge>);

impl Drop for CopyGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A whole cluster: topology, roles and databases.
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    locks: Arc<DashMap<(String, String, i32), Arc<tokio::sync::Mutex<()>>>>,
    copies: Arc<CopyGauge>,
}

impl MemoryCluster {
    pub fn new(root: &Path, primaries: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                segments: descriptors(root, primaries),
                roles: BTreeSet::from(["gpadmin".to_string()]),
                databases: BTreeMap::from([(crate::restore::MAINTENANCE_DB.to_string(), MemDatabase::new())]),
                next_oid: 16384,
            })),
            locks: Arc::new(DashMap::new()),
            copies: Arc::new(CopyGauge::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, ClusterState>> {
        self.state
            .lock()
            .map_err(|_| CoordinatorError::Database("cluster state poisoned".into()))
    }

    fn with_db<T>(&self, dbname: &str, f: impl FnOnce(&mut MemDatabase, usize) -> Result<T>) -> Result<T> {
        let mut state = self.state()?;
        let segment_count = state.segments.iter().filter(|s| s.content >= 0).count();
        let db = state
            .databases
            .get_mut(dbname)
            .ok_or_else(|| CoordinatorError::Database(format!("database \"{dbname}\" does not exist")))?;
        f(db, segment_count)
    }

    pub fn segment_count(&self) -> usize {
        self.state()
            .map(|s| s.segments.iter().filter(|d| d.content >= 0).count())
            .unwrap_or_default()
    }

    pub fn has_database(&self, dbname: &str) -> bool {
        self.state().is_ok_and(|s| s.databases.contains_key(dbname))
    }

    pub fn create_database(&self, dbname: &str) -> Result<()> {
        let mut state = self.state()?;
        if state.databases.contains_key(dbname) {
            return Err(CoordinatorError::Database(format!("database \"{dbname}\" already exists")));
        }
        state.databases.insert(dbname.to_string(), MemDatabase::new());
        Ok(())
    }

    pub fn database(&self, dbname: &str) -> Arc<dyn Database> {
        Arc::new(MemoryDatabase {
            cluster: self.clone(),
            name: dbname.to_string(),
        })
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { cluster: self.clone() }
    }

    /// Run DDL directly, as a client session would.
    pub fn execute(&self, dbname: &str, sql: &str) -> Result<()> {
        let mut state = self.state()?;
        let segment_count = state.segments.iter().filter(|s| s.content >= 0).count();
        let ClusterState {
            roles,
            databases,
            next_oid,
            ..
        } = &mut *state;
        let db = databases
            .get_mut(dbname)
            .ok_or_else(|| CoordinatorError::Database(format!("database \"{dbname}\" does not exist")))?;
        db.statements.push(sql.to_string());
        for statement in split_statements(sql) {
            db.apply(&statement, segment_count, next_oid, roles)?;
        }
        Ok(())
    }

    /// Insert rows where the distribution policy puts them.
    pub fn insert(&self, dbname: &str, fqn: &str, rows: &[&str]) -> Result<()> {
        self.with_db(dbname, |db, _| {
            let table = db.table(fqn)?.clone();
            let targets = db.storage_tables(fqn);
            for row in rows {
                let leaf = if table.partitioned {
                    db.route(fqn, row_key(row)?)?
                } else {
                    fqn.to_string()
                };
                let leaf_table = db.table_mut(&leaf)?;
                if leaf_table.replicated {
                    for content in 0..leaf_table.numsegments as i32 {
                        leaf_table.rows.entry(content).or_default().push(row.to_string());
                    }
                } else {
                    let content = home_segment(row, leaf_table.numsegments)?;
                    leaf_table.rows.entry(content).or_default().push(row.to_string());
                }
            }
            for name in targets {
                db.table_mut(&name)?.modcount += 1;
            }
            Ok(())
        })
    }

    /// Logical row count, as `SELECT count(*)` reports it.
    pub fn count(&self, dbname: &str, fqn: &str) -> Option<usize> {
        self.with_db(dbname, |db, _| {
            db.table(fqn)?;
            Ok(db.count(fqn))
        })
        .ok()
    }

    /// Stored rows per segment.
    pub fn segment_rows(&self, dbname: &str, fqn: &str) -> BTreeMap<i32, usize> {
        self.with_db(dbname, |db, _| {
            let mut counts = BTreeMap::new();
            for name in db.storage_tables(fqn) {
                for (content, rows) in &db.table(&name)?.rows {
                    *counts.entry(*content).or_default() += rows.len();
                }
            }
            Ok(counts)
        })
        .unwrap_or_default()
    }

    /// Rows stored on a segment other than the one their key hashes to.
    pub fn misplaced_rows(&self, dbname: &str, fqn: &str) -> usize {
        self.with_db(dbname, |db, _| {
            let mut misplaced = 0;
            for name in db.storage_tables(fqn) {
                let table = db.table(&name)?;
                if table.replicated {
                    continue;
                }
                for (content, rows) in &table.rows {
                    for row in rows {
                        if home_segment(row, table.numsegments)? != *content {
                            misplaced += 1;
                        }
                    }
                }
            }
            Ok(misplaced)
        })
        .unwrap_or(usize::MAX)
    }

    pub fn numsegments(&self, dbname: &str, fqn: &str) -> Option<usize> {
        self.with_db(dbname, |db, _| Ok(db.table(fqn)?.numsegments)).ok()
    }

    pub fn reltuples(&self, dbname: &str, fqn: &str) -> Option<f64> {
        self.with_db(dbname, |db, _| Ok(db.table(fqn)?.reltuples)).ok()
    }

    pub fn indexes(&self, dbname: &str, fqn: &str) -> BTreeSet<String> {
        self.with_db(dbname, |db, _| Ok(db.table(fqn)?.indexes.clone()))
            .unwrap_or_default()
    }

    pub fn tables_in_schema(&self, dbname: &str, schema: &str) -> Vec<String> {
        self.with_db(dbname, |db, _| {
            Ok(db
                .tables
                .keys()
                .filter(|fqn| fqn.split_once('.').is_some_and(|(s, _)| s == schema))
                .cloned()
                .collect())
        })
        .unwrap_or_default()
    }

    /// Every statement text executed against `dbname`, in order.
    pub fn statements(&self, dbname: &str) -> Vec<String> {
        self.with_db(dbname, |db, _| Ok(db.statements.clone()))
            .unwrap_or_default()
    }

    fn table_lock(&self, dbname: &str, fqn: &str, content: i32) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry((dbname.to_string(), fqn.to_string(), content))
            .or_default()
            .clone()
    }

    /// Keep every table copy open at least `delay`, so copies that may run
    /// together do overlap.
    pub fn set_copy_delay(&self, delay: Duration) {
        self.copies
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Most table copies seen in flight at once since the last call.
    pub fn take_peak_copies(&self) -> usize {
        self.copies.peak.swap(0, Ordering::SeqCst)
    }

    async fn begin_copy(&self) -> CopyGuard {
        let now = self.copies.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.copies.peak.fetch_max(now, Ordering::SeqCst);
        let guard = CopyGuard(self.copies.clone());
        let delay = self.copies.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        guard
    }

    /// Hold a lock on `fqn` on one segment, as a concurrent session would.
    /// Loads into that segment block until the guard drops.
    pub async fn lock_table_on_segment(&self, dbname: &str, fqn: &str, content: i32) -> tokio::sync::OwnedMutexGuard<()> {
        self.table_lock(dbname, fqn, content).lock_owned().await
    }
}

pub struct MemoryDatabase {
    cluster: MemoryCluster,
    name: String,
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    replicated: bool,
    numsegments: usize,
}

impl MemoryDatabase {
    fn with_db<T>(&self, f: impl FnOnce(&mut MemDatabase, usize) -> Result<T>) -> Result<T> {
        self.cluster.with_db(&self.name, f)
    }

    async fn read_segment(
        &self,
        fqn: &str,
        content: i32,
        pipes: &PipeSet,
        layout: Layout,
        resize: bool,
    ) -> Result<(i32, Vec<String>)> {
        let lock = self.cluster.table_lock(&self.name, fqn, content);
        let _guard = lock.lock().await;
        let mut rows = Vec::new();
        for batch in 0..pipes.batches {
            let data = pipes.read_batch(content, batch).await?.ok_or_else(|| {
                CoordinatorError::Database(format!(
                    "COPY {fqn} on segment {content} ended early: the table was skipped"
                ))
            })?;
            let text = String::from_utf8(data)
                .map_err(|e| CoordinatorError::Database(format!("invalid byte sequence: {e}")))?;
            for line in text.lines().filter(|l| !l.is_empty()) {
                if !layout.replicated && !resize {
                    let home = home_segment(line, layout.numsegments)?;
                    if home != content {
                        return Err(CoordinatorError::Database(format!(
                            "value of distribution key doesn't belong to segment with ID {content}, it belongs to segment with ID {home}"
                        )));
                    }
                }
                rows.push(line.to_string());
            }
        }
        Ok((content, rows))
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn segment_configuration(&self) -> Result<Vec<SegmentDescriptor>> {
        Ok(self.cluster.state()?.segments.clone())
    }

    async fn version(&self) -> Result<String> {
        Ok("PostgreSQL 12.12 (Greenplum Database 7.1.0 in-memory)".into())
    }

    async fn relations(&self) -> Result<Vec<Relation>> {
        self.with_db(|db, _| {
            Ok(db
                .tables
                .iter()
                .filter_map(|(fqn, table)| {
                    let (schema, name) = fqn.split_once('.')?;
                    Some(Relation {
                        oid: table.oid,
                        schema: schema.to_string(),
                        name: name.to_string(),
                        attributes: table.column_names(),
                        partition_root: db.root_of(fqn),
                        is_partition_parent: table.partitioned,
                        is_replicated: table.replicated,
                        is_append_optimized: table.access_method.is_some(),
                    })
                })
                .collect())
        })
    }

    async fn metadata(&self, relations: &[Relation], include_globals: bool) -> Result<Vec<MetadataObject>> {
        let roles = self.cluster.state()?.roles.clone();
        self.with_db(|db, _| {
            let mut objects = Vec::new();
            if include_globals {
                for role in roles {
                    objects.push(MetadataObject {
                        section: Section::Global,
                        schema: String::new(),
                        name: role.clone(),
                        objecttype: "ROLE".into(),
                        referenceobject: String::new(),
                        statement: format!("CREATE ROLE {role};"),
                    });
                }
            }
            let schemas: BTreeSet<&str> = relations.iter().map(|r| r.schema.as_str()).collect();
            for schema in schemas {
                objects.push(MetadataObject {
                    section: Section::Predata,
                    schema: String::new(),
                    name: schema.to_string(),
                    objecttype: "SCHEMA".into(),
                    referenceobject: String::new(),
                    statement: format!("CREATE SCHEMA {schema};"),
                });
            }

            let mut ordered: Vec<&Relation> = relations.iter().collect();
            ordered.sort_by_key(|r| {
                let depth = db.tables.get(&r.fqn()).map_or(0, |t| {
                    let mut depth = 0;
                    let mut parent = t.parent.clone();
                    while let Some(p) = parent {
                        depth += 1;
                        parent = db.tables.get(&p).and_then(|t| t.parent.clone());
                    }
                    depth
                });
                (depth, r.fqn())
            });
            let mut postdata = Vec::new();
            for relation in ordered {
                let fqn = relation.fqn();
                let table = db.table(&fqn)?;
                objects.push(MetadataObject {
                    section: Section::Predata,
                    schema: relation.schema.clone(),
                    name: relation.name.clone(),
                    objecttype: "TABLE".into(),
                    referenceobject: String::new(),
                    statement: db.create_sql(&fqn, table),
                });
                let key = table.column_names().into_iter().next().unwrap_or_default();
                for constraint in &table.constraints {
                    postdata.push(MetadataObject {
                        section: Section::Postdata,
                        schema: relation.schema.clone(),
                        name: constraint.clone(),
                        objecttype: "CONSTRAINT".into(),
                        referenceobject: fqn.clone(),
                        statement: format!("ALTER TABLE ONLY {fqn} ADD CONSTRAINT {constraint} PRIMARY KEY ({key});"),
                    });
                }
                for index in &table.indexes {
                    postdata.push(MetadataObject {
                        section: Section::Postdata,
                        schema: relation.schema.clone(),
                        name: index.clone(),
                        objecttype: "INDEX".into(),
                        referenceobject: fqn.clone(),
                        statement: format!("CREATE INDEX {index} ON {fqn} USING btree ({key});"),
                    });
                }
            }
            objects.extend(postdata);
            Ok(objects)
        })
    }

    async fn statistics(&self, relations: &[Relation]) -> Result<Vec<MetadataObject>> {
        self.with_db(|db, _| {
            relations
                .iter()
                .map(|relation| {
                    let fqn = relation.fqn();
                    let table = db.table(&fqn)?;
                    Ok(MetadataObject {
                        section: Section::Statistics,
                        schema: relation.schema.clone(),
                        name: relation.name.clone(),
                        objecttype: "STATISTICS".into(),
                        referenceobject: String::new(),
                        statement: format!(
                            "UPDATE pg_class SET relpages = 1::int, reltuples = {}::real WHERE oid = '{fqn}'::regclass::oid;",
                            table.reltuples
                        ),
                    })
                })
                .collect()
        })
    }

    async fn modification_counts(&self, relations: &[Relation]) -> Result<BTreeMap<String, AoEntry>> {
        self.with_db(|db, _| {
            let mut counts = BTreeMap::new();
            for relation in relations.iter().filter(|r| r.is_append_optimized) {
                let table = db.table(&relation.fqn())?;
                counts.insert(
                    relation.fqn(),
                    AoEntry {
                        modcount: table.modcount,
                        lastddltimestamp: String::new(),
                    },
                );
            }
            Ok(counts)
        })
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.cluster.execute(&self.name, sql)
    }

    async fn copy_to_segments(&self, relation: &Relation, pipes: &PipeSet) -> Result<u64> {
        let _copy = self.cluster.begin_copy().await;
        let fqn = relation.fqn();
        let (per_segment, replicated) = self.with_db(|db, _| {
            let replicated = db.table(&fqn)?.replicated;
            let mut per_segment: BTreeMap<i32, Vec<String>> = BTreeMap::new();
            for name in db.storage_tables(&fqn) {
                for (content, rows) in &db.table(&name)?.rows {
                    per_segment.entry(*content).or_default().extend(rows.iter().cloned());
                }
            }
            Ok((per_segment, replicated))
        })?;

        let mut copied = 0u64;
        for content in pipes.contents() {
            let rows = per_segment.get(&content).cloned().unwrap_or_default();
            let mut text = rows.join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            pipes.write_segment(content, text.as_bytes()).await?;
            if !replicated || copied == 0 {
                copied += rows.len() as u64;
            }
        }
        Ok(copied)
    }

    async fn copy_from_segments(
        &self,
        fqn: &str,
        _attributes: &str,
        pipes: &PipeSet,
        options: &CopyOptions,
    ) -> Result<u64> {
        let _copy = self.cluster.begin_copy().await;
        let layout = self.with_db(|db, _| {
            let table = db.table(fqn)?;
            Ok(Layout {
                replicated: table.replicated,
                numsegments: table.numsegments,
            })
        })?;
        let readers = pipes
            .contents()
            .map(|content| self.read_segment(fqn, content, pipes, layout, options.resize));
        let loaded = try_join_all(readers).await?;

        self.with_db(|db, _| {
            let mut total = 0u64;
            for (content, rows) in loaded {
                for row in rows {
                    db.store(fqn, content, row)?;
                    total += 1;
                }
            }
            for name in db.storage_tables(fqn) {
                db.table_mut(&name)?.modcount += 1;
            }
            Ok(total)
        })
    }

    async fn truncate(&self, fqn: &str) -> Result<()> {
        self.with_db(|db, _| {
            db.table(fqn)?;
            for name in db.storage_tables(fqn) {
                let table = db.table_mut(&name)?;
                table.rows.clear();
                table.modcount += 1;
            }
            Ok(())
        })
    }

    async fn analyze(&self, fqn: &str) -> Result<()> {
        self.with_db(|db, _| {
            let count = db.count(fqn) as f64;
            db.table_mut(fqn)?.reltuples = count;
            Ok(())
        })
    }

    async fn analyze_root_partition(&self, fqn: &str) -> Result<()> {
        self.with_db(|db, _| {
            let merged: f64 = db
                .storage_tables(fqn)
                .iter()
                .filter_map(|leaf| db.tables.get(leaf))
                .map(|t| t.reltuples)
                .sum();
            db.table_mut(fqn)?.reltuples = merged;
            Ok(())
        })
    }

    async fn redistribute(&self, fqn: &str, numsegments: usize, replicated: bool) -> Result<()> {
        self.with_db(|db, _| {
            db.table_mut(fqn)?.numsegments = numsegments;
            for name in db.storage_tables(fqn) {
                let table = db.table_mut(&name)?;
                let rows = std::mem::take(&mut table.rows);
                table.numsegments = numsegments;
                if replicated {
                    let copy = rows.into_values().next().unwrap_or_default();
                    for content in 0..numsegments as i32 {
                        table.rows.insert(content, copy.clone());
                    }
                } else {
                    for row in rows.into_values().flatten() {
                        let content = home_segment(&row, numsegments)?;
                        table.rows.entry(content).or_default().push(row);
                    }
                }
            }
            Ok(())
        })
    }
}

pub struct MemoryConnector {
    cluster: MemoryCluster,
}

#[async_trait]
impl DatabaseConnector for MemoryConnector {
    async fn connect(&self, dbname: &str) -> Result<Arc<dyn Database>> {
        if !self.cluster.has_database(dbname) {
            return Err(CoordinatorError::Database(format!("database \"{dbname}\" does not exist")));
        }
        Ok(self.cluster.database(dbname))
    }

    async fn create_database(&self, dbname: &str) -> Result<()> {
        self.cluster.create_database(dbname)
    }
}

/// In-process helpers with short poll intervals and a shared history file.
pub fn settings(dir: &Path) -> Arc<Settings> {
    Arc::new(Settings {
        helper_mode: HelperMode::InProcess,
        helper_timeout_secs: 30,
        helper_exit_wait_secs: 2,
        poll_interval_ms: 5,
        heartbeat_interval_ms: 50,
        history_db: Some(dir.join("gpbackup_history.db")),
        ..Settings::default()
    })
}

pub fn backup_context(settings: &Arc<Settings>, options: BackupOptions) -> RunContext<BackupOptions> {
    RunContext::new(options, settings.clone(), CancellationToken::new())
}

pub fn restore_context(settings: &Arc<Settings>, options: RestoreOptions) -> RunContext<RestoreOptions> {
    RunContext::new(options, settings.clone(), CancellationToken::new())
}

pub fn backup_options(dbname: &str, backup_dir: &Path) -> BackupOptions {
    BackupOptions {
        backup_dir: Some(backup_dir.to_path_buf()),
        compression: Compression::None,
        ..BackupOptions::new(dbname)
    }
}

/// Options for a chain of incremental backups; the full backup at the head of
/// the chain is taken with the same flags minus `incremental`.
pub fn incremental_options(dbname: &str, backup_dir: &Path, incremental: bool) -> BackupOptions {
    BackupOptions {
        leaf_partition_data: true,
        incremental,
        ..backup_options(dbname, backup_dir)
    }
}

pub fn restore_options(timestamp: &BackupTimestamp, backup_dir: &Path) -> RestoreOptions {
    RestoreOptions {
        backup_dir: Some(backup_dir.to_path_buf()),
        ..RestoreOptions::new(timestamp.clone())
    }
}

/// Test cluster with a `sales` database:
/// - `public.sales`, 13 rows distributed by id, indexed, with a primary key
/// - `public.customers`, replicated, 3 rows
/// - `public.orders`, append-optimized, 6 rows
/// - `public.events`, range partitioned into two leaves, 8 rows
/// - `archive.old_sales`, 4 rows
pub fn seeded_cluster(root: &Path, primaries: usize) -> Result<MemoryCluster> {
    let cluster = MemoryCluster::new(root, primaries);
    cluster.create_database("sales")?;
    cluster.execute(
        "sales",
        "CREATE SCHEMA archive;
CREATE TABLE public.sales (id bigint, amount numeric) DISTRIBUTED BY (id);
CREATE TABLE public.customers (id bigint, name text) DISTRIBUTED REPLICATED;
CREATE TABLE public.orders (id bigint, qty int) USING ao_row DISTRIBUTED BY (id);
CREATE TABLE public.events (id bigint, kind text) PARTITION BY RANGE (id) DISTRIBUTED BY (id);
CREATE TABLE public.events_1 PARTITION OF public.events FOR VALUES FROM (0) TO (100);
CREATE TABLE public.events_2 PARTITION OF public.events FOR VALUES FROM (100) TO (200);
CREATE TABLE archive.old_sales (id bigint, amount numeric) DISTRIBUTED BY (id);
CREATE INDEX sales_amount_idx ON public.sales USING btree (amount);
ALTER TABLE ONLY public.sales ADD CONSTRAINT sales_pkey PRIMARY KEY (id);",
    )?;
    let sales: Vec<String> = (1..=13).map(|i| format!("{i},{}.50", i * 10)).collect();
    cluster.insert("sales", "public.sales", &sales.iter().map(String::as_str).collect::<Vec<_>>())?;
    cluster.insert("sales", "public.customers", &["1,alice", "2,bob", "3,carol"])?;
    cluster.insert("sales", "public.orders", &["1,5", "2,1", "3,7", "4,2", "5,9", "6,3"])?;
    cluster.insert(
        "sales",
        "public.events",
        &["1,a", "2,b", "50,c", "99,d", "100,e", "150,f", "151,g", "199,h"],
    )?;
    cluster.insert("sales", "archive.old_sales", &["1,1.00", "2,2.00", "3,3.00", "4,4.00"])?;
    Ok(cluster)
}

/// Row counts of every table in `dbname`.
pub fn row_counts(cluster: &MemoryCluster, dbname: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for schema in ["public", "archive", "fooschema"] {
        for fqn in cluster.tables_in_schema(dbname, schema) {
            if let Some(count) = cluster.count(dbname, &fqn) {
                counts.insert(fqn, count);
            }
        }
    }
    counts
}

/// Data file of `oid` written by segment `content`.
pub fn data_file(backup_dir: &Path, timestamp: &BackupTimestamp, content: i32, oid: u32) -> PathBuf {
    let paths = segment_helper::FilePathInfo::new(
        timestamp.clone(),
        Some(backup_dir.to_path_buf()),
        "demoDataDir",
        BTreeMap::new(),
        0,
    );
    paths.segment(content).table_data(content, oid, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rows_follow_distribution_policy() {
        let dir = tempfile::TempDir::new().unwrap();
        let cluster = seeded_cluster(dir.path(), 3).unwrap();
        assert_eq!(cluster.count("sales", "public.sales"), Some(13));
        assert_eq!(cluster.misplaced_rows("sales", "public.sales"), 0);
        assert_eq!(cluster.count("sales", "public.customers"), Some(3));
        assert_eq!(
            cluster.segment_rows("sales", "public.customers"),
            BTreeMap::from([(0, 3), (1, 3), (2, 3)])
        );
        assert_eq!(cluster.count("sales", "public.events"), Some(8));
        assert_eq!(cluster.count("sales", "public.events_2"), Some(4));
    }

    #[tokio::test]
    async fn test_ddl_errors_read_like_the_server() {
        let dir = tempfile::TempDir::new().unwrap();
        let cluster = seeded_cluster(dir.path(), 2).unwrap();
        let db = cluster.database("sales");
        let err = db.execute("CREATE SCHEMA public;").await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        let err = db.execute("CREATE TABLE nope.t (id bigint) DISTRIBUTED BY (id);").await.unwrap_err();
        assert!(err.to_string().contains("schema \"nope\" does not exist"));
        db.execute("SET client_encoding = 'UTF8';\nSET standard_conforming_strings = on;").await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_recreates_tables() {
        let dir = tempfile::TempDir::new().unwrap();
        let cluster = seeded_cluster(dir.path(), 2).unwrap();
        let db = cluster.database("sales");
        let relations = db.relations().await.unwrap();
        let leaf = relations.iter().find(|r| r.name == "events_1").unwrap();
        assert_eq!(leaf.partition_root.as_deref(), Some("public.events"));

        cluster.create_database("copy").unwrap();
        let copy = cluster.database("copy");
        for object in db.metadata(&relations, false).await.unwrap() {
            match copy.execute(&object.statement).await {
                Ok(()) => {}
                Err(e) if object.objecttype == "SCHEMA" => assert!(e.to_string().contains("already exists")),
                Err(e) => panic!("{}: {e}", object.statement),
            }
        }
        assert_eq!(
            cluster.indexes("copy", "public.sales"),
            BTreeSet::from(["sales_amount_idx".to_string()])
        );
        assert_eq!(cluster.count("copy", "public.events"), Some(0));
        assert_eq!(cluster.numsegments("copy", "public.customers"), Some(2));
    }
}
