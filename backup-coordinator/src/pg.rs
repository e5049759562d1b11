//! Greenplum access over sqlx.
//!
//! Data moves with `COPY ... ON SEGMENT`: every segment runs the shell
//! program from [`backup_program`] or [`restore_program`] against its own
//! handoff files, so no row passes through the coordinator.

use crate::cluster::SegmentDescriptor;
use crate::config::Settings;
use crate::database::{
    backup_program, copy_statement, restore_program, CopyOptions, Database, DatabaseConnector,
    MetadataObject, PipeSet, Relation,
};
use crate::error::{CoordinatorError, Result};
use crate::toc::{AoEntry, Section};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Executor, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

const SEGMENT_CONFIGURATION_SQL: &str = "\
SELECT content, hostname, port, datadir
FROM gp_segment_configuration
WHERE role = 'p'
ORDER BY content";

const RELATIONS_SQL: &str = "\
SELECT c.oid::int8 AS oid,
    n.nspname AS schema,
    c.relname AS name,
    coalesce((SELECT array_agg(quote_ident(a.attname)::text ORDER BY a.attnum)
        FROM pg_attribute a
        WHERE a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped), '{}') AS attributes,
    CASE WHEN c.relispartition THEN
        (SELECT rn.nspname || '.' || rc.relname
         FROM pg_class rc JOIN pg_namespace rn ON rn.oid = rc.relnamespace
         WHERE rc.oid = pg_partition_root(c.oid))
    END AS partition_root,
    c.relkind = 'p' AS is_partition_parent,
    coalesce(p.policytype = 'r', false) AS is_replicated,
    coalesce(am.amname IN ('ao_row', 'ao_column'), false) AS is_append_optimized
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN gp_distribution_policy p ON p.localoid = c.oid
LEFT JOIN pg_am am ON am.oid = c.relam
WHERE c.relkind IN ('r', 'p')
    AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'gp_toolkit', 'pg_aoseg', 'pg_bitmapindex')
    AND n.nspname NOT LIKE 'pg_temp%'
    AND n.nspname NOT LIKE 'pg_toast%'
ORDER BY n.nspname, c.relname";

const COLUMNS_SQL: &str = "\
SELECT quote_ident(a.attname)::text AS name,
    format_type(a.atttypid, a.atttypmod) AS type,
    a.attnotnull AS not_null,
    pg_get_expr(d.adbin, d.adrelid) AS default_expr
FROM pg_attribute a
LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
WHERE a.attrelid = $1::int8::oid AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum";

const TABLE_SHAPE_SQL: &str = "\
SELECT pg_get_table_distributedby(c.oid) AS distributed_by,
    CASE WHEN c.relkind = 'p' THEN pg_get_partkeydef(c.oid) END AS partition_key,
    CASE WHEN c.relispartition THEN pg_get_expr(c.relpartbound, c.oid) END AS partition_bound,
    (SELECT pn.nspname || '.' || pc.relname
     FROM pg_inherits i
     JOIN pg_class pc ON pc.oid = i.inhparent
     JOIN pg_namespace pn ON pn.oid = pc.relnamespace
     WHERE i.inhrelid = c.oid) AS parent,
    am.amname AS access_method,
    obj_description(c.oid, 'pg_class') AS comment
FROM pg_class c
LEFT JOIN pg_am am ON am.oid = c.relam
WHERE c.oid = $1::int8::oid";

const INDEXES_SQL: &str = "\
SELECT ic.relname AS name, pg_get_indexdef(i.indexrelid) AS definition
FROM pg_index i
JOIN pg_class ic ON ic.oid = i.indexrelid
WHERE i.indrelid = $1::int8::oid
    AND NOT EXISTS (SELECT 1 FROM pg_constraint con WHERE con.conindid = i.indexrelid)
ORDER BY ic.relname";

const CONSTRAINTS_SQL: &str = "\
SELECT conname AS name, pg_get_constraintdef(oid) AS definition
FROM pg_constraint
WHERE conrelid = $1::int8::oid AND contype IN ('p', 'u', 'c', 'f', 'x') AND NOT coninherited
ORDER BY contype = 'f', conname";

const TRIGGERS_SQL: &str = "\
SELECT tgname AS name, pg_get_triggerdef(oid) AS definition
FROM pg_trigger
WHERE tgrelid = $1::int8::oid AND NOT tgisinternal
ORDER BY tgname";

const RULES_SQL: &str = "\
SELECT r.rulename AS name, pg_get_ruledef(r.oid) AS definition
FROM pg_rewrite r
WHERE r.ev_class = $1::int8::oid AND r.rulename <> '_RETURN'
ORDER BY r.rulename";

const ROLES_SQL: &str = "\
SELECT rolname, rolsuper, rolinherit, rolcreaterole, rolcreatedb, rolcanlogin
FROM pg_roles
WHERE rolname NOT LIKE 'pg\\_%'
ORDER BY rolname";

const STATISTICS_SQL: &str = "\
SELECT c.relpages::int8 AS relpages, c.reltuples::float8 AS reltuples
FROM pg_class c
WHERE c.oid = $1::int8::oid";

const MODCOUNT_SQL: &str = "\
SELECT coalesce(sum(modcount), 0)::int8 AS modcount FROM gp_toolkit.__gp_aoseg($1::int8::oid)";

const LAST_DDL_SQL: &str = "\
SELECT coalesce(to_char(max(statime), 'YYYY-MM-DD HH24:MI:SS.US'), '') AS lastddl
FROM pg_stat_last_operation
WHERE objid = $1::int8::oid AND staactionname IN ('ALTER', 'TRUNCATE')";

/// Quote `value` as a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote `value` as a SQL identifier.
pub fn quote_ident(value: &str) -> String {
    let plain = value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('"', "\"\""))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Column {
    name: String,
    type_name: String,
    not_null: bool,
    default_expr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TableShape {
    distributed_by: String,
    partition_key: Option<String>,
    partition_bound: Option<String>,
    parent: Option<String>,
    access_method: Option<String>,
    comment: Option<String>,
}

/// `CREATE TABLE` for a table, partition root or leaf partition.
fn create_table_sql(fqn: &str, columns: &[Column], shape: &TableShape) -> String {
    if let (Some(parent), Some(bound)) = (&shape.parent, &shape.partition_bound) {
        return format!("CREATE TABLE {fqn} PARTITION OF {parent} {bound};");
    }
    let body = columns
        .iter()
        .map(|c| {
            let mut line = format!("\t{} {}", c.name, c.type_name);
            if let Some(default) = &c.default_expr {
                line.push_str(&format!(" DEFAULT {default}"));
            }
            if c.not_null {
                line.push_str(" NOT NULL");
            }
            line
        })
        .collect::<Vec<_>>()
        .join(",\n");
    let mut sql = format!("CREATE TABLE {fqn} (\n{body}\n)");
    if let Some(am) = shape.access_method.as_deref().filter(|am| *am != "heap") {
        sql.push_str(&format!(" USING {am}"));
    }
    if let Some(key) = &shape.partition_key {
        sql.push_str(&format!(" PARTITION BY {key}"));
    }
    if !shape.distributed_by.is_empty() {
        sql.push(' ');
        sql.push_str(&shape.distributed_by);
    }
    sql.push(';');
    sql
}

fn create_role_sql(name: &str, flags: [(bool, &str); 5]) -> String {
    let options: Vec<&str> = flags
        .iter()
        .map(|(set, option)| if *set { *option } else { "" })
        .filter(|o| !o.is_empty())
        .collect();
    if options.is_empty() {
        format!("CREATE ROLE {};", quote_ident(name))
    } else {
        format!("CREATE ROLE {} {};", quote_ident(name), options.join(" "))
    }
}

/// Creation order: plain tables and partition roots, then intermediate
/// partitions, then leaves.
fn creation_rank(relation: &Relation) -> u8 {
    match (relation.partition_root.is_some(), relation.is_partition_parent) {
        (false, _) => 0,
        (true, true) => 1,
        (true, false) => 2,
    }
}

fn oid_param(oid: u32) -> i64 {
    i64::from(oid)
}

pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn columns(&self, oid: u32) -> Result<Vec<Column>> {
        let rows = sqlx::query(COLUMNS_SQL)
            .bind(oid_param(oid))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<Column> {
                Ok(Column {
                    name: row.try_get("name")?,
                    type_name: row.try_get("type")?,
                    not_null: row.try_get("not_null")?,
                    default_expr: row.try_get("default_expr")?,
                })
            })
            .collect()
    }

    async fn shape(&self, oid: u32) -> Result<TableShape> {
        let row = sqlx::query(TABLE_SHAPE_SQL)
            .bind(oid_param(oid))
            .fetch_one(&self.pool)
            .await?;
        Ok(TableShape {
            distributed_by: row.try_get::<Option<String>, _>("distributed_by")?.unwrap_or_default(),
            partition_key: row.try_get("partition_key")?,
            partition_bound: row.try_get("partition_bound")?,
            parent: row.try_get("parent")?,
            access_method: row.try_get("access_method")?,
            comment: row.try_get("comment")?,
        })
    }

    /// `(name, definition)` pairs from one of the per-table DDL queries.
    async fn definitions(&self, sql: &str, oid: u32) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(sql).bind(oid_param(oid)).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<(String, String)> { Ok((row.try_get("name")?, row.try_get("definition")?)) })
            .collect()
    }

    async fn roles(&self) -> Result<Vec<MetadataObject>> {
        let rows = sqlx::query(ROLES_SQL).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<MetadataObject> {
                let name: String = row.try_get("rolname")?;
                let statement = create_role_sql(
                    &name,
                    [
                        (row.try_get("rolsuper")?, "SUPERUSER"),
                        (!row.try_get::<bool, _>("rolinherit")?, "NOINHERIT"),
                        (row.try_get("rolcreaterole")?, "CREATEROLE"),
                        (row.try_get("rolcreatedb")?, "CREATEDB"),
                        (row.try_get("rolcanlogin")?, "LOGIN"),
                    ],
                );
                Ok(MetadataObject {
                    section: Section::Global,
                    schema: String::new(),
                    name,
                    objecttype: "ROLE".into(),
                    referenceobject: String::new(),
                    statement,
                })
            })
            .collect()
    }
}

fn object(section: Section, schema: &str, name: &str, objecttype: &str, reference: &str, statement: String) -> MetadataObject {
    MetadataObject {
        section,
        schema: schema.to_string(),
        name: name.to_string(),
        objecttype: objecttype.to_string(),
        referenceobject: reference.to_string(),
        statement,
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn segment_configuration(&self) -> Result<Vec<SegmentDescriptor>> {
        let rows = sqlx::query(SEGMENT_CONFIGURATION_SQL)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<SegmentDescriptor> {
                let port: i32 = row.try_get("port")?;
                Ok(SegmentDescriptor {
                    content: i32::from(row.try_get::<i16, _>("content")?),
                    hostname: row.try_get("hostname")?,
                    port: u16::try_from(port)
                        .map_err(|_| CoordinatorError::Database(format!("invalid segment port {port}")))?,
                    datadir: PathBuf::from(row.try_get::<String, _>("datadir")?),
                })
            })
            .collect()
    }

    async fn version(&self) -> Result<String> {
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    async fn relations(&self) -> Result<Vec<Relation>> {
        let rows = sqlx::query(RELATIONS_SQL).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<Relation> {
                let oid: i64 = row.try_get("oid")?;
                Ok(Relation {
                    oid: u32::try_from(oid)
                        .map_err(|_| CoordinatorError::Database(format!("invalid relation oid {oid}")))?,
                    schema: row.try_get("schema")?,
                    name: row.try_get("name")?,
                    attributes: row.try_get("attributes")?,
                    partition_root: row.try_get("partition_root")?,
                    is_partition_parent: row.try_get("is_partition_parent")?,
                    is_replicated: row.try_get("is_replicated")?,
                    is_append_optimized: row.try_get("is_append_optimized")?,
                })
            })
            .collect()
    }

    async fn metadata(&self, relations: &[Relation], include_globals: bool) -> Result<Vec<MetadataObject>> {
        let mut objects = Vec::new();
        if include_globals {
            objects.extend(self.roles().await?);
        }

        let schemas: BTreeSet<&str> = relations.iter().map(|r| r.schema.as_str()).collect();
        for schema in schemas {
            objects.push(object(
                Section::Predata,
                "",
                schema,
                "SCHEMA",
                "",
                format!("CREATE SCHEMA {};", quote_ident(schema)),
            ));
        }

        let mut ordered: Vec<&Relation> = relations.iter().collect();
        ordered.sort_by_key(|r| creation_rank(r));
        let mut postdata = Vec::new();
        for relation in ordered {
            let fqn = relation.fqn();
            let shape = self.shape(relation.oid).await?;
            let columns = self.columns(relation.oid).await?;
            objects.push(object(
                Section::Predata,
                &relation.schema,
                &relation.name,
                "TABLE",
                "",
                create_table_sql(&fqn, &columns, &shape),
            ));
            if let Some(comment) = &shape.comment {
                objects.push(object(
                    Section::Predata,
                    &relation.schema,
                    &relation.name,
                    "COMMENT",
                    &fqn,
                    format!("COMMENT ON TABLE {fqn} IS {};", quote_literal(comment)),
                ));
            }

            for (name, definition) in self.definitions(INDEXES_SQL, relation.oid).await? {
                postdata.push(object(Section::Postdata, &relation.schema, &name, "INDEX", &fqn, format!("{definition};")));
            }
            for (name, definition) in self.definitions(CONSTRAINTS_SQL, relation.oid).await? {
                postdata.push(object(
                    Section::Postdata,
                    &relation.schema,
                    &name,
                    "CONSTRAINT",
                    &fqn,
                    format!("ALTER TABLE ONLY {fqn} ADD CONSTRAINT {} {definition};", quote_ident(&name)),
                ));
            }
            for (name, definition) in self.definitions(RULES_SQL, relation.oid).await? {
                postdata.push(object(Section::Postdata, &relation.schema, &name, "RULE", &fqn, definition));
            }
            for (name, definition) in self.definitions(TRIGGERS_SQL, relation.oid).await? {
                postdata.push(object(Section::Postdata, &relation.schema, &name, "TRIGGER", &fqn, format!("{definition};")));
            }
        }
        objects.extend(postdata);
        tracing::debug!(objects = objects.len(), "Collected metadata");
        Ok(objects)
    }

    async fn statistics(&self, relations: &[Relation]) -> Result<Vec<MetadataObject>> {
        let mut objects = Vec::with_capacity(relations.len());
        for relation in relations {
            let row = sqlx::query(STATISTICS_SQL)
                .bind(oid_param(relation.oid))
                .fetch_one(&self.pool)
                .await?;
            let relpages: i64 = row.try_get("relpages")?;
            let reltuples: f64 = row.try_get("reltuples")?;
            let fqn = relation.fqn();
            objects.push(object(
                Section::Statistics,
                &relation.schema,
                &relation.name,
                "STATISTICS",
                "",
                format!(
                    "UPDATE pg_class SET relpages = {relpages}::int, reltuples = {reltuples}::real WHERE oid = {}::regclass::oid;",
                    quote_literal(&fqn)
                ),
            ));
        }
        Ok(objects)
    }

    async fn modification_counts(&self, relations: &[Relation]) -> Result<BTreeMap<String, AoEntry>> {
        let mut counts = BTreeMap::new();
        for relation in relations.iter().filter(|r| r.is_append_optimized) {
            let modcount: i64 = sqlx::query_scalar(MODCOUNT_SQL)
                .bind(oid_param(relation.oid))
                .fetch_one(&self.pool)
                .await?;
            let lastddltimestamp: String = sqlx::query_scalar(LAST_DDL_SQL)
                .bind(oid_param(relation.oid))
                .fetch_one(&self.pool)
                .await?;
            counts.insert(
                relation.fqn(),
                AoEntry {
                    modcount: u64::try_from(modcount).unwrap_or_default(),
                    lastddltimestamp,
                },
            );
        }
        Ok(counts)
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn copy_to_segments(&self, relation: &Relation, pipes: &PipeSet) -> Result<u64> {
        let sql = copy_statement(
            &relation.fqn(),
            &relation.attribute_string(),
            true,
            &backup_program(&pipes.pipe_template, relation.oid),
        );
        tracing::debug!(table = %relation.fqn(), "Copying table to segments");
        let done = sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn copy_from_segments(
        &self,
        fqn: &str,
        attributes: &str,
        pipes: &PipeSet,
        options: &CopyOptions,
    ) -> Result<u64> {
        let program = restore_program(
            &pipes.pipe_template,
            pipes.oid,
            pipes.batches,
            pipes.watcher.poll_interval().as_secs_f64(),
        );
        let sql = copy_statement(fqn, attributes, false, &program);
        let mut conn = self.pool.acquire().await?;
        if options.resize {
            (&mut *conn)
                .execute("SET gp_enable_segment_copy_checking TO off")
                .await?;
        }
        let result = (&mut *conn).execute(sql.as_str()).await;
        if options.resize {
            (&mut *conn)
                .execute("RESET gp_enable_segment_copy_checking")
                .await?;
        }
        Ok(result?.rows_affected())
    }

    async fn truncate(&self, fqn: &str) -> Result<()> {
        self.execute(&format!("TRUNCATE TABLE {fqn};")).await
    }

    async fn analyze(&self, fqn: &str) -> Result<()> {
        self.execute(&format!("ANALYZE {fqn};")).await
    }

    async fn analyze_root_partition(&self, fqn: &str) -> Result<()> {
        self.execute(&format!("ANALYZE ROOTPARTITION {fqn};")).await
    }

    async fn redistribute(&self, fqn: &str, numsegments: usize, replicated: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        (&mut *tx)
            .execute("SET LOCAL allow_system_table_mods TO true")
            .await?;
        sqlx::query("UPDATE gp_distribution_policy SET numsegments = $1 WHERE localoid = $2::regclass")
            .bind(i32::try_from(numsegments).unwrap_or(i32::MAX))
            .bind(fqn)
            .execute(&mut *tx)
            .await?;
        if !replicated {
            let reorganize = format!("ALTER TABLE {fqn} SET WITH (REORGANIZE=true);");
            (&mut *tx).execute(reorganize.as_str()).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Opens pools against the coordinator from the `pg_*` settings.
pub struct PgConnector {
    options: PgConnectOptions,
    max_connections: u32,
}

impl PgConnector {
    /// `jobs` concurrent copies plus one connection for metadata.
    pub fn new(settings: &Settings, jobs: usize) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&settings.pg_host)
            .port(settings.pg_port)
            .username(&settings.pg_user)
            .application_name("gpbackup");
        if let Some(password) = &settings.pg_password {
            options = options.password(password);
        }
        Self {
            options,
            max_connections: u32::try_from(jobs).unwrap_or(u32::MAX).saturating_add(1),
        }
    }

    async fn pool(&self, dbname: &str) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(self.options.clone().database(dbname))
            .await
            .map_err(|e| CoordinatorError::Database(format!("cannot connect to database \"{dbname}\": {e}")))?;
        Ok(pool)
    }
}

#[async_trait]
impl DatabaseConnector for PgConnector {
    async fn connect(&self, dbname: &str) -> Result<Arc<dyn Database>> {
        tracing::debug!(database = %dbname, "Connecting");
        Ok(Arc::new(PgDatabase::new(self.pool(dbname).await?)))
    }

    async fn create_database(&self, dbname: &str) -> Result<()> {
        let pool = self.pool(crate::restore::MAINTENANCE_DB).await?;
        sqlx::raw_sql(&format!("CREATE DATABASE {};", quote_ident(dbname)))
            .execute(&pool)
            .await?;
        pool.close().await;
        Ok(())
    }
}
