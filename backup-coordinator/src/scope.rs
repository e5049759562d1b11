//! Which schemas and relations a run touches, and where they land.
//!
//! Filters come from `--include-*`/`--exclude-*` flags and their `-file`
//! variants. `--redirect-schema` moves every in-scope object into one target
//! schema by rewriting its qualified names.

use crate::error::{CoordinatorError, Result};
use crate::toc::{DataEntry, MetadataEntry, Section, TocFilter};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilters {
    pub include_schemas: Vec<String>,
    pub exclude_schemas: Vec<String>,
    pub include_relations: Vec<String>,
    pub exclude_relations: Vec<String>,
}

impl ScopeFilters {
    /// Append the non-empty lines of a filter file to `target`.
    pub fn extend_from_file(target: &mut Vec<String>, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordinatorError::ScopeFilter(format!(
                "Cannot read filter file {}: {}",
                path.display(),
                e
            ))
        })?;
        target.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from),
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scope {
    include_schemas: BTreeSet<String>,
    exclude_schemas: BTreeSet<String>,
    include_relations: BTreeSet<String>,
    exclude_relations: BTreeSet<String>,
    redirect_schema: Option<String>,
}

fn check_exclusive(a: &[String], a_flag: &str, b: &[String], b_flag: &str) -> Result<()> {
    if !a.is_empty() && !b.is_empty() {
        return Err(CoordinatorError::ScopeFilter(format!(
            "{a_flag} and {b_flag} cannot be used together"
        )));
    }
    Ok(())
}

impl Scope {
    pub fn new(filters: ScopeFilters, redirect_schema: Option<String>) -> Result<Self> {
        check_exclusive(
            &filters.include_schemas,
            "--include-schema",
            &filters.exclude_schemas,
            "--exclude-schema",
        )?;
        check_exclusive(
            &filters.include_schemas,
            "--include-schema",
            &filters.include_relations,
            "--include-table",
        )?;
        check_exclusive(
            &filters.include_relations,
            "--include-table",
            &filters.exclude_relations,
            "--exclude-table",
        )?;

        for fqn in filters
            .include_relations
            .iter()
            .chain(filters.exclude_relations.iter())
        {
            if !is_qualified(fqn) {
                return Err(CoordinatorError::ScopeFilter(format!(
                    "Table {fqn} is not fully qualified: expected schema.table"
                )));
            }
        }

        if let Some(target) = &redirect_schema {
            if filters.include_schemas.is_empty() && filters.include_relations.is_empty() {
                return Err(CoordinatorError::ScopeFilter(
                    "--redirect-schema requires --include-table, --include-table-file, --include-schema or --include-schema-file".into(),
                ));
            }
            if target.is_empty() || target.contains('.') {
                return Err(CoordinatorError::ScopeFilter(format!(
                    "Invalid redirect schema name {target:?}"
                )));
            }
        }

        Ok(Self {
            include_schemas: filters.include_schemas.into_iter().collect(),
            exclude_schemas: filters.exclude_schemas.into_iter().collect(),
            include_relations: filters.include_relations.into_iter().collect(),
            exclude_relations: filters.exclude_relations.into_iter().collect(),
            redirect_schema,
        })
    }

    pub fn unfiltered() -> Self {
        Self::default()
    }

    /// Filter lists as recorded in a backup config, sorted.
    pub fn filters(&self) -> ScopeFilters {
        ScopeFilters {
            include_schemas: self.include_schemas.iter().cloned().collect(),
            exclude_schemas: self.exclude_schemas.iter().cloned().collect(),
            include_relations: self.include_relations.iter().cloned().collect(),
            exclude_relations: self.exclude_relations.iter().cloned().collect(),
        }
    }

    pub fn is_filtered(&self) -> bool {
        !(self.include_schemas.is_empty()
            && self.exclude_schemas.is_empty()
            && self.include_relations.is_empty()
            && self.exclude_relations.is_empty())
    }

    pub fn has_relation_include(&self) -> bool {
        !self.include_relations.is_empty()
    }

    pub fn redirect_schema(&self) -> Option<&str> {
        self.redirect_schema.as_deref()
    }

    pub fn includes_schema(&self, schema: &str) -> bool {
        if self.exclude_schemas.contains(schema) {
            return false;
        }
        if !self.include_schemas.is_empty() {
            return self.include_schemas.contains(schema);
        }
        if !self.include_relations.is_empty() {
            return self
                .include_relations
                .iter()
                .any(|fqn| fqn.split_once('.').map(|(s, _)| s) == Some(schema));
        }
        true
    }

    /// `partition_root` is the qualified root of a leaf partition; including
    /// the root includes its leaves.
    pub fn includes_relation(&self, schema: &str, name: &str, partition_root: Option<&str>) -> bool {
        let fqn = format!("{schema}.{name}");
        if self.exclude_schemas.contains(schema) || self.exclude_relations.contains(&fqn) {
            return false;
        }
        if let Some(root) = partition_root {
            if self.exclude_relations.contains(root) {
                return false;
            }
        }
        if !self.include_relations.is_empty() {
            return self.include_relations.contains(&fqn)
                || partition_root.is_some_and(|root| self.include_relations.contains(root));
        }
        if !self.include_schemas.is_empty() {
            return self.include_schemas.contains(schema);
        }
        true
    }

    /// Include-table names that match nothing in `known`.
    pub fn missing_relations<'a>(&'a self, known: &BTreeSet<String>) -> Vec<&'a str> {
        self.include_relations
            .iter()
            .filter(|fqn| !known.contains(*fqn))
            .map(String::as_str)
            .collect()
    }

    pub fn target_schema<'a>(&'a self, schema: &'a str) -> &'a str {
        self.redirect_schema.as_deref().unwrap_or(schema)
    }

    pub fn target_fqn(&self, schema: &str, name: &str) -> String {
        format!("{}.{}", self.target_schema(schema), name)
    }

    /// Statement to run for an in-scope entry: with a redirect, every
    /// reference to an included schema points at the target schema.
    pub fn rewrite(&self, entry: &MetadataEntry, sql: &str) -> String {
        let Some(target) = self.redirect_schema.as_deref() else {
            return sql.to_string();
        };
        let mut schemas: BTreeSet<&str> = BTreeSet::new();
        if !entry.schema.is_empty() {
            schemas.insert(entry.schema.as_str());
        }
        if let Some((schema, _)) = entry.relation() {
            schemas.insert(schema);
        }
        schemas
            .into_iter()
            .filter(|s| self.includes_schema(s))
            .fold(sql.to_string(), |text, schema| {
                rewrite_schema(&text, schema, target)
            })
    }
}

impl TocFilter for Scope {
    fn keep_data(&self, entry: &DataEntry) -> bool {
        let root = (!entry.partitionroot.is_empty()).then_some(entry.partitionroot.as_str());
        self.includes_relation(&entry.schema, &entry.name, root)
    }

    fn keep_metadata(&self, section: Section, entry: &MetadataEntry) -> bool {
        if section == Section::Global {
            return true;
        }
        if entry.objecttype == "SCHEMA" {
            return self.redirect_schema.is_none() && self.includes_schema(&entry.name);
        }
        match entry.relation() {
            Some((schema, name)) => self.includes_relation(schema, name, None),
            None => self.include_relations.is_empty() && self.includes_schema(&entry.schema),
        }
    }
}

fn is_qualified(fqn: &str) -> bool {
    matches!(fqn.split_once('.'), Some((s, n)) if !s.is_empty() && !n.is_empty() && !n.contains('.'))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Replace `from.` and `"from".` qualifiers with `to.` where `from` is a
/// whole identifier.
pub fn rewrite_schema(sql: &str, from: &str, to: &str) -> String {
    let plain = format!("{from}.");
    let quoted = format!("\"{from}\".");
    let replacement = format!("{to}.");

    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    let mut prev: Option<char> = None;
    while !rest.is_empty() {
        let boundary = !prev.is_some_and(is_ident_char);
        let matched = if boundary && rest.starts_with(&quoted) {
            Some(quoted.len())
        } else if boundary && prev != Some('"') && rest.starts_with(&plain) {
            Some(plain.len())
        } else {
            None
        };
        match matched {
            Some(len) => {
                out.push_str(&replacement);
                rest = &rest[len..];
                prev = Some('.');
            }
            None => {
                let Some(c) = rest.chars().next() else { break };
                out.push(c);
                rest = &rest[c.len_utf8()..];
                prev = Some(c);
            }
        }
    }
    out
}
