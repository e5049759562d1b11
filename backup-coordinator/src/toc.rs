//! Table of contents codec.
//!
//! The TOC is YAML with four ordered metadata sections pointing into the
//! metadata (or statistics) SQL file by byte range, the per-table data
//! entries and the incremental state of append-optimized tables.
//!
//! A restore with filters reads it through [`Toc::deserialize_filtered`],
//! which drops out-of-scope entries while they stream past instead of
//! building the whole document first.

use crate::error::{CoordinatorError, Result};
use serde::de::{DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

pub const SESSION_GUCS: &str = "SESSION GUCS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Global,
    Predata,
    Postdata,
    Statistics,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub schema: String,
    pub name: String,
    pub objecttype: String,
    #[serde(default)]
    pub referenceobject: String,
    pub startbyte: u64,
    pub endbyte: u64,
}

impl MetadataEntry {
    /// Qualified name of the relation this entry belongs to, if any.
    pub fn relation(&self) -> Option<(&str, &str)> {
        if !self.referenceobject.is_empty() {
            return self.referenceobject.split_once('.');
        }
        match self.objecttype.as_str() {
            "TABLE" | "VIEW" | "SEQUENCE" | "MATERIALIZED VIEW" | "STATISTICS" => {
                Some((self.schema.as_str(), self.name.as_str()))
            }
            _ => None,
        }
    }

    pub fn display_name(&self) -> String {
        if self.schema.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub oid: u32,
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub attributestring: String,
    #[serde(default)]
    pub rowscopied: u64,
    #[serde(default)]
    pub partitionroot: String,
    #[serde(default)]
    pub isreplicated: bool,
}

impl DataEntry {
    pub fn fqn(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoEntry {
    pub modcount: u64,
    pub lastddltimestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalMetadata {
    #[serde(default)]
    pub ao: BTreeMap<String, AoEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toc {
    #[serde(default)]
    pub globalentries: Vec<MetadataEntry>,
    #[serde(default)]
    pub predataentries: Vec<MetadataEntry>,
    #[serde(default)]
    pub postdataentries: Vec<MetadataEntry>,
    #[serde(default)]
    pub statisticsentries: Vec<MetadataEntry>,
    #[serde(default)]
    pub dataentries: Vec<DataEntry>,
    #[serde(default)]
    pub incrementalmetadata: IncrementalMetadata,
}

/// Decides which entries a filtered read keeps.
pub trait TocFilter {
    fn keep_data(&self, entry: &DataEntry) -> bool;
    fn keep_metadata(&self, section: Section, entry: &MetadataEntry) -> bool;
}

impl Toc {
    pub fn entries(&self, section: Section) -> &[MetadataEntry] {
        match section {
            Section::Global => &self.globalentries,
            Section::Predata => &self.predataentries,
            Section::Postdata => &self.postdataentries,
            Section::Statistics => &self.statisticsentries,
        }
    }

    pub fn push(&mut self, section: Section, entry: MetadataEntry) {
        match section {
            Section::Global => self.globalentries.push(entry),
            Section::Predata => self.predataentries.push(entry),
            Section::Postdata => self.postdataentries.push(entry),
            Section::Statistics => self.statisticsentries.push(entry),
        }
    }

    pub fn data_entry(&self, oid: u32) -> Option<&DataEntry> {
        self.dataentries.iter().find(|e| e.oid == oid)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let toc: Toc =
            serde_yaml::from_slice(bytes).map_err(|e| CoordinatorError::CorruptToc(e.to_string()))?;
        toc.validate()?;
        Ok(toc)
    }

    /// Read only the entries `filter` keeps. Global entries are always kept.
    pub fn deserialize_filtered(bytes: &[u8], filter: &dyn TocFilter) -> Result<Self> {
        let de = serde_yaml::Deserializer::from_slice(bytes);
        let toc = TocSeed { filter }
            .deserialize(de)
            .map_err(|e| CoordinatorError::CorruptToc(e.to_string()))?;
        toc.validate()?;
        Ok(toc)
    }

    fn validate(&self) -> Result<()> {
        for section in [
            Section::Global,
            Section::Predata,
            Section::Postdata,
            Section::Statistics,
        ] {
            for entry in self.entries(section) {
                if entry.endbyte < entry.startbyte {
                    return Err(CoordinatorError::CorruptToc(format!(
                        "entry {} ends at {} before it starts at {}",
                        entry.display_name(),
                        entry.endbyte,
                        entry.startbyte
                    )));
                }
            }
        }
        Ok(())
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.serialize()?).await?;
        Ok(())
    }

    pub async fn read_from(path: &Path, filter: Option<&dyn TocFilter>) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        match filter {
            Some(filter) => Self::deserialize_filtered(&bytes, filter),
            None => Self::deserialize(&bytes),
        }
    }
}

struct TocSeed<'a> {
    filter: &'a dyn TocFilter,
}

impl<'de> DeserializeSeed<'de> for TocSeed<'_> {
    type Value = Toc;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Toc, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for TocSeed<'_> {
    type Value = Toc;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a table of contents mapping")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Toc, A::Error> {
        let mut toc = Toc::default();
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "globalentries" => toc.globalentries = map.next_value()?,
                "predataentries" => {
                    toc.predataentries = map.next_value_seed(FilteredSeq::metadata(self.filter, Section::Predata))?
                }
                "postdataentries" => {
                    toc.postdataentries = map.next_value_seed(FilteredSeq::metadata(self.filter, Section::Postdata))?
                }
                "statisticsentries" => {
                    toc.statisticsentries =
                        map.next_value_seed(FilteredSeq::metadata(self.filter, Section::Statistics))?
                }
                "dataentries" => toc.dataentries = map.next_value_seed(FilteredSeq::data(self.filter))?,
                "incrementalmetadata" => toc.incrementalmetadata = map.next_value()?,
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(toc)
    }
}

/// Sequence visitor that keeps only the elements the filter accepts.
struct FilteredSeq<'a, T> {
    keep: Box<dyn Fn(&T) -> bool + 'a>,
    _marker: PhantomData<T>,
}

impl<'a> FilteredSeq<'a, MetadataEntry> {
    fn metadata(filter: &'a dyn TocFilter, section: Section) -> Self {
        Self {
            keep: Box::new(move |e| filter.keep_metadata(section, e)),
            _marker: PhantomData,
        }
    }
}

impl<'a> FilteredSeq<'a, DataEntry> {
    fn data(filter: &'a dyn TocFilter) -> Self {
        Self {
            keep: Box::new(move |e| filter.keep_data(e)),
            _marker: PhantomData,
        }
    }
}

impl<'de, T: Deserialize<'de>> DeserializeSeed<'de> for FilteredSeq<'_, T> {
    type Value = Vec<T>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Vec<T>, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, T: Deserialize<'de>> Visitor<'de> for FilteredSeq<'_, T> {
    type Value = Vec<T>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a sequence of entries")
    }

    fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Vec<T>, E> {
        Ok(Vec::new())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Vec<T>, A::Error> {
        let mut kept = Vec::new();
        while let Some(item) = seq.next_element::<T>()? {
            if (self.keep)(&item) {
                kept.push(item);
            }
        }
        Ok(kept)
    }
}

/// Builds a metadata or statistics SQL file, recording each statement's
/// byte range in the entry it returns.
#[derive(Debug, Default)]
pub struct MetadataWriter {
    buf: Vec<u8>,
}

impl MetadataWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &mut self,
        schema: &str,
        name: &str,
        objecttype: &str,
        referenceobject: &str,
        statement: &str,
    ) -> MetadataEntry {
        if !self.buf.is_empty() {
            self.buf.extend_from_slice(b"\n\n");
        }
        let startbyte = self.buf.len() as u64;
        self.buf.extend_from_slice(statement.trim().as_bytes());
        let endbyte = self.buf.len() as u64;
        MetadataEntry {
            schema: schema.to_string(),
            name: name.to_string(),
            objecttype: objecttype.to_string(),
            referenceobject: referenceobject.to_string(),
            startbyte,
            endbyte,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        if !self.buf.is_empty() {
            self.buf.push(b'\n');
        }
        self.buf
    }
}

/// A statement sliced back out of a SQL file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub entry: MetadataEntry,
    pub sql: String,
}

/// Slice every entry's statement out of `sql`, in entry order.
pub fn read_statements(sql: &[u8], entries: &[MetadataEntry]) -> Result<Vec<Statement>> {
    entries
        .iter()
        .map(|entry| {
            let range = usize::try_from(entry.startbyte).ok().zip(usize::try_from(entry.endbyte).ok());
            let bytes = range
                .and_then(|(start, end)| sql.get(start..end))
                .ok_or_else(|| {
                    CoordinatorError::CorruptToc(format!(
                        "entry {} range {}..{} is outside the {}-byte SQL file",
                        entry.display_name(),
                        entry.startbyte,
                        entry.endbyte,
                        sql.len()
                    ))
                })?;
            let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
                CoordinatorError::CorruptToc(format!("entry {}: {}", entry.display_name(), e))
            })?;
            Ok(Statement {
                entry: entry.clone(),
                sql: text,
            })
        })
        .collect()
}
