//! In-memory model of an exported configuration bundle.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BundleDefect, DuplicateOrigin, MigrationError, MigrationResult};

mod manifest;

pub use manifest::{bytes_sha256, valid_identifier, ForeignKey, Manifest, TableManifest};

/// A typed column value as carried between environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(#[serde(with = "base64_bytes")] Vec<u8>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ColumnValue::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::Text(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Integer(value)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ColumnValue::Null)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Column name to value, in lexical column order.
pub type Values = BTreeMap<String, ColumnValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub table: String,
    pub values: Values,
}

impl Record {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: Values::new(),
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn business_key<'a>(&'a self, table: &TableManifest) -> Option<&'a str> {
        self.values
            .get(&table.business_key)
            .and_then(ColumnValue::as_text)
            .filter(|key| !key.is_empty())
    }
}

/// Identifies the record cell an attachment belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey {
    pub table: String,
    pub business_key: String,
    pub column: String,
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} column {}", self.table, self.business_key, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub correlation: CorrelationKey,
    pub file_name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn sha256(&self) -> String {
        bytes_sha256(&self.bytes)
    }
}

/// Records grouped in manifest table order plus their attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    manifest: Manifest,
    records: Vec<Record>,
    attachments: Vec<Attachment>,
}

impl Bundle {
    /// Validates the parts and orders records by manifest table position,
    /// keeping the relative order within a table.
    pub fn new(
        manifest: Manifest,
        mut records: Vec<Record>,
        attachments: Vec<Attachment>,
    ) -> MigrationResult<Self> {
        let mut defects = manifest.validate();
        if defects.is_empty() {
            defects = content_defects(&manifest, &records, &attachments);
        }
        if !defects.is_empty() {
            return Err(MigrationError::MalformedBundle { defects });
        }
        check_unique_keys(&manifest, &records)?;

        records.sort_by_key(|r| manifest.position(&r.table).unwrap_or(usize::MAX));
        Ok(Self {
            manifest,
            records,
            attachments,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn records_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Record> + 'a {
        self.records.iter().filter(move |r| r.table == table)
    }

    /// Business key of a record that passed construction.
    pub fn key_of<'a>(&self, record: &'a Record) -> &'a str {
        self.manifest
            .table(&record.table)
            .and_then(|t| record.business_key(t))
            .unwrap_or_default()
    }

    pub fn contains_key(&self, table: &str, business_key: &str) -> bool {
        self.records_for(table)
            .any(|r| self.key_of(r) == business_key)
    }
}

/// Record and attachment level defects against an already valid manifest.
pub(crate) fn content_defects(
    manifest: &Manifest,
    records: &[Record],
    attachments: &[Attachment],
) -> Vec<BundleDefect> {
    let mut defects = Vec::new();
    let mut keys: HashSet<(&str, &str)> = HashSet::new();
    for (position, record) in records.iter().enumerate() {
        let Some(table) = manifest.table(&record.table) else {
            defects.push(BundleDefect::UndeclaredTable {
                table: record.table.clone(),
            });
            continue;
        };
        for column in record.values.keys() {
            if !valid_identifier(column) {
                defects.push(BundleDefect::InvalidIdentifier {
                    name: column.clone(),
                });
            }
        }
        let Some(key) = record.business_key(table) else {
            defects.push(BundleDefect::MissingBusinessKey {
                table: table.name.clone(),
                position,
                column: table.business_key.clone(),
            });
            continue;
        };
        keys.insert((table.name.as_str(), key));
        for fk in &table.foreign_keys {
            let defect = match record.values.get(&fk.column) {
                None => Some(BundleDefect::MissingForeignKeyColumn {
                    table: table.name.clone(),
                    business_key: key.to_string(),
                    column: fk.column.clone(),
                }),
                Some(ColumnValue::Null) if !fk.nullable => Some(BundleDefect::NullForeignKey {
                    table: table.name.clone(),
                    business_key: key.to_string(),
                    column: fk.column.clone(),
                }),
                Some(ColumnValue::Null) => None,
                Some(ColumnValue::Text(target)) if !target.is_empty() => None,
                Some(_) => Some(BundleDefect::InvalidForeignKeyValue {
                    table: table.name.clone(),
                    business_key: key.to_string(),
                    column: fk.column.clone(),
                }),
            };
            defects.extend(defect);
        }
    }

    let mut linked: HashSet<&CorrelationKey> = HashSet::new();
    for attachment in attachments {
        let c = &attachment.correlation;
        if !keys.contains(&(c.table.as_str(), c.business_key.as_str())) {
            defects.push(BundleDefect::DanglingAttachment {
                table: c.table.clone(),
                business_key: c.business_key.clone(),
                column: c.column.clone(),
            });
        } else if !linked.insert(c) {
            defects.push(BundleDefect::DuplicateAttachment {
                table: c.table.clone(),
                business_key: c.business_key.clone(),
                column: c.column.clone(),
            });
        }
    }
    defects
}

fn check_unique_keys(manifest: &Manifest, records: &[Record]) -> MigrationResult<()> {
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    for record in records {
        let key = manifest
            .table(&record.table)
            .and_then(|t| record.business_key(t))
            .unwrap_or_default();
        if !seen.insert((record.table.as_str(), key)) {
            return Err(MigrationError::DuplicateBusinessKey {
                table: record.table.clone(),
                business_key: key.to_string(),
                origin: DuplicateOrigin::Bundle,
            });
        }
    }
    Ok(())
}
