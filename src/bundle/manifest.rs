use std::collections::{BTreeSet, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BundleDefect, MigrationError, MigrationResult};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Table and column names travel between environments and end up in SQL, so
/// only plain identifiers are accepted.
pub fn valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

pub fn bytes_sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub column: String,
    pub references: String,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableManifest {
    pub name: String,
    pub business_key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_columns: Vec<String>,
}

impl TableManifest {
    pub fn new(name: impl Into<String>, business_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            business_key: business_key.into(),
            foreign_keys: Vec::new(),
            file_columns: Vec::new(),
        }
    }

    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        references: impl Into<String>,
        nullable: bool,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references: references.into(),
            nullable,
        });
        self
    }

    pub fn with_file_column(mut self, column: impl Into<String>) -> Self {
        self.file_columns.push(column.into());
        self
    }

    pub fn foreign_key(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }

    pub fn is_file_column(&self, column: &str) -> bool {
        self.file_columns.iter().any(|c| c == column)
    }

    /// Columns that are copied verbatim: neither foreign keys nor file links.
    pub fn is_plain_column(&self, column: &str) -> bool {
        self.foreign_key(column).is_none() && !self.is_file_column(column)
    }
}

/// Tables of a bundle in dependency order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub tables: Vec<TableManifest>,
}

impl Manifest {
    pub fn new(tables: Vec<TableManifest>) -> Self {
        Self { tables }
    }

    pub fn table(&self, name: &str) -> Option<&TableManifest> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.name == name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    pub fn validate(&self) -> Vec<BundleDefect> {
        let mut defects = Vec::new();
        let mut seen = HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                defects.push(BundleDefect::DuplicateTable {
                    table: table.name.clone(),
                });
            }
            let columns = std::iter::once(&table.name)
                .chain(std::iter::once(&table.business_key))
                .chain(table.foreign_keys.iter().map(|fk| &fk.column))
                .chain(table.file_columns.iter());
            for name in columns {
                if !valid_identifier(name) {
                    defects.push(BundleDefect::InvalidIdentifier { name: name.clone() });
                }
            }
        }
        for table in &self.tables {
            for fk in &table.foreign_keys {
                if !seen.contains(fk.references.as_str()) {
                    defects.push(BundleDefect::UnknownReferenceTable {
                        table: table.name.clone(),
                        column: fk.column.clone(),
                        references: fk.references.clone(),
                    });
                }
            }
        }
        defects
    }

    /// The named tables plus every table they reference, transitively, kept
    /// in manifest order.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> MigrationResult<Manifest> {
        let mut wanted: BTreeSet<String> = BTreeSet::new();
        let mut pending: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        while let Some(name) = pending.pop() {
            if wanted.contains(&name) {
                continue;
            }
            let table = self.table(&name).ok_or_else(|| {
                MigrationError::malformed(BundleDefect::UndeclaredTable {
                    table: name.clone(),
                })
            })?;
            pending.extend(table.foreign_keys.iter().map(|fk| fk.references.clone()));
            wanted.insert(name);
        }
        Ok(Manifest::new(
            self.tables
                .iter()
                .filter(|t| wanted.contains(&t.name))
                .cloned()
                .collect(),
        ))
    }
}
