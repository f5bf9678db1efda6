use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// A single structural problem found while decoding or assembling a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BundleDefect {
    #[error("unreadable archive: {detail}")]
    Archive { detail: String },
    #[error("bundle is missing section {section}")]
    MissingSection { section: String },
    #[error("failed to parse manifest: {detail}")]
    ManifestParse { detail: String },
    #[error("unsupported bundle format version {found} (supported {supported})")]
    UnsupportedFormatVersion { found: String, supported: String },
    #[error("invalid identifier {name:?}")]
    InvalidIdentifier { name: String },
    #[error("manifest declares table {table} more than once")]
    DuplicateTable { table: String },
    #[error("{table}.{column} references undeclared table {references}")]
    UnknownReferenceTable {
        table: String,
        column: String,
        references: String,
    },
    #[error("manifest declares table {table} but the bundle carries no data section for it")]
    MissingDataSection { table: String },
    #[error("data section for undeclared table {table}")]
    UndeclaredTable { table: String },
    #[error("{table} line {line}: {detail}")]
    DataParse {
        table: String,
        line: usize,
        detail: String,
    },
    #[error("digest mismatch for section {section}")]
    DigestMismatch { section: String },
    #[error("{table} declares {expected} records but carries {actual}")]
    CountMismatch {
        table: String,
        expected: u64,
        actual: u64,
    },
    #[error("{table} record #{position} has no business key in column {column}")]
    MissingBusinessKey {
        table: String,
        position: usize,
        column: String,
    },
    #[error("{table} {business_key:?} is missing foreign-key column {column}")]
    MissingForeignKeyColumn {
        table: String,
        business_key: String,
        column: String,
    },
    #[error("{table} {business_key:?} has null in non-nullable foreign-key column {column}")]
    NullForeignKey {
        table: String,
        business_key: String,
        column: String,
    },
    #[error("{table} {business_key:?} column {column} must carry a business key as text")]
    InvalidForeignKeyValue {
        table: String,
        business_key: String,
        column: String,
    },
    #[error("unreadable attachment entry {entry}: {detail}")]
    AttachmentEntry { entry: String, detail: String },
    #[error("attachment for {table} {business_key:?} column {column} has no matching record")]
    DanglingAttachment {
        table: String,
        business_key: String,
        column: String,
    },
    #[error("more than one attachment for {table} {business_key:?} column {column}")]
    DuplicateAttachment {
        table: String,
        business_key: String,
        column: String,
    },
    #[error("preference document: {detail}")]
    Markup { detail: String },
}

/// Where a duplicate business key was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateOrigin {
    /// The same key appears twice in one bundle table.
    Bundle,
    /// The target store holds more than one row for the key.
    Target,
    /// The target store rejected a write with a uniqueness violation.
    TargetConstraint,
}

impl fmt::Display for DuplicateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DuplicateOrigin::Bundle => "within the bundle",
            DuplicateOrigin::Target => "in the target",
            DuplicateOrigin::TargetConstraint => "rejected by a target uniqueness constraint",
        };
        f.write_str(label)
    }
}

/// One foreign-key occurrence: which record points where.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub table: String,
    pub record_key: String,
    pub column: String,
    pub target_table: String,
    pub business_key: String,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} column {} references {} {:?} which is neither in the bundle nor in the target",
            self.table, self.record_key, self.column, self.target_table, self.business_key
        )
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("malformed bundle ({} defect(s)): {}", .defects.len(), join(.defects))]
    MalformedBundle { defects: Vec<BundleDefect> },
    #[error("{} unresolved reference(s): {}", .references.len(), join(.references))]
    UnresolvedReference { references: Vec<Reference> },
    #[error("duplicate business key {business_key:?} for {table} {origin}")]
    DuplicateBusinessKey {
        table: String,
        business_key: String,
        origin: DuplicateOrigin,
    },
    #[error("failed to persist {subject}: {source}")]
    Persistence {
        subject: String,
        #[source]
        source: StoreError,
    },
    #[error("cannot link attachment {file_name} to {table} {business_key:?} column {column}: {reason}")]
    AttachmentLink {
        table: String,
        business_key: String,
        column: String,
        file_name: String,
        reason: String,
    },
    #[error("non-nullable references form a cycle: {}", .records.join(" -> "))]
    ReferenceCycle { records: Vec<String> },
    #[error("table {table} is not accepted by the {flavor} import")]
    TableNotAllowed { table: String, flavor: String },
    #[error("cannot export {table}: {detail}")]
    SourceData { table: String, detail: String },
    #[error("failed to encode bundle: {0}")]
    Encode(String),
}

pub type MigrationResult<T> = Result<T, MigrationError>;

impl MigrationError {
    pub fn malformed(defect: BundleDefect) -> Self {
        MigrationError::MalformedBundle {
            defects: vec![defect],
        }
    }

    pub fn persistence(subject: impl Into<String>, source: StoreError) -> Self {
        MigrationError::Persistence {
            subject: subject.into(),
            source,
        }
    }

    /// Maps a store failure while writing `table`/`business_key`, surfacing
    /// uniqueness violations as duplicate keys.
    pub fn from_write(table: &str, business_key: &str, source: StoreError) -> Self {
        if source.is_unique_violation() {
            MigrationError::DuplicateBusinessKey {
                table: table.to_string(),
                business_key: business_key.to_string(),
                origin: DuplicateOrigin::TargetConstraint,
            }
        } else {
            MigrationError::persistence(format!("{table} {business_key:?}"), source)
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            MigrationError::MalformedBundle { .. } => "IMPORT/MALFORMED_BUNDLE",
            MigrationError::UnresolvedReference { .. } => "IMPORT/UNRESOLVED_REFERENCE",
            MigrationError::DuplicateBusinessKey { .. } => "IMPORT/DUPLICATE_BUSINESS_KEY",
            MigrationError::Persistence { .. } => "IMPORT/PERSISTENCE",
            MigrationError::AttachmentLink { .. } => "IMPORT/ATTACHMENT_LINK",
            MigrationError::ReferenceCycle { .. } => "IMPORT/REFERENCE_CYCLE",
            MigrationError::TableNotAllowed { .. } => "IMPORT/TABLE_NOT_ALLOWED",
            MigrationError::SourceData { .. } => "EXPORT/SOURCE_DATA",
            MigrationError::Encode(_) => "EXPORT/ENCODE",
        }
    }

    /// One line per offending record, attachment or defect.
    pub fn offenders(&self) -> Vec<String> {
        match self {
            MigrationError::MalformedBundle { defects } => {
                defects.iter().map(ToString::to_string).collect()
            }
            MigrationError::UnresolvedReference { references } => {
                references.iter().map(ToString::to_string).collect()
            }
            MigrationError::ReferenceCycle { records } => records.clone(),
            other => vec![other.to_string()],
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
