use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::MigrationError;
use crate::store::TargetStore;

pub mod apply;
pub mod execute;
pub mod logic;
pub mod report;
pub mod resolver;
pub mod rewrite;
mod table_order;

pub use apply::ImportCoordinator;
pub use execute::apply_structured;
pub use logic::{PreferenceImport, ReferenceDataImport, RulesFrameworkImport};
pub use report::write_import_report;
pub use resolver::{BusinessKeyResolver, Resolved, ResolutionTable};
pub use rewrite::{ForeignKeyRewriter, RewrittenRecord};

/// What to do when the target holds more than one row for a business key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Fail the import with a duplicate business key error.
    #[default]
    Reject,
    /// Use the row with the lowest surrogate id and record a warning.
    FirstMatch,
}

/// Per-flavor rules for a structured import.
#[derive(Debug, Clone, Default)]
pub struct ImportPolicy {
    pub flavor: String,
    /// Tables the flavor accepts; `None` accepts any manifest table.
    pub allowed_tables: Option<BTreeSet<String>>,
    /// Tables where a missing referenced key may be created as a minimal
    /// placeholder row.
    pub placeholder_tables: BTreeSet<String>,
    pub duplicate_policy: DuplicatePolicy,
}

impl ImportPolicy {
    pub fn allows_placeholder(&self, table: &str) -> bool {
        self.placeholder_tables.contains(table)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TableImportSummary {
    pub created: u64,
    pub matched: u64,
    pub updated: u64,
    pub deleted: u64,
    pub placeholders: u64,
}

/// Outcome of a committed import. `matched` counts every record found in the
/// target; `updated` is the subset whose stored values changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub created: u64,
    pub matched: u64,
    pub updated: u64,
    pub deleted: u64,
    pub placeholders: u64,
    pub attachments_stored: u64,
    pub attachments_unchanged: u64,
    pub foreign_keys_rewritten: u64,
    pub tables: BTreeMap<String, TableImportSummary>,
    pub warnings: Vec<String>,
    pub log: Vec<String>,
}

impl ImportSummary {
    fn table_mut(&mut self, table: &str) -> &mut TableImportSummary {
        self.tables.entry(table.to_string()).or_default()
    }

    pub fn note_created(&mut self, table: &str) {
        self.created += 1;
        self.table_mut(table).created += 1;
    }

    pub fn note_matched(&mut self, table: &str) {
        self.matched += 1;
        self.table_mut(table).matched += 1;
    }

    pub fn note_updated(&mut self, table: &str) {
        self.updated += 1;
        self.table_mut(table).updated += 1;
    }

    pub fn note_deleted(&mut self, table: &str) {
        self.deleted += 1;
        self.table_mut(table).deleted += 1;
    }

    pub fn note_placeholder(&mut self, table: &str) {
        self.placeholders += 1;
        self.table_mut(table).placeholders += 1;
    }
}

/// Human-readable progress of one import run. Lines end up in the summary on
/// success and in the failure report otherwise.
#[derive(Debug, Clone, Default)]
pub struct ImportLog {
    lines: Vec<String>,
    warnings: Vec<String>,
}

impl ImportLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!(target: "cfg_migrate", event = "import_step", "{line}");
        self.lines.push(line);
    }

    pub fn warn(&mut self, line: impl Into<String>) {
        let line = line.into();
        warn!(target: "cfg_migrate", event = "import_warning", "{line}");
        self.lines.push(format!("warning: {line}"));
        self.warnings.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn into_parts(self) -> (Vec<String>, Vec<String>) {
        (self.lines, self.warnings)
    }
}

/// Explicit per-run context threaded through the coordinator, logs and
/// reports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationContext {
    pub run_id: Uuid,
    pub operator: String,
    pub started_at: String,
}

impl MigrationContext {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            operator: operator.into(),
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// A rolled-back import: the originating error plus the multi-line report
/// shown to the operator.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ImportFailure {
    #[source]
    pub error: MigrationError,
    pub report: Vec<String>,
}

impl ImportFailure {
    pub(crate) fn new(error: MigrationError, log: ImportLog) -> Self {
        let (mut report, _) = log.into_parts();
        report.push(format!("import failed, rolling back changes: {}", error.code()));
        report.extend(error.offenders().into_iter().map(|line| format!("  {line}")));
        Self { error, report }
    }

    pub fn report_text(&self) -> String {
        self.report.join("\n")
    }
}

/// One import flavor: how its payload is decoded, which cache domains it
/// touches and how it is applied inside the open transaction.
#[async_trait]
pub trait ImportLogic: Send + Sync {
    type Bundle: Send + Sync;

    fn name(&self) -> &'static str;

    fn decode(&self, payload: &[u8]) -> Result<Self::Bundle, MigrationError>;

    fn affected_domains(&self, bundle: &Self::Bundle) -> Vec<String>;

    async fn apply<S: TargetStore>(
        &self,
        store: &mut S,
        bundle: &Self::Bundle,
        log: &mut ImportLog,
    ) -> Result<ImportSummary, MigrationError>;
}
