//! Cross-environment configuration migration.
//!
//! Configuration objects are exported from one deployment as a bundle keyed
//! by business keys and re-imported into another, where every foreign key is
//! re-resolved against the target's own surrogate ids inside a single
//! transaction.

pub mod bundle;
pub mod cache;
pub mod codec;
pub mod config;
pub mod db;
pub mod endpoint;
pub mod error;
pub mod export;
pub mod import;
pub mod logging;
pub mod migrate;
pub mod preferences;
pub mod store;

pub use bundle::{Attachment, Bundle, ColumnValue, CorrelationKey, Manifest, Record, TableManifest};
pub use cache::{CacheSignal, DomainCache, LogCacheSignal};
pub use config::MigrationConfig;
pub use endpoint::UploadResponse;
pub use error::{AppError, AppResult, MigrationError, MigrationResult};
pub use import::{
    ImportCoordinator, ImportFailure, ImportLogic, ImportSummary, MigrationContext,
    PreferenceImport, ReferenceDataImport, RulesFrameworkImport,
};
pub use store::{SqliteStore, TargetStore, TransactionalStore};
