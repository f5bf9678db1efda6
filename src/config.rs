//! TOML configuration for the CLI and the import flavors.
//!
//! Every section is optional; the defaults describe the bundled Rules
//! Framework schema.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bundle::{ForeignKey, Manifest, TableManifest};
use crate::import::DuplicatePolicy;
use crate::store::DEFAULT_SURROGATE_COLUMN;

pub const DB_ENV: &str = "CFG_MIGRATE_DB";
pub const DEFAULT_LOG_FILTER: &str = "cfg_migrate=info,sqlx=warn";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path}: {detail}")]
    Parse { path: String, detail: String },
    #[error("invalid [[tables]] manifest: {0}")]
    Manifest(String),
    #[error("table {table} in [{section}] is not declared in [[tables]]")]
    UnknownTable { section: &'static str, table: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub reports: ReportsConfig,
    pub import: ImportConfig,
    pub rules_framework: RulesFrameworkConfig,
    /// Export manifest in dependency order. Empty means the Rules Framework
    /// tables.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
    pub surrogate_column: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            surrogate_column: DEFAULT_SURROGATE_COLUMN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub filter: String,
    /// Daily rolling JSON log files are written here when set.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportsConfig {
    pub directory: PathBuf,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("reports"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportConfig {
    pub duplicate_policy: DuplicatePolicy,
    /// Reference-data tables where a missing referenced key may be created
    /// as a placeholder row.
    pub placeholder_tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RulesFrameworkConfig {
    pub tables: Vec<String>,
}

impl Default for RulesFrameworkConfig {
    fn default() -> Self {
        Self {
            tables: rules_framework_manifest()
                .table_names()
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    pub business_key: String,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyConfig>,
    #[serde(default)]
    pub file_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeignKeyConfig {
    pub column: String,
    pub references: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

fn default_true() -> bool {
    true
}

impl From<&TableConfig> for TableManifest {
    fn from(table: &TableConfig) -> Self {
        TableManifest {
            name: table.name.clone(),
            business_key: table.business_key.clone(),
            foreign_keys: table
                .foreign_keys
                .iter()
                .map(|fk| ForeignKey {
                    column: fk.column.clone(),
                    references: fk.references.clone(),
                    nullable: fk.nullable,
                })
                .collect(),
            file_columns: table.file_columns.clone(),
        }
    }
}

/// The bundled Rules Framework tables in dependency order. A workflow's
/// start state points forward at `rf_state`; it is filled once every record
/// has an id.
pub fn rules_framework_manifest() -> Manifest {
    Manifest::new(vec![
        TableManifest::new("rf_parameter_type", "c_code"),
        TableManifest::new("rf_lookup", "c_code"),
        TableManifest::new("rf_script", "c_code").with_file_column("c_source_file"),
        TableManifest::new("rf_script_parameter", "c_code")
            .with_foreign_key("id_parent", "rf_script", false)
            .with_foreign_key("c_type", "rf_parameter_type", true)
            .with_foreign_key("c_lookup", "rf_lookup", true),
        TableManifest::new("rf_workflow", "c_code").with_foreign_key(
            "c_start_state",
            "rf_state",
            true,
        ),
        TableManifest::new("rf_state", "c_code").with_foreign_key("id_parent", "rf_workflow", false),
        TableManifest::new("rf_transition", "c_code")
            .with_foreign_key("id_parent", "rf_state", false)
            .with_foreign_key("c_to_state", "rf_state", true),
        TableManifest::new("rf_workflow_effect", "c_code")
            .with_foreign_key("id_parent", "rf_transition", false)
            .with_foreign_key("c_script", "rf_script", true),
    ])
}

impl MigrationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|err| match err {
            ConfigError::Parse { detail, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                detail,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: MigrationConfig = toml::from_str(content).map_err(|err| ConfigError::Parse {
            path: "<inline>".to_string(),
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn manifest(&self) -> Manifest {
        if self.tables.is_empty() {
            rules_framework_manifest()
        } else {
            Manifest::new(self.tables.iter().map(TableManifest::from).collect())
        }
    }

    /// Explicit path, then `CFG_MIGRATE_DB`, then the configured path, then
    /// the per-user data directory.
    pub fn database_path(&self, explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Some(path) = std::env::var_os(DB_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(path);
        }
        if let Some(path) = &self.database.path {
            return path.clone();
        }
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("cfg-migrate")
            .join("cfg-migrate.sqlite3")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let manifest = self.manifest();
        let defects = manifest.validate();
        if !defects.is_empty() {
            let detail = defects
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ConfigError::Manifest(detail));
        }
        let sections = [
            ("rules_framework", &self.rules_framework.tables),
            ("import", &self.import.placeholder_tables),
        ];
        for (section, tables) in sections {
            if let Some(table) = tables.iter().find(|t| manifest.table(t).is_none()) {
                return Err(ConfigError::UnknownTable {
                    section,
                    table: table.clone(),
                });
            }
        }
        Ok(())
    }
}
