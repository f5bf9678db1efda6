use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use cfg_migrate::codec::{self, encode_preferences};
use cfg_migrate::config::MigrationConfig;
use cfg_migrate::db::{open_pool, write_atomic};
use cfg_migrate::export::export_bundle;
use cfg_migrate::import::write_import_report;
use cfg_migrate::preferences::export_preferences;
use cfg_migrate::store::{SqliteStore, StoreTransaction, TransactionalStore};
use cfg_migrate::{
    logging, migrate, AppError, AppResult, ImportCoordinator, ImportLogic, LogCacheSignal,
    MigrationContext, PreferenceImport, ReferenceDataImport, RulesFrameworkImport,
    UploadResponse,
};

/// Exit code for an import that was rolled back.
const IMPORT_FAILED_EXIT_CODE: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "cfg-migrate",
    about = "Move configuration between environments by business key",
    version
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Database path; overrides CFG_MIGRATE_DB and the configuration
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Flavor {
    Rules,
    Reference,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending engine schema migrations.
    Migrate,
    /// Export configured tables into a bundle archive.
    Export {
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
        /// Export only these tables and the tables they reference
        #[arg(long = "table", value_name = "TABLE")]
        tables: Vec<String>,
    },
    /// Import a bundle archive in one transaction.
    Import {
        file: PathBuf,
        #[arg(long, value_enum, default_value = "rules")]
        flavor: Flavor,
        #[arg(long, value_name = "NAME")]
        operator: Option<String>,
    },
    /// Export system preferences as a markup document.
    ExportPrefs {
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
        /// Preference names; every stored preference when omitted
        #[arg(long = "name", value_name = "NAME")]
        names: Vec<String>,
    },
    /// Import a preference markup document.
    ImportPrefs {
        file: PathBuf,
        #[arg(long, value_name = "NAME")]
        operator: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match MigrationConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", AppError::from(err));
            process::exit(1);
        }
    };
    let guard = match logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    };

    let code = match run(cli, config).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(target: "cfg_migrate", event = "cli_error", code = %err.code(), error = %err);
            eprintln!("Error: {err}");
            1
        }
    };
    drop(guard);
    process::exit(code);
}

async fn run(cli: Cli, config: MigrationConfig) -> AppResult<i32> {
    let db_path = config.database_path(cli.db.as_deref());
    match cli.command {
        Command::Migrate => {
            let pool = open_pool(&db_path).await?;
            let applied = migrate::apply_migrations(&pool).await?;
            pool.close().await;
            print_json(&json!({ "database": db_path, "applied": applied }))?;
            Ok(0)
        }
        Command::Export { out, tables } => {
            let store = open_store(&db_path, &config).await?;
            let manifest = if tables.is_empty() {
                config.manifest()
            } else {
                config.manifest().subset(&tables)?
            };
            let mut tx = store.begin().await?;
            let exported = export_bundle(&mut tx, &manifest).await;
            tx.rollback().await?;
            let bundle = exported?;
            let bytes = codec::encode(&bundle)?;
            write_output(&out, &bytes)?;
            print_json(&json!({
                "out": out,
                "tables": manifest.tables.len(),
                "records": bundle.records().len(),
                "attachments": bundle.attachments().len(),
            }))?;
            Ok(0)
        }
        Command::Import {
            file,
            flavor,
            operator,
        } => {
            let store = open_store(&db_path, &config).await?;
            match flavor {
                Flavor::Rules => {
                    let logic = RulesFrameworkImport::from_config(&config);
                    run_import(&store, &config, &logic, &file, operator).await
                }
                Flavor::Reference => {
                    let logic = ReferenceDataImport::from_config(&config);
                    run_import(&store, &config, &logic, &file, operator).await
                }
            }
        }
        Command::ExportPrefs { out, names } => {
            let store = open_store(&db_path, &config).await?;
            let mut tx = store.begin().await?;
            let exported = export_preferences(&mut tx, &names).await;
            tx.rollback().await?;
            let preferences = exported?;
            write_output(&out, &encode_preferences(&preferences)?)?;
            print_json(&json!({ "out": out, "preferences": preferences.len() }))?;
            Ok(0)
        }
        Command::ImportPrefs { file, operator } => {
            let store = open_store(&db_path, &config).await?;
            let logic = PreferenceImport::from_config(&config);
            run_import(&store, &config, &logic, &file, operator).await
        }
    }
}

async fn open_store(db_path: &Path, config: &MigrationConfig) -> AppResult<SqliteStore> {
    let pool = open_pool(db_path).await?;
    migrate::apply_migrations(&pool).await?;
    Ok(SqliteStore::new(pool).with_surrogate_column(config.database.surrogate_column.clone())?)
}

async fn run_import<L: ImportLogic>(
    store: &SqliteStore,
    config: &MigrationConfig,
    logic: &L,
    file: &Path,
    operator: Option<String>,
) -> AppResult<i32> {
    let payload = fs::read(file).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_bundle")
            .with_context("path", file.display().to_string())
    })?;
    let operator = operator
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "cli".to_string());
    let ctx = MigrationContext::new(operator);
    let outcome = ImportCoordinator::new(store, &LogCacheSignal)
        .import_bundle(&ctx, logic, &payload)
        .await;

    let report = write_import_report(&config.reports.directory, &ctx, logic.name(), file, &outcome)
        .map_err(|err| AppError::from(err).with_context("operation", "write_report"))?;
    tracing::info!(target: "cfg_migrate", event = "import_report", path = %report.display());

    let response = UploadResponse::from_outcome(&outcome);
    print_json(&response)?;
    Ok(if response.is_success() {
        0
    } else {
        IMPORT_FAILED_EXIT_CODE
    })
}

fn write_output(path: &Path, bytes: &[u8]) -> AppResult<()> {
    write_atomic(path, bytes).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_output")
            .with_context("path", path.display().to_string())
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
