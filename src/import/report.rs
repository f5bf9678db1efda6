use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use super::{ImportFailure, ImportSummary, MigrationContext};

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
enum Outcome<'a> {
    Committed {
        summary: &'a ImportSummary,
    },
    #[serde(rename_all = "camelCase")]
    RolledBack {
        code: &'static str,
        error: String,
        report: &'a [String],
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportReportFile<'a> {
    generated_at: String,
    context: &'a MigrationContext,
    flavor: &'a str,
    bundle_path: String,
    outcome: Outcome<'a>,
}

/// Writes `import-YYYYMMDD-HHMMSS-<run>.json` into `reports_dir` and returns
/// its path.
pub fn write_import_report(
    reports_dir: &Path,
    ctx: &MigrationContext,
    flavor: &str,
    bundle_path: &Path,
    outcome: &Result<ImportSummary, ImportFailure>,
) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .with_context(|| format!("create reports directory {}", reports_dir.display()))?;

    let run = ctx.run_id.simple().to_string();
    let file_name = format!(
        "{}-{}.json",
        Utc::now().format("import-%Y%m%d-%H%M%S"),
        &run[run.len() - 8..]
    );
    let path = reports_dir.join(file_name);
    let payload = ImportReportFile {
        generated_at: Utc::now().to_rfc3339(),
        context: ctx,
        flavor,
        bundle_path: bundle_path.display().to_string(),
        outcome: match outcome {
            Ok(summary) => Outcome::Committed { summary },
            Err(failure) => Outcome::RolledBack {
                code: failure.error.code(),
                error: failure.error.to_string(),
                report: &failure.report,
            },
        },
    };
    let json = serde_json::to_string_pretty(&payload).context("serialize import report")?;
    fs::write(&path, json).with_context(|| format!("write import report {}", path.display()))?;
    Ok(path)
}
