use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use super::execute::{ImportReport, ImportStrategy};

#[derive(Serialize)]
struct ImportReportFile<'a> {
    generated_at: String,
    source_path: String,
    strategy: ImportStrategy,
    collisions: usize,
    report: &'a ImportReport,
}

/// Persist an import outcome as a timestamped JSON file under `reports_dir`.
pub fn write_import_report(
    reports_dir: &Path,
    source_path: &Path,
    collisions: usize,
    report: &ImportReport,
) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .with_context(|| format!("create reports directory {}", reports_dir.display()))?;

    let now = Utc::now();
    let path = reports_dir.join(now.format("import-%Y%m%d-%H%M%S%3f.json").to_string());
    let payload = ImportReportFile {
        generated_at: now.to_rfc3339(),
        source_path: source_path.display().to_string(),
        strategy: report.strategy,
        collisions,
        report,
    };
    let json = serde_json::to_string_pretty(&payload).context("serialize import report")?;
    fs::write(&path, json).with_context(|| format!("write import report {}", path.display()))?;
    Ok(path)
}
