//! GT-031: Run report store. Reports are fingerprinted, saved atomically and reloaded.
//!
//! Reports land in `<report_dir>/<run_id>.json`; `last.json` always holds a
//! copy of the most recent one for `gantry status`.

use super::error::{Error, Result};
use super::types::*;
use chrono::Utc;
use std::path::{Path, PathBuf};

const LAST_REPORT: &str = "last.json";

/// Fingerprint the raw config text. Returns `"blake3:{hex}"`.
pub fn config_fingerprint(content: &str) -> String {
    format!("blake3:{}", blake3::hash(content.as_bytes()).to_hex())
}

/// A pending report for a run about to start.
pub fn new_report(
    name: &str,
    action: Action,
    what_if: bool,
    environment: &Environment,
    config_hash: &str,
) -> RunReport {
    let started_at = Utc::now();
    let seed = format!(
        "{}:{}:{}",
        config_hash,
        started_at.timestamp_nanos_opt().unwrap_or_default(),
        std::process::id()
    );
    let short = blake3::hash(seed.as_bytes()).to_hex();
    RunReport {
        run_id: format!("{}-{}", started_at.format("%Y%m%dT%H%M%SZ"), &short[..8]),
        name: name.to_string(),
        action,
        what_if,
        environment: environment.name().to_string(),
        environment_source: environment.source(),
        config_hash: config_hash.to_string(),
        state: RunState::Pending,
        started_at,
        finished_at: None,
        results: Vec::new(),
    }
}

pub fn report_path(report_dir: &Path, run_id: &str) -> PathBuf {
    report_dir.join(format!("{}.json", run_id))
}

/// Save a report and refresh `last.json`, each via temp file + rename.
pub fn save_report(report_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    std::fs::create_dir_all(report_dir).map_err(|e| Error::io(report_dir, e))?;
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| Error::Internal(format!("cannot serialize report: {}", e)))?;

    let path = report_path(report_dir, &report.run_id);
    write_atomic(&path, &json)?;
    write_atomic(&report_dir.join(LAST_REPORT), &json)?;
    Ok(path)
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content).map_err(|e| Error::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| Error::io(path, e))
}

pub fn load_report(path: &Path) -> Result<RunReport> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Internal(format!("invalid report {}: {}", path.display(), e)))
}

/// The most recent report, if any run has been recorded.
pub fn load_last(report_dir: &Path) -> Result<Option<RunReport>> {
    let path = report_dir.join(LAST_REPORT);
    if !path.exists() {
        return Ok(None);
    }
    load_report(&path).map(Some)
}
