use crate::config::BenchConfig;
use crate::suite::SuiteReport;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "run_manifest.json";
const MANIFEST_SCHEMA_VERSION: &str = "bench_manifest_v1";

pub fn write_run_manifest(
    config: &BenchConfig,
    report: &SuiteReport,
    started_at: DateTime<Utc>,
) -> Result<PathBuf> {
    let payload = json!({
        "schema_version": MANIFEST_SCHEMA_VERSION,
        "runner_version": concat!("rust-", env!("CARGO_PKG_VERSION")),
        "started_at": started_at.to_rfc3339(),
        "finished_at": Utc::now().to_rfc3339(),
        "config_digest": config.digest()?,
        "config": config,
        "totals": {
            "tasks": report.tasks(),
            "completed": report.completed(),
            "failed": report.failed(),
            "aborted_passes": report.aborted(),
        },
        "passes": report.passes,
    });
    let path = config.results_dir.join(MANIFEST_FILE);
    atomic_write_json_pretty(&path, &payload)?;
    Ok(path)
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}
