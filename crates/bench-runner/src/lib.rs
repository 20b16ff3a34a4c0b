#[cfg(not(unix))]
compile_error!("bench-runner relies on unix process groups and wait4");

pub mod config;
pub mod controller;
pub mod corpus;
pub mod error;
pub mod exec;
pub mod log;
pub mod manifest;
pub mod suite;

use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;

pub use config::{BenchConfig, ConfigurationSpec, Limits, MemorySource, SolverConfig};
pub use controller::{RepetitionController, RepetitionPolicy};
pub use error::BenchError;
pub use exec::{ProcessExecutor, TrialExecutor};
pub use log::ResultLog;
pub use suite::{plan_suite, run_suite, PassReport, SuitePlan, SuiteReport};

pub struct RunResult {
    pub report: SuiteReport,
    pub manifest_path: PathBuf,
}

pub fn run_benchmarks(config: &BenchConfig) -> Result<RunResult> {
    let started_at = Utc::now();
    let report = run_suite(config)?;
    let manifest_path = manifest::write_run_manifest(config, &report, started_at)?;
    Ok(RunResult {
        report,
        manifest_path,
    })
}
