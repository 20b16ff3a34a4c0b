use crate::config::{BenchConfig, ConfigurationSpec, Limits, SolverConfig};
use crate::controller::RepetitionController;
use crate::corpus::{discover_inputs, discover_tracks, Track};
use crate::error::BenchError;
use crate::exec::ProcessExecutor;
use crate::log::ResultLog;
use anyhow::Result;
use bench_core::{BenchTask, BenchmarkRecord};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub track: String,
    pub configuration: String,
    pub log: PathBuf,
    pub tasks: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PassReport {
    fn new(config: &BenchConfig, track: &Track, configuration: &ConfigurationSpec) -> Self {
        Self {
            track: track.name.clone(),
            configuration: configuration.label.clone(),
            log: config
                .results_dir
                .join(&track.name)
                .join(configuration.log_name()),
            tasks: 0,
            completed: 0,
            failed: 0,
            error: None,
        }
    }

    pub fn aborted(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SuiteReport {
    pub passes: Vec<PassReport>,
}

impl SuiteReport {
    pub fn tasks(&self) -> usize {
        self.passes.iter().map(|p| p.tasks).sum()
    }

    pub fn completed(&self) -> usize {
        self.passes.iter().map(|p| p.completed).sum()
    }

    pub fn failed(&self) -> usize {
        self.passes.iter().map(|p| p.failed).sum()
    }

    pub fn aborted(&self) -> usize {
        self.passes.iter().filter(|p| p.aborted()).count()
    }
}

pub fn run_suite(config: &BenchConfig) -> Result<SuiteReport> {
    config.validate()?;
    let tracks = discover_tracks(&config.corpus.root, &config.corpus.tracks)?;
    if tracks.is_empty() {
        warn!("no tracks found under {}", config.corpus.root.display());
    }
    let parallel = config.parallel_configurations && config.configurations.len() > 1;
    if parallel {
        warn!(
            "running {} configurations concurrently; their timings will interfere",
            config.configurations.len()
        );
    }

    let mut report = SuiteReport::default();
    for track in &tracks {
        info!("--- Running benches on directory {}", track.name);
        if parallel {
            report.passes.extend(run_track_parallel(config, track));
        } else {
            for configuration in &config.configurations {
                report.passes.push(run_pass(config, track, configuration));
            }
        }
    }
    info!(
        tasks = report.tasks(),
        completed = report.completed(),
        failed = report.failed(),
        aborted = report.aborted(),
        "benchmark suite finished"
    );
    Ok(report)
}

fn run_track_parallel(config: &BenchConfig, track: &Track) -> Vec<PassReport> {
    thread::scope(|scope| {
        let handles: Vec<_> = config
            .configurations
            .iter()
            .map(|configuration| scope.spawn(move || run_pass(config, track, configuration)))
            .collect();
        handles
            .into_iter()
            .zip(&config.configurations)
            .map(|(handle, configuration)| {
                handle.join().unwrap_or_else(|_| {
                    let mut report = PassReport::new(config, track, configuration);
                    report.error = Some("configuration pass panicked".to_string());
                    report
                })
            })
            .collect()
    })
}

pub fn run_pass(
    config: &BenchConfig,
    track: &Track,
    configuration: &ConfigurationSpec,
) -> PassReport {
    let mut report = PassReport::new(config, track, configuration);
    let log_path = report.log.clone();
    if let Err(err) = execute_pass(config, track, configuration, &log_path, &mut report) {
        error!(
            track = %track.name,
            configuration = %configuration.label,
            "aborting configuration pass: {}",
            err
        );
        report.error = Some(err.to_string());
    }
    report
}

fn execute_pass(
    config: &BenchConfig,
    track: &Track,
    configuration: &ConfigurationSpec,
    log_path: &Path,
    report: &mut PassReport,
) -> Result<(), BenchError> {
    let inputs = discover_inputs(&track.dir)?;
    let log = ResultLog::create(log_path)?;
    info!("=== Running benches for file {}", configuration.log_name());

    let executor = ProcessExecutor::from_config(&config.solver, &config.limits);
    let mut controller = RepetitionController::new(executor, config.limits.policy());
    for input in inputs {
        let task = BenchTask::new(&configuration.label, &configuration.options, input);
        info!(
            "Processing {} {}...",
            task.input().display(),
            configuration.options
        );
        let record = controller.run(&task);
        report.tasks += 1;
        match record {
            BenchmarkRecord::Completed(_) => report.completed += 1,
            BenchmarkRecord::Failed { .. } => report.failed += 1,
        }
        log.append(&task.file_name(), &record)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackPlan {
    pub name: String,
    pub dir: PathBuf,
    pub inputs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuitePlan {
    pub solver: SolverConfig,
    pub limits: Limits,
    pub results_dir: PathBuf,
    pub parallel_configurations: bool,
    pub tracks: Vec<TrackPlan>,
    pub configurations: Vec<ConfigurationSpec>,
    pub total_tasks: usize,
}

pub fn plan_suite(config: &BenchConfig) -> Result<SuitePlan> {
    config.validate()?;
    let tracks: Vec<TrackPlan> = discover_tracks(&config.corpus.root, &config.corpus.tracks)?
        .into_iter()
        .map(|track| match discover_inputs(&track.dir) {
            Ok(inputs) => TrackPlan {
                name: track.name,
                dir: track.dir,
                inputs: inputs.len(),
                error: None,
            },
            Err(err) => TrackPlan {
                name: track.name,
                dir: track.dir,
                inputs: 0,
                error: Some(err.to_string()),
            },
        })
        .collect();
    let inputs: usize = tracks.iter().map(|t| t.inputs).sum();
    Ok(SuitePlan {
        solver: config.solver.clone(),
        limits: config.limits.clone(),
        results_dir: config.results_dir.clone(),
        parallel_configurations: config.parallel_configurations,
        total_tasks: inputs * config.configurations.len(),
        tracks,
        configurations: config.configurations.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySource;
    use bench_core::parse_log;
    use chrono::Utc;
    use std::fs;

    const SOLVER: &str = "\
eval \"last=\\${$#}\"
if grep -q slow \"$last\"; then
  sleep 5
fi
if grep -q fail \"$last\"; then
  echo 'Error: could not read graph' >&2
  exit 3
fi
echo \"Total cost: $(cat \"$last\")\"";

    fn fixture(tag: &str) -> (PathBuf, BenchConfig) {
        let root = std::env::temp_dir().join(format!(
            "sbench_suite_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let track = root.join("graphs").join("b");
        fs::create_dir_all(&track).expect("track dir");
        fs::write(track.join("b02.stp"), "fail").expect("input");
        fs::write(track.join("b01.stp"), "5").expect("input");
        fs::write(track.join("b03.stp"), "7.25").expect("input");
        let solver = root.join("solver.sh");
        fs::write(&solver, SOLVER).expect("solver");

        let mut config = BenchConfig::default();
        config.solver = SolverConfig {
            program: solver,
            wrapper: vec!["/bin/sh".to_string()],
            memory: MemorySource::Rusage,
        };
        config.corpus.root = root.join("graphs");
        config.results_dir = root.join("benches");
        config.limits.timeout_secs = 30;
        config.limits.max_repetitions = 1;
        config.configurations = vec![
            ConfigurationSpec::new("two-apx", "-a -c"),
            ConfigurationSpec::new("exact", "-x -c"),
        ];
        (root, config)
    }

    fn assert_track_b_log(path: &Path) {
        let text = fs::read_to_string(path).expect("log");
        let entries = parse_log(&text).expect("parse log");
        let names: Vec<&str> = entries.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, ["b01.stp", "b02.stp", "b03.stp"]);
        assert_eq!(text.lines().nth(1), Some("b02.stp: -"));
        let first = entries[0].result.expect("b01 completed");
        assert_eq!(first.reported_value, 5.0);
        assert_eq!(first.runs, 1);
        assert!(first.mean_time_ms > 0.0);
        assert_eq!(entries[2].result.map(|s| s.reported_value), Some(7.25));
    }

    #[test]
    fn serial_suite_writes_one_log_per_configuration() {
        let (root, config) = fixture("serial");
        let report = run_suite(&config).expect("suite");
        assert_eq!(report.passes.len(), 2);
        assert_eq!(report.tasks(), 6);
        assert_eq!(report.completed(), 4);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.aborted(), 0);
        assert_track_b_log(&root.join("benches").join("b").join("two-apx.log"));
        assert_track_b_log(&root.join("benches").join("b").join("exact.log"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_track_aborts_only_its_own_passes() {
        let (root, mut config) = fixture("missing");
        config.corpus.tracks = vec!["absent".to_string(), "b".to_string()];
        let report = run_suite(&config).expect("suite");
        assert_eq!(report.passes.len(), 4);
        assert_eq!(report.aborted(), 2);
        assert!(report.passes[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("corpus directory not found")));
        assert!(!root.join("benches").join("absent").join("two-apx.log").exists());
        assert_track_b_log(&root.join("benches").join("b").join("exact.log"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn parallel_configurations_keep_separate_logs() {
        let (root, mut config) = fixture("parallel");
        config.parallel_configurations = true;
        let report = run_suite(&config).expect("suite");
        let labels: Vec<&str> = report.passes.iter().map(|p| p.configuration.as_str()).collect();
        assert_eq!(labels, ["two-apx", "exact"]);
        assert_track_b_log(&root.join("benches").join("b").join("two-apx.log"));
        assert_track_b_log(&root.join("benches").join("b").join("exact.log"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rerun_truncates_previous_log() {
        let (root, config) = fixture("rerun");
        run_suite(&config).expect("first run");
        run_suite(&config).expect("second run");
        let text = fs::read_to_string(root.join("benches").join("b").join("two-apx.log"))
            .expect("log");
        assert_eq!(text.lines().count(), 3);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn plan_counts_tasks_without_running() {
        let (root, config) = fixture("plan");
        let plan = plan_suite(&config).expect("plan");
        assert_eq!(plan.tracks.len(), 1);
        assert_eq!(plan.tracks[0].inputs, 3);
        assert_eq!(plan.total_tasks, 6);
        assert!(!root.join("benches").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn timed_out_input_is_logged_as_failure_marker() {
        let (root, mut config) = fixture("slow");
        let track = root.join("graphs").join("slow");
        fs::create_dir_all(&track).expect("track dir");
        fs::write(track.join("slow.stp"), "slow").expect("input");
        config.corpus.tracks = vec!["slow".to_string()];
        config.limits.timeout_secs = 1;
        config.configurations = vec![ConfigurationSpec::new("two-apx", "-a -c")];

        let report = run_suite(&config).expect("suite");
        assert_eq!(report.tasks(), 1);
        assert_eq!(report.failed(), 1);
        let text = fs::read_to_string(root.join("benches").join("slow").join("two-apx.log"))
            .expect("log");
        assert_eq!(text, "slow.stp: -\n");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_corpus_root_fails_the_suite() {
        let (root, mut config) = fixture("noroot");
        config.corpus.root = root.join("nowhere");
        assert!(run_suite(&config).is_err());
        let _ = fs::remove_dir_all(root);
    }
}
