use crate::controller::RepetitionPolicy;
use crate::error::BenchError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "bench.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub solver: SolverConfig,
    pub corpus: CorpusConfig,
    pub results_dir: PathBuf,
    pub limits: Limits,
    pub parallel_configurations: bool,
    pub configurations: Vec<ConfigurationSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    Wrapper,
    Rusage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    pub program: PathBuf,
    pub wrapper: Vec<String>,
    pub memory: MemorySource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorpusConfig {
    pub root: PathBuf,
    pub tracks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    pub timeout_secs: u64,
    pub budget_ms: f64,
    pub min_repetitions: u32,
    pub max_repetitions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigurationSpec {
    pub label: String,
    pub options: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl ConfigurationSpec {
    pub fn new(label: &str, options: &str) -> Self {
        Self {
            label: label.to_string(),
            options: options.to_string(),
            log: None,
        }
    }

    pub fn log_name(&self) -> String {
        self.log
            .clone()
            .unwrap_or_else(|| format!("{}.log", self.label))
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("./min-cost-ST"),
            wrapper: vec!["/usr/bin/time".to_string(), "-v".to_string()],
            memory: MemorySource::Wrapper,
        }
    }
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("graphs"),
            tracks: Vec::new(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        let policy = RepetitionPolicy::default();
        Self {
            timeout_secs: 300,
            budget_ms: policy.budget_ms,
            min_repetitions: policy.min_repetitions,
            max_repetitions: policy.max_repetitions,
        }
    }
}

impl Limits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn policy(&self) -> RepetitionPolicy {
        RepetitionPolicy {
            budget_ms: self.budget_ms,
            min_repetitions: self.min_repetitions,
            max_repetitions: self.max_repetitions,
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            solver: SolverConfig::default(),
            corpus: CorpusConfig::default(),
            results_dir: PathBuf::from("benches"),
            limits: Limits::default(),
            parallel_configurations: false,
            configurations: default_configurations(),
        }
    }
}

pub fn default_configurations() -> Vec<ConfigurationSpec> {
    [
        ("tm", "-h -c"),
        ("pruned-mst", "-s -c"),
        ("mst", "-m -c"),
        ("two-apx", "-a -c"),
        ("two-apx-parallel", "-a -p -c"),
        ("exact", "-x -c"),
        ("exact-ub-reduct", "-x -u -r -c"),
    ]
    .into_iter()
    .map(|(label, options)| ConfigurationSpec::new(label, options))
    .collect()
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_yaml(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        // An empty document means "all defaults".
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: BenchConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_path.is_file() {
            return Ok((Self::load(&default_path)?, Some(default_path)));
        }
        Ok((Self::default(), None))
    }

    pub fn validate(&self) -> Result<(), BenchError> {
        let invalid = |msg: String| Err(BenchError::InvalidConfig(msg));
        if self.solver.program.as_os_str().is_empty() {
            return invalid("solver.program must not be empty".to_string());
        }
        if self.solver.memory == MemorySource::Wrapper && self.solver.wrapper.is_empty() {
            return invalid(
                "solver.memory is 'wrapper' but solver.wrapper is empty; use 'rusage'".to_string(),
            );
        }
        if self.limits.timeout_secs == 0 {
            return invalid("limits.timeout_secs must be greater than 0".to_string());
        }
        if !self.limits.budget_ms.is_finite() || self.limits.budget_ms <= 0.0 {
            return invalid(format!(
                "limits.budget_ms must be a positive number (got {})",
                self.limits.budget_ms
            ));
        }
        if self.limits.min_repetitions > self.limits.max_repetitions {
            return invalid(format!(
                "limits.min_repetitions ({}) exceeds limits.max_repetitions ({})",
                self.limits.min_repetitions, self.limits.max_repetitions
            ));
        }
        if self.configurations.is_empty() {
            return invalid("at least one configuration is required".to_string());
        }
        let mut labels = BTreeSet::new();
        let mut logs = BTreeSet::new();
        for configuration in &self.configurations {
            if configuration.label.trim().is_empty() {
                return invalid("configuration label must not be empty".to_string());
            }
            if !labels.insert(configuration.label.as_str()) {
                return invalid(format!(
                    "duplicate configuration label: {}",
                    configuration.label
                ));
            }
            if !logs.insert(configuration.log_name()) {
                return invalid(format!(
                    "configuration {} shares its log file with another configuration",
                    configuration.label
                ));
            }
        }
        Ok(())
    }

    pub fn select_configurations(&mut self, labels: &[String]) -> Result<(), BenchError> {
        if labels.is_empty() {
            return Ok(());
        }
        if let Some(unknown) = labels
            .iter()
            .find(|l| !self.configurations.iter().any(|c| &c.label == *l))
        {
            return Err(BenchError::InvalidConfig(format!(
                "unknown configuration: {}",
                unknown
            )));
        }
        self.configurations.retain(|c| labels.contains(&c.label));
        Ok(())
    }

    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

pub fn config_template() -> &'static str {
    "\
# Benchmark configuration. Every key is optional; the values below are the defaults.
solver:
  program: ./min-cost-ST
  wrapper: [/usr/bin/time, -v]       # [] runs the solver directly
  memory: wrapper                    # wrapper | rusage
corpus:
  root: graphs                       # one subdirectory per track
  tracks: []                         # empty: every subdirectory
results_dir: benches                 # logs go to <results_dir>/<track>/<log>
limits:
  timeout_secs: 300
  budget_ms: 50000
  min_repetitions: 0
  max_repetitions: 1000
parallel_configurations: false       # run configurations side by side (skews timings)
configurations:
  - { label: tm, options: \"-h -c\" }
  - { label: pruned-mst, options: \"-s -c\" }
  - { label: mst, options: \"-m -c\" }
  - { label: two-apx, options: \"-a -c\" }
  - { label: two-apx-parallel, options: \"-a -p -c\" }
  - { label: exact, options: \"-x -c\" }
  - { label: exact-ub-reduct, options: \"-x -u -r -c\" }
"
}
