use crate::exec::TrialExecutor;
use bench_core::{BenchTask, BenchmarkRecord, RunSummary, TrialMeasurement, TrialOutcome};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepetitionPolicy {
    pub budget_ms: f64,
    pub min_repetitions: u32,
    pub max_repetitions: u32,
}

impl Default for RepetitionPolicy {
    fn default() -> Self {
        Self {
            budget_ms: 50_000.0,
            min_repetitions: 0,
            max_repetitions: 1000,
        }
    }
}

impl RepetitionPolicy {
    pub fn estimate_runs(&self, first_trial_ms: f64) -> u32 {
        if !first_trial_ms.is_finite() || first_trial_ms <= 0.0 {
            return self.min_repetitions;
        }
        let possible = (self.budget_ms / first_trial_ms).floor();
        let possible = if possible >= self.max_repetitions as f64 {
            self.max_repetitions
        } else {
            possible as u32
        };
        self.min_repetitions.max(possible.min(self.max_repetitions))
    }
}

struct RunningTotals {
    sum_time_ms: f64,
    sum_memory_kb: f64,
    runs: u32,
    spent_ms: f64,
}

impl RunningTotals {
    fn start(first: &TrialMeasurement) -> Self {
        let mut totals = Self {
            sum_time_ms: 0.0,
            sum_memory_kb: 0.0,
            runs: 0,
            spent_ms: 0.0,
        };
        totals.add(first);
        totals
    }

    fn add(&mut self, trial: &TrialMeasurement) {
        self.sum_time_ms += trial.elapsed_ms;
        self.sum_memory_kb += trial.peak_memory_kb as f64;
        self.spent_ms += trial.elapsed_ms;
        self.runs += 1;
    }

    fn finish(self, reported_value: f64) -> RunSummary {
        let runs = f64::from(self.runs);
        RunSummary {
            reported_value,
            mean_time_ms: self.sum_time_ms / runs,
            mean_memory_kb: self.sum_memory_kb / runs,
            runs: self.runs,
        }
    }
}

pub struct RepetitionController<E> {
    executor: E,
    policy: RepetitionPolicy,
}

impl<E: TrialExecutor> RepetitionController<E> {
    pub fn new(executor: E, policy: RepetitionPolicy) -> Self {
        Self { executor, policy }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn run(&mut self, task: &BenchTask) -> BenchmarkRecord {
        let first = match self.executor.execute(task) {
            TrialOutcome::Success(measurement) => measurement,
            TrialOutcome::Failed(kind) => {
                return BenchmarkRecord::Failed {
                    status: kind.status(),
                }
            }
        };

        let planned = self.policy.estimate_runs(first.elapsed_ms);
        let mut totals = RunningTotals::start(&first);
        for _ in 1..planned {
            if totals.spent_ms >= self.policy.budget_ms {
                break;
            }
            match self.executor.execute(task) {
                TrialOutcome::Success(measurement) => totals.add(&measurement),
                TrialOutcome::Failed(kind) => {
                    debug!(
                        file = %task.input().display(),
                        completed = totals.runs,
                        "stopping repetitions after failed trial: {}",
                        kind
                    );
                    break;
                }
            }
        }

        info!(
            file = %task.input().display(),
            configuration = task.configuration(),
            planned,
            runs = totals.runs,
            spent_ms = totals.spent_ms,
            "task measured"
        );
        BenchmarkRecord::Completed(totals.finish(first.reported_value))
    }
}
