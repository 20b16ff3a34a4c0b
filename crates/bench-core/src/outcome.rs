use crate::extract;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const OOM_KILL_EXIT_CODE: i32 = 137;
pub const OOM_ABORT_EXIT_CODE: i32 = 2;
const OOM_MARKER: &str = "out of memory";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Success,
    Timeout,
    OutOfMemory,
    AbnormalExit,
    ParseFailure,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Success => "success",
            TrialStatus::Timeout => "timeout",
            TrialStatus::OutOfMemory => "out_of_memory",
            TrialStatus::AbnormalExit => "abnormal_exit",
            TrialStatus::ParseFailure => "parse_failure",
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    OutOfMemory,
    AbnormalExit { code: Option<i32> },
    ParseFailure,
}

impl FailureKind {
    pub fn status(&self) -> TrialStatus {
        match self {
            FailureKind::Timeout => TrialStatus::Timeout,
            FailureKind::OutOfMemory => TrialStatus::OutOfMemory,
            FailureKind::AbnormalExit { .. } => TrialStatus::AbnormalExit,
            FailureKind::ParseFailure => TrialStatus::ParseFailure,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "call timed out"),
            FailureKind::OutOfMemory => write!(f, "out of memory"),
            FailureKind::AbnormalExit { code: Some(code) } => {
                write!(f, "non-zero return code ({})", code)
            }
            FailureKind::AbnormalExit { code: None } => write!(f, "solver could not be run"),
            FailureKind::ParseFailure => write!(f, "no parsable result line"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialMeasurement {
    pub elapsed_ms: f64,
    pub peak_memory_kb: u64,
    pub reported_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    Success(TrialMeasurement),
    Failed(FailureKind),
}

impl TrialOutcome {
    pub fn status(&self) -> TrialStatus {
        match self {
            TrialOutcome::Success(_) => TrialStatus::Success,
            TrialOutcome::Failed(kind) => kind.status(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TrialOutcome::Success(_))
    }

    pub fn measurement(&self) -> Option<&TrialMeasurement> {
        match self {
            TrialOutcome::Success(m) => Some(m),
            TrialOutcome::Failed(_) => None,
        }
    }

    pub fn elapsed_ms(&self) -> Option<f64> {
        self.measurement().map(|m| m.elapsed_ms)
    }

    pub fn peak_memory_kb(&self) -> Option<u64> {
        self.measurement().map(|m| m.peak_memory_kb)
    }

    pub fn reported_value(&self) -> Option<f64> {
        self.measurement().map(|m| m.reported_value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    TimedOut,
}

pub fn classify_failure(code: i32, stderr: &str) -> FailureKind {
    if code == OOM_KILL_EXIT_CODE
        || (code == OOM_ABORT_EXIT_CODE && stderr.to_lowercase().contains(OOM_MARKER))
    {
        FailureKind::OutOfMemory
    } else {
        FailureKind::AbnormalExit { code: Some(code) }
    }
}

/// Turns a finished (or killed) child into a trial outcome.
///
/// A timed out run is a failure even if a result line was flushed before
/// the kill.
pub fn evaluate_trial(
    exit: ChildExit,
    stdout: &str,
    stderr: &str,
    elapsed_ms: f64,
    peak_memory_kb: u64,
) -> TrialOutcome {
    let code = match exit {
        ChildExit::TimedOut => return TrialOutcome::Failed(FailureKind::Timeout),
        ChildExit::Exited(code) => code,
    };
    if code != 0 {
        return TrialOutcome::Failed(classify_failure(code, stderr));
    }
    match extract::reported_value(stdout) {
        Some(reported_value) => TrialOutcome::Success(TrialMeasurement {
            elapsed_ms,
            peak_memory_kb,
            reported_value,
        }),
        None => TrialOutcome::Failed(FailureKind::ParseFailure),
    }
}
