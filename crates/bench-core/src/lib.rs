pub mod extract;
pub mod outcome;
pub mod record;
pub mod task;

pub use outcome::{
    classify_failure, evaluate_trial, ChildExit, FailureKind, TrialMeasurement, TrialOutcome,
    TrialStatus,
};
pub use record::{
    format_log_line, parse_log, parse_log_line, BenchmarkRecord, LogEntry, RecordParseError,
    RunSummary,
};
pub use task::{tokenize_options, BenchTask};
