use crate::outcome::TrialStatus;
use serde::Serialize;
use thiserror::Error;

const FAILED_MARKER: &str = "-";
const KEY_SEPARATOR: &str = ": ";
const FIELD_SEPARATOR: &str = ", ";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunSummary {
    pub reported_value: f64,
    pub mean_time_ms: f64,
    pub mean_memory_kb: f64,
    pub runs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BenchmarkRecord {
    Failed { status: TrialStatus },
    Completed(RunSummary),
}

impl BenchmarkRecord {
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            BenchmarkRecord::Completed(summary) => Some(summary),
            BenchmarkRecord::Failed { .. } => None,
        }
    }
}

pub fn format_log_line(file_name: &str, record: &BenchmarkRecord) -> String {
    match record {
        BenchmarkRecord::Failed { .. } => format!("{}: {}", file_name, FAILED_MARKER),
        BenchmarkRecord::Completed(s) => format!(
            "{}: cost: {:.2}, avg_time: {:.2} ms, avg-memory: {:.2} KB, runs: {}",
            file_name, s.reported_value, s.mean_time_ms, s.mean_memory_kb, s.runs
        ),
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RecordParseError {
    #[error("missing \": \" after file name in {0:?}")]
    MissingFileName(String),
    #[error("expected 4 fields, found {0}")]
    FieldCount(usize),
    #[error("expected field {expected:?}, found {found:?}")]
    UnexpectedField { expected: &'static str, found: String },
    #[error("field {field:?} has unparsable value {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub file_name: String,
    pub result: Option<RunSummary>,
}

pub fn parse_log_line(line: &str) -> Result<LogEntry, RecordParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (file_name, rest) = line
        .split_once(KEY_SEPARATOR)
        .ok_or_else(|| RecordParseError::MissingFileName(line.to_string()))?;
    if rest.trim() == FAILED_MARKER {
        return Ok(LogEntry {
            file_name: file_name.to_string(),
            result: None,
        });
    }

    let fields: Vec<&str> = rest.split(FIELD_SEPARATOR).collect();
    if fields.len() != 4 {
        return Err(RecordParseError::FieldCount(fields.len()));
    }
    let reported_value = field_value(fields[0], "cost", "")?;
    let mean_time_ms = field_value(fields[1], "avg_time", " ms")?;
    let mean_memory_kb = field_value(fields[2], "avg-memory", " KB")?;
    let runs = field_raw(fields[3], "runs", "")?;
    let runs = runs
        .parse::<u32>()
        .map_err(|_| RecordParseError::InvalidNumber {
            field: "runs",
            value: runs.to_string(),
        })?;

    Ok(LogEntry {
        file_name: file_name.to_string(),
        result: Some(RunSummary {
            reported_value,
            mean_time_ms,
            mean_memory_kb,
            runs,
        }),
    })
}

pub fn parse_log(text: &str) -> Result<Vec<LogEntry>, RecordParseError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_log_line)
        .collect()
}

fn field_raw<'a>(
    field: &'a str,
    label: &'static str,
    unit: &str,
) -> Result<&'a str, RecordParseError> {
    let unexpected = || RecordParseError::UnexpectedField {
        expected: label,
        found: field.to_string(),
    };
    let (key, value) = field.split_once(KEY_SEPARATOR).ok_or_else(unexpected)?;
    if key != label {
        return Err(unexpected());
    }
    value.strip_suffix(unit).ok_or_else(unexpected)
}

fn field_value(field: &str, label: &'static str, unit: &str) -> Result<f64, RecordParseError> {
    let raw = field_raw(field, label, unit)?;
    raw.trim()
        .parse::<f64>()
        .map_err(|_| RecordParseError::InvalidNumber {
            field: label,
            value: raw.to_string(),
        })
}
