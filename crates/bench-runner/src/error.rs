use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("corpus directory not found: {}", .0.display())]
    MissingCorpus(PathBuf),
    #[error("failed to list {}: {source}", path.display())]
    CorpusWalk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("result log {}: {source}", path.display())]
    ResultLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
