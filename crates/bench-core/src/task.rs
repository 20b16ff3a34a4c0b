use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BenchTask {
    configuration: String,
    options: Vec<String>,
    input: PathBuf,
}

impl BenchTask {
    pub fn new(configuration: &str, options: &str, input: impl Into<PathBuf>) -> Self {
        Self {
            configuration: configuration.to_string(),
            options: tokenize_options(options),
            input: input.into(),
        }
    }

    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn file_name(&self) -> String {
        self.input
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input.display().to_string())
    }
}

pub fn tokenize_options(options: &str) -> Vec<String> {
    options.split_whitespace().map(str::to_string).collect()
}
