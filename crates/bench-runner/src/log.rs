use crate::error::BenchError;
use bench_core::{format_log_line, BenchmarkRecord};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    pub fn create(path: &Path) -> Result<Self, BenchError> {
        let wrap = |source| BenchError::ResultLog {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(wrap)?;
        }
        File::create(path).map_err(wrap)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, file_name: &str, record: &BenchmarkRecord) -> Result<(), BenchError> {
        self.append_line(&format_log_line(file_name, record))
            .map_err(|source| BenchError::ResultLog {
                path: self.path.clone(),
                source,
            })
    }

    fn append_line(&self, line: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.flush()
    }
}
