use crate::error::BenchError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Track {
    pub name: String,
    pub dir: PathBuf,
}

pub fn discover_inputs(dir: &Path) -> Result<Vec<PathBuf>, BenchError> {
    list_entries(dir, |entry| entry.file_type().is_file())
}

pub fn discover_tracks(root: &Path, names: &[String]) -> Result<Vec<Track>, BenchError> {
    if !names.is_empty() {
        return Ok(names
            .iter()
            .map(|name| Track {
                name: name.clone(),
                dir: root.join(name),
            })
            .collect());
    }
    let dirs = list_entries(root, |entry| entry.file_type().is_dir())?;
    Ok(dirs
        .into_iter()
        .map(|dir| Track {
            name: dir
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            dir,
        })
        .collect())
}

fn list_entries(
    dir: &Path,
    keep: impl Fn(&walkdir::DirEntry) -> bool,
) -> Result<Vec<PathBuf>, BenchError> {
    if !dir.is_dir() {
        return Err(BenchError::MissingCorpus(dir.to_path_buf()));
    }
    let mut out = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|source| BenchError::CorpusWalk {
            path: dir.to_path_buf(),
            source,
        })?;
        if keep(&entry) {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}
