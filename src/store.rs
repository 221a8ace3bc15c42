use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, NamedTempFile};

use crate::error::ConvertError;

/// A file fully written next to its destination, not yet visible there.
pub struct StagedFile {
    temp: NamedTempFile,
    destination: Utf8PathBuf,
}

/// Writes `content` to a temporary sibling of `path` without touching `path`.
pub fn stage_bytes(path: &Utf8Path, content: &[u8]) -> Result<StagedFile, ConvertError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".bids2nnunet-staged")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| ConvertError::Filesystem(err.to_string()))?;
    Ok(StagedFile {
        temp,
        destination: path.to_path_buf(),
    })
}

/// Moves every staged file over its destination, in order. Each rename is
/// atomic but the batch is not: files committed before a failing rename stay
/// replaced, and the staged files after it are discarded.
pub fn commit_staged(staged: Vec<StagedFile>) -> Result<(), ConvertError> {
    for file in staged {
        file.temp
            .persist(file.destination.as_std_path())
            .map_err(|err| {
                ConvertError::Filesystem(format!("persist {}: {}", file.destination, err.error))
            })?;
    }
    Ok(())
}

pub fn ensure_dir(path: &Utf8Path) -> Result<(), ConvertError> {
    fs::create_dir_all(path.as_std_path())
        .map_err(|err| ConvertError::Filesystem(format!("create {path}: {err}")))
}

/// Best-effort removal of files written for an abandoned subject.
pub fn remove_files(paths: &[Utf8PathBuf]) {
    for path in paths {
        if path.as_std_path().exists() {
            if let Err(err) = fs::remove_file(path.as_std_path()) {
                tracing::warn!(path = %path, error = %err, "failed to remove partial output");
            }
        }
    }
}

/// Every regular file below `root`, in no particular order.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, ConvertError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path)
            .map_err(|err| ConvertError::Filesystem(format!("read {}: {err}", path.display())))?;
        for entry in entries {
            let entry = entry.map_err(|err| ConvertError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                items.push(path);
            }
        }
    }
    Ok(items)
}
