//! Cloning and pinning of the source datasets with git and git-annex.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;

use crate::config::SourceSpec;
use crate::error::ConvertError;
use crate::provenance::{Provenance, find_in_path, run_git};
use crate::store;

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Clone and check out only; leave annexed content absent.
    pub no_download: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchedDataset {
    pub id: String,
    pub path: PathBuf,
    pub cloned: bool,
    pub provenance: String,
    pub annexed_files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub datasets: Vec<FetchedDataset>,
    pub log_path: PathBuf,
}

pub trait DatasetFetcher {
    fn fetch(
        &self,
        source: &SourceSpec,
        base_url: &str,
        out_dir: &Path,
        options: FetchOptions,
    ) -> Result<(FetchedDataset, Provenance), ConvertError>;
}

/// Uses the system `git` with the git-annex extension.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    git: Option<PathBuf>,
}

impl GitFetcher {
    pub fn new() -> Self {
        Self {
            git: find_in_path("git"),
        }
    }

    fn require_git(&self) -> Result<&Path, ConvertError> {
        self.git
            .as_deref()
            .ok_or_else(|| ConvertError::MissingTool("git".to_string()))
    }
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetFetcher for GitFetcher {
    fn fetch(
        &self,
        source: &SourceSpec,
        base_url: &str,
        out_dir: &Path,
        options: FetchOptions,
    ) -> Result<(FetchedDataset, Provenance), ConvertError> {
        let git = self.require_git()?;
        let dataset_dir = out_dir.join(&source.id);

        let cloned = if dataset_dir.exists() {
            tracing::info!(dataset = %source.id, "dataset already exists, skipping clone");
            false
        } else {
            let url = clone_url(base_url, &source.id);
            tracing::info!(dataset = %source.id, url = %url, "cloning");
            run_git(git, out_dir, &["clone", &url, &source.id])?;
            if let Err(err) = run_git(git, &dataset_dir, &["annex", "dead", "here"]) {
                tracing::warn!(dataset = %source.id, "could not mark annex copy dead: {err}");
            }
            true
        };

        if let Some(revision) = &source.revision {
            run_git(git, &dataset_dir, &["checkout", revision])?;
        }

        let branch = run_git(git, &dataset_dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let revision = run_git(git, &dataset_dir, &["rev-parse", "--short", "HEAD"])?;
        let provenance = Provenance { branch, revision };

        let mut annexed_files = 0;
        if !options.no_download {
            let targets = annex_targets(&dataset_dir)?;
            if targets.is_empty() {
                tracing::warn!(dataset = %source.id, "no T2w files found");
            } else {
                let mut args = vec!["annex".to_string(), "get".to_string()];
                args.extend(targets.iter().map(|path| path.display().to_string()));
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                match run_git(git, &dataset_dir, &args) {
                    Ok(_) => annexed_files = targets.len(),
                    Err(err) => {
                        tracing::warn!(dataset = %source.id, "annex get failed: {err}")
                    }
                }
            }
        }

        Ok((
            FetchedDataset {
                id: source.id.clone(),
                path: dataset_dir,
                cloned,
                provenance: provenance.to_string(),
                annexed_files,
            },
            provenance,
        ))
    }
}

pub fn clone_url(base_url: &str, id: &str) -> String {
    format!("{}/{id}.git", base_url.trim_end_matches('/'))
}

/// T2w images below `dataset_dir` (relative, sorted), STIR acquisitions excluded.
pub fn annex_targets(dataset_dir: &Path) -> Result<Vec<PathBuf>, ConvertError> {
    let mut targets: Vec<PathBuf> = store::walk_files(dataset_dir)?
        .into_iter()
        .filter_map(|path| {
            let relative = path.strip_prefix(dataset_dir).ok()?.to_path_buf();
            if relative.starts_with(".git") {
                return None;
            }
            let name = relative.file_name()?.to_str()?;
            let keep = name.contains("T2w")
                && name.ends_with(".nii.gz")
                && !relative.to_string_lossy().contains("STIR");
            keep.then_some(relative)
        })
        .collect();
    targets.sort();
    Ok(targets)
}

/// Fetches every source that declares a `base_url` and records the checked
/// out versions in `git_branch_commit_<timestamp>.log`.
pub fn fetch_all(
    fetcher: &dyn DatasetFetcher,
    sources: &[SourceSpec],
    out_dir: &Path,
    options: FetchOptions,
) -> Result<FetchReport, ConvertError> {
    std::fs::create_dir_all(out_dir)
        .map_err(|err| ConvertError::Filesystem(format!("create {}: {err}", out_dir.display())))?;
    let log_path = out_dir.join(format!(
        "git_branch_commit_{}.log",
        Local::now().format("%Y%m%d_%H%M%S")
    ));

    let mut datasets = Vec::new();
    for source in sources {
        let Some(base_url) = source.base_url.as_deref() else {
            tracing::debug!(dataset = %source.id, "no base_url, skipping");
            continue;
        };
        let (fetched, provenance) = fetcher.fetch(source, base_url, out_dir, options)?;
        append_line(&log_path, &format!("{}: {provenance}", source.id))?;
        datasets.push(fetched);
    }

    if datasets.is_empty() {
        return Err(ConvertError::InvalidConfig(
            "no configured source declares a base_url".to_string(),
        ));
    }
    tracing::info!(log = %log_path.display(), "dataset versions recorded");
    Ok(FetchReport { datasets, log_path })
}

fn append_line(path: &Path, line: &str) -> Result<(), ConvertError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| ConvertError::Filesystem(format!("open {}: {err}", path.display())))?;
    writeln!(file, "{line}")
        .map_err(|err| ConvertError::Filesystem(format!("write {}: {err}", path.display())))
}
