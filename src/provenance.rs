use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::ConvertError;

/// Version of a source dataset as recorded in `dataset.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub branch: String,
    pub revision: String,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "git-{}-{}", self.branch, self.revision)
    }
}

/// Recorded in place of a provenance string when the lookup fails.
pub const UNVERSIONED: &str = "unversioned";

pub trait ProvenanceLookup {
    fn describe(&self, dataset_dir: &Path) -> Result<Provenance, ConvertError>;
}

/// Reads branch and short commit from a git working copy.
#[derive(Debug, Clone)]
pub struct GitProvenance {
    git: Option<PathBuf>,
}

impl GitProvenance {
    pub fn new() -> Self {
        Self {
            git: find_in_path("git"),
        }
    }
}

impl Default for GitProvenance {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvenanceLookup for GitProvenance {
    fn describe(&self, dataset_dir: &Path) -> Result<Provenance, ConvertError> {
        let git = self
            .git
            .as_deref()
            .ok_or_else(|| ConvertError::MissingTool("git".to_string()))?;
        let branch = run_git(git, dataset_dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let revision = run_git(git, dataset_dir, &["rev-parse", "--short", "HEAD"])?;
        Ok(Provenance { branch, revision })
    }
}

/// Runs git in `cwd` and returns trimmed stdout.
pub fn run_git(git: &Path, cwd: &Path, args: &[&str]) -> Result<String, ConvertError> {
    let output = Command::new(git)
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|err| ConvertError::Git(err.to_string()))?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("git {} failed in {}", args.join(" "), cwd.display())
    } else {
        stderr
    };
    Err(ConvertError::Git(message))
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
