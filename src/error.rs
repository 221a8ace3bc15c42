use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ConvertError {
    #[error("source path does not exist: {0}")]
    #[diagnostic(help("every --path-data entry must point at an existing BIDS dataset root"))]
    InvalidSourcePath(PathBuf),

    #[error("companion file for subject {subject} does not exist: {path}")]
    MissingCompanionFile { subject: String, path: PathBuf },

    #[error("subject {0} is in neither the train nor the test assignment")]
    UnresolvedAssignment(String),

    #[error("volume I/O failed for {path}: {message}")]
    VolumeIo { path: PathBuf, message: String },

    #[error("volume shapes differ for subject {subject}: {expected:?} vs {found:?}")]
    ShapeMismatch {
        subject: String,
        expected: [usize; 3],
        found: [usize; 3],
    },

    #[error("file name {path} does not follow the naming convention: expected suffix `{suffix}`")]
    NamingConvention { path: PathBuf, suffix: String },

    #[error("invalid split ratios: {0}")]
    InvalidSplit(String),

    #[error("invalid orientation code: {0}")]
    InvalidOrientation(String),

    #[error("invalid site identifier: {0}")]
    InvalidSiteId(String),

    #[error("invalid dataset number {0}: expected a value between 1 and 999")]
    InvalidDatasetNumber(u32),

    #[error("invalid fusion threshold {0}: expected a value in (0, 1]")]
    InvalidThreshold(f32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing config file bids2nnunet.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to write manifest: {0}")]
    Manifest(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("git command failed: {0}")]
    Git(String),
}

impl ConvertError {
    /// Errors that only invalidate the subject being processed.
    pub fn is_subject_scoped(&self) -> bool {
        matches!(
            self,
            ConvertError::MissingCompanionFile { .. }
                | ConvertError::UnresolvedAssignment(_)
                | ConvertError::VolumeIo { .. }
                | ConvertError::ShapeMismatch { .. }
                | ConvertError::NamingConvention { .. }
        )
    }

    /// Stable label used in log records.
    pub fn kind(&self) -> &'static str {
        match self {
            ConvertError::InvalidSourcePath(_) => "invalid_source_path",
            ConvertError::MissingCompanionFile { .. } => "missing_companion_file",
            ConvertError::UnresolvedAssignment(_) => "unresolved_assignment",
            ConvertError::VolumeIo { .. } | ConvertError::ShapeMismatch { .. } => "volume_io",
            ConvertError::NamingConvention { .. } => "naming_convention",
            ConvertError::InvalidSplit(_)
            | ConvertError::InvalidOrientation(_)
            | ConvertError::InvalidSiteId(_)
            | ConvertError::InvalidDatasetNumber(_)
            | ConvertError::InvalidThreshold(_)
            | ConvertError::InvalidConfig(_)
            | ConvertError::MissingConfig
            | ConvertError::ConfigRead(_)
            | ConvertError::ConfigParse(_) => "configuration",
            ConvertError::Manifest(_) => "manifest",
            ConvertError::Filesystem(_) => "filesystem",
            ConvertError::MissingTool(_) | ConvertError::Git(_) => "external_tool",
        }
    }
}
