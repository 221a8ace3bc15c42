//! BIDS path conventions: subject/session/site tokens, companion file naming
//! and discovery of annotated images inside a dataset root.

use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::domain::{FILE_ENDING, SiteId, SubjectRecord};
use crate::error::ConvertError;
use crate::store;

/// Suffix of the manually corrected pathology mask.
pub const SECONDARY_SUFFIX: &str = "_lesion";
/// Suffix of the structure mask the pathology must lie within.
pub const PRIMARY_SUFFIX: &str = "_seg";
/// Location of manual labels relative to a dataset root.
pub const LABELS_DIR: &str = "derivatives/labels";

static SUBJECT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"sub-[^_/\\]+").unwrap());
static SESSION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"ses-[^_/\\]+").unwrap());
static SITE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"site_\d{3}").unwrap());

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPath {
    pub subject: String,
    pub session: String,
    pub site: Option<SiteId>,
}

impl ResolvedPath {
    /// `sub-X_ses-Y`, `sub-X`, or empty when no subject token was found.
    pub fn subject_key(&self) -> String {
        match (self.subject.is_empty(), self.session.is_empty()) {
            (true, _) => String::new(),
            (false, true) => self.subject.clone(),
            (false, false) => format!("{}_{}", self.subject, self.session),
        }
    }
}

/// Extracts subject, session and site from a path. Missing tokens are empty.
pub fn resolve(path: &str) -> ResolvedPath {
    let (subject, session) = subject_session(path);
    ResolvedPath {
        subject,
        session,
        site: find_site(path),
    }
}

pub fn subject_session(path: &str) -> (String, String) {
    let file_name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let token = |regex: &Regex| {
        regex
            .find(file_name)
            .or_else(|| regex.find(path))
            .map(|found| found.as_str().to_string())
            .unwrap_or_default()
    };
    (token(&SUBJECT_RE), token(&SESSION_RE))
}

pub fn find_site(path: &str) -> Option<SiteId> {
    SITE_RE
        .find(path)
        .and_then(|found| found.as_str().parse().ok())
}

/// Swaps the trailing `from` token of a NIfTI file stem for `to`.
///
/// `sub-01_T2w_lesion.nii.gz` with `_lesion` → `_seg` becomes
/// `sub-01_T2w_seg.nii.gz`; a stem not ending in `from` is an error.
pub fn companion_path(path: &Utf8Path, from: &str, to: &str) -> Result<Utf8PathBuf, ConvertError> {
    let naming_error = || ConvertError::NamingConvention {
        path: path.as_std_path().to_path_buf(),
        suffix: format!("{from}{FILE_ENDING}"),
    };
    let file_name = path.file_name().ok_or_else(naming_error)?;
    let stem = file_name
        .strip_suffix(FILE_ENDING)
        .and_then(|stem| stem.strip_suffix(from))
        .ok_or_else(naming_error)?;
    Ok(path.with_file_name(format!("{stem}{to}{FILE_ENDING}")))
}

/// Raw image a label under `<root>/derivatives/labels` annotates.
pub fn image_path_for_label(
    source_root: &Utf8Path,
    label_path: &Utf8Path,
) -> Result<Utf8PathBuf, ConvertError> {
    let relative = label_path
        .strip_prefix(source_root.join(LABELS_DIR))
        .map_err(|_| ConvertError::NamingConvention {
            path: label_path.as_std_path().to_path_buf(),
            suffix: LABELS_DIR.to_string(),
        })?;
    let mirrored = source_root.join(relative);
    companion_path(&mirrored, SECONDARY_SUFFIX, "")
}

/// Builds the record for one secondary-mask file.
pub fn resolve_record(
    source_id: &str,
    source_root: &Utf8Path,
    label_path: &Utf8Path,
) -> Result<SubjectRecord, ConvertError> {
    let image_path = image_path_for_label(source_root, label_path)?;
    let primary_mask_path = companion_path(label_path, SECONDARY_SUFFIX, PRIMARY_SUFFIX)?;
    let resolved = resolve(label_path.as_str());
    Ok(SubjectRecord {
        source_id: source_id.to_string(),
        subject_key: resolved.subject_key(),
        site: resolved.site,
        image_path,
        primary_mask_path,
        secondary_mask_path: label_path.to_path_buf(),
    })
}

/// All annotated images of one source, sorted by label path.
pub fn discover_subjects(
    source_id: &str,
    source_root: &Utf8Path,
) -> Result<Vec<SubjectRecord>, ConvertError> {
    let labels_root = source_root.join(LABELS_DIR);
    if !labels_root.as_std_path().is_dir() {
        tracing::warn!(source = source_id, path = %labels_root, "no labels directory found");
        return Ok(Vec::new());
    }

    let suffix = format!("{SECONDARY_SUFFIX}{FILE_ENDING}");
    let mut label_paths = store::walk_files(labels_root.as_std_path())?
        .into_iter()
        .map(|path| {
            Utf8PathBuf::from_path_buf(path).map_err(|path| {
                ConvertError::Filesystem(format!("non UTF-8 path: {}", path.display()))
            })
        })
        .filter(|path| match path {
            Ok(path) => path.as_str().ends_with(&suffix),
            Err(_) => true,
        })
        .collect::<Result<Vec<_>, _>>()?;
    label_paths.sort();

    label_paths
        .iter()
        .map(|path| resolve_record(source_id, source_root, path))
        .collect()
}
