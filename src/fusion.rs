//! Fusion of a structure mask and a pathology mask into one ordinal label.
//!
//! Voxel values: 0 background, 1 structure only, 2 structure and pathology.
//! Pathology voxels outside the structure are promoted into it instead of
//! being dropped, so value 2 never occurs where the structure is absent.

use camino::Utf8Path;
use ndarray::{Array3, Zip};
use serde::Serialize;

use crate::error::ConvertError;
use crate::volume::{StorageType, Volume};

pub const BACKGROUND: u8 = 0;
pub const PRIMARY: u8 = 1;
pub const SECONDARY: u8 = 2;

pub const DEFAULT_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FusionStats {
    /// Voxels labelled as structure after promotion.
    pub primary_voxels: usize,
    pub secondary_voxels: usize,
    /// Pathology voxels that lay outside the structure mask.
    pub promoted_voxels: usize,
}

#[derive(Debug, Clone)]
pub struct FusedLabel {
    pub volume: Volume,
    pub stats: FusionStats,
}

/// The three co-registered volumes of one subject.
#[derive(Debug, Clone)]
pub struct SubjectVolumes {
    pub image: Volume,
    pub primary: Volume,
    pub secondary: Volume,
}

/// Loads a subject's volumes. An absent mask file is reported as
/// [`ConvertError::MissingCompanionFile`] before anything is read.
pub fn load_subject(
    secondary_mask_path: &Utf8Path,
    primary_mask_path: &Utf8Path,
    image_path: &Utf8Path,
    subject_key: &str,
) -> Result<SubjectVolumes, ConvertError> {
    for path in [secondary_mask_path, primary_mask_path] {
        if !path.as_std_path().is_file() {
            return Err(ConvertError::MissingCompanionFile {
                subject: subject_key.to_string(),
                path: path.as_std_path().to_path_buf(),
            });
        }
    }

    Ok(SubjectVolumes {
        image: Volume::load(image_path)?,
        primary: Volume::load(primary_mask_path)?,
        secondary: Volume::load(secondary_mask_path)?,
    })
}

/// Loads the three co-registered volumes and fuses both masks.
pub fn fuse(
    secondary_mask_path: &Utf8Path,
    primary_mask_path: &Utf8Path,
    image_path: &Utf8Path,
    subject_key: &str,
    threshold: f32,
) -> Result<FusedLabel, ConvertError> {
    let volumes = load_subject(secondary_mask_path, primary_mask_path, image_path, subject_key)?;
    fuse_volumes(
        &volumes.image,
        &volumes.primary,
        &volumes.secondary,
        subject_key,
        threshold,
    )
}

pub fn fuse_volumes(
    image: &Volume,
    primary: &Volume,
    secondary: &Volume,
    subject_key: &str,
    threshold: f32,
) -> Result<FusedLabel, ConvertError> {
    let expected = image.shape();
    for mask in [primary, secondary] {
        if mask.shape() != expected {
            return Err(ConvertError::ShapeMismatch {
                subject: subject_key.to_string(),
                expected,
                found: mask.shape(),
            });
        }
    }

    let mut stats = FusionStats::default();
    let fused: Array3<f32> = Zip::from(primary.data())
        .and(secondary.data())
        .map_collect(|&structure, &pathology| {
            let in_structure = structure >= threshold;
            let in_pathology = pathology >= threshold;
            if in_pathology {
                stats.secondary_voxels += 1;
                stats.primary_voxels += 1;
                if !in_structure {
                    stats.promoted_voxels += 1;
                }
                f32::from(SECONDARY)
            } else if in_structure {
                stats.primary_voxels += 1;
                f32::from(PRIMARY)
            } else {
                f32::from(BACKGROUND)
            }
        });

    if stats.promoted_voxels > 0 {
        tracing::info!(
            subject = subject_key,
            promoted = stats.promoted_voxels,
            "pathology voxels outside the structure mask were folded into it"
        );
    }
    tracing::debug!(
        subject = subject_key,
        primary = stats.primary_voxels,
        secondary = stats.secondary_voxels,
        "fused label"
    );

    Ok(FusedLabel {
        volume: primary
            .with_data(fused, StorageType::U8)
            .map_err(|err| match err {
                ConvertError::ShapeMismatch {
                    expected, found, ..
                } => ConvertError::ShapeMismatch {
                    subject: subject_key.to_string(),
                    expected,
                    found,
                },
                other => other,
            })?,
        stats,
    })
}
