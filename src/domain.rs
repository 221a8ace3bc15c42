use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::ConvertError;

/// File ending shared by every image and label the consumer reads.
pub const FILE_ENDING: &str = ".nii.gz";

/// Anatomical side at which voxel index 0 of an axis lies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnatomicalSide {
    Right,
    Left,
    Anterior,
    Posterior,
    Superior,
    Inferior,
}

impl AnatomicalSide {
    /// World (RAS+) axis this side belongs to.
    pub fn world_axis(self) -> usize {
        match self {
            AnatomicalSide::Right | AnatomicalSide::Left => 0,
            AnatomicalSide::Anterior | AnatomicalSide::Posterior => 1,
            AnatomicalSide::Superior | AnatomicalSide::Inferior => 2,
        }
    }

    pub fn from_direction(world_axis: usize, positive: bool) -> Self {
        match (world_axis, positive) {
            (0, true) => AnatomicalSide::Left,
            (0, false) => AnatomicalSide::Right,
            (1, true) => AnatomicalSide::Posterior,
            (1, false) => AnatomicalSide::Anterior,
            (_, true) => AnatomicalSide::Inferior,
            (_, false) => AnatomicalSide::Superior,
        }
    }

    fn letter(self) -> char {
        match self {
            AnatomicalSide::Right => 'R',
            AnatomicalSide::Left => 'L',
            AnatomicalSide::Anterior => 'A',
            AnatomicalSide::Posterior => 'P',
            AnatomicalSide::Superior => 'S',
            AnatomicalSide::Inferior => 'I',
        }
    }

    fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'R' => Some(AnatomicalSide::Right),
            'L' => Some(AnatomicalSide::Left),
            'A' => Some(AnatomicalSide::Anterior),
            'P' => Some(AnatomicalSide::Posterior),
            'S' => Some(AnatomicalSide::Superior),
            'I' => Some(AnatomicalSide::Inferior),
            _ => None,
        }
    }
}

/// Three-letter anatomical orientation code such as `RPI`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrientationCode([AnatomicalSide; 3]);

impl OrientationCode {
    pub const RPI: OrientationCode = OrientationCode([
        AnatomicalSide::Right,
        AnatomicalSide::Posterior,
        AnatomicalSide::Inferior,
    ]);

    pub fn new(sides: [AnatomicalSide; 3]) -> Result<Self, ConvertError> {
        let mut seen = [false; 3];
        for side in sides {
            let axis = side.world_axis();
            if seen[axis] {
                let code: String = sides.iter().map(|side| side.letter()).collect();
                return Err(ConvertError::InvalidOrientation(code));
            }
            seen[axis] = true;
        }
        Ok(Self(sides))
    }

    pub fn sides(&self) -> [AnatomicalSide; 3] {
        self.0
    }
}

impl Default for OrientationCode {
    fn default() -> Self {
        OrientationCode::RPI
    }
}

impl fmt::Display for OrientationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for side in self.0 {
            write!(f, "{}", side.letter())?;
        }
        Ok(())
    }
}

impl FromStr for OrientationCode {
    type Err = ConvertError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let sides = normalized
            .chars()
            .map(AnatomicalSide::from_letter)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ConvertError::InvalidOrientation(value.to_string()))?;
        let sides: [AnatomicalSide; 3] = sides
            .try_into()
            .map_err(|_| ConvertError::InvalidOrientation(value.to_string()))?;
        Self::new(sides).map_err(|_| ConvertError::InvalidOrientation(value.to_string()))
    }
}

impl Serialize for OrientationCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OrientationCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Contributing data-collection site, e.g. `site_012`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SiteId(String);

impl SiteId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SiteId {
    type Err = ConvertError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix("site_")
            .ok_or_else(|| ConvertError::InvalidSiteId(value.to_string()))?;
        let is_valid = digits.len() == 3 && digits.chars().all(|ch| ch.is_ascii_digit());
        if !is_valid {
            return Err(ConvertError::InvalidSiteId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// Train/test proportions; both positive and summing to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SplitRatio {
    train: f64,
    test: f64,
}

impl SplitRatio {
    const TOLERANCE: f64 = 1e-6;

    pub fn new(train: f64, test: f64) -> Result<Self, ConvertError> {
        if !(train > 0.0 && test > 0.0) {
            return Err(ConvertError::InvalidSplit(format!(
                "ratios must be positive, got {train} and {test}"
            )));
        }
        if ((train + test) - 1.0).abs() > Self::TOLERANCE {
            return Err(ConvertError::InvalidSplit(format!(
                "ratios must sum to 1, got {train} + {test} = {}",
                train + test
            )));
        }
        Ok(Self { train, test })
    }

    pub fn from_slice(values: &[f64]) -> Result<Self, ConvertError> {
        match values {
            [train, test] => Self::new(*train, *test),
            _ => Err(ConvertError::InvalidSplit(format!(
                "expected exactly two ratios (train test), got {}",
                values.len()
            ))),
        }
    }

    pub fn train(&self) -> f64 {
        self.train
    }

    pub fn test(&self) -> f64 {
        self.test
    }
}

impl Default for SplitRatio {
    fn default() -> Self {
        Self {
            train: 0.8,
            test: 0.2,
        }
    }
}

/// One imaging file with its two companion masks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectRecord {
    /// Name of the source dataset the file was discovered in.
    pub source_id: String,
    /// `sub-<id>[_ses-<id>]`; empty when the path carries no subject token.
    pub subject_key: String,
    pub site: Option<SiteId>,
    pub image_path: Utf8PathBuf,
    pub primary_mask_path: Utf8PathBuf,
    pub secondary_mask_path: Utf8PathBuf,
}

impl SubjectRecord {
    /// Raw image file name without the `.nii.gz` ending.
    pub fn image_stem(&self) -> &str {
        let name = self.image_path.file_name().unwrap_or_default();
        name.strip_suffix(FILE_ENDING).unwrap_or(name)
    }

    pub fn image_file_name(&self) -> &str {
        self.image_path.file_name().unwrap_or_default()
    }

    /// Identifier used in log records and skip reports.
    pub fn display_key(&self) -> &str {
        if self.subject_key.is_empty() {
            self.image_stem()
        } else {
            &self.subject_key
        }
    }
}
