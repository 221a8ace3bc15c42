//! `dataset.json` and the train/test split record.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::{FILE_ENDING, OrientationCode};
use crate::error::ConvertError;
use crate::store;

pub const DATASET_JSON: &str = "dataset.json";

pub fn split_file_name(seed: u64) -> String {
    format!("train_test_split_seed{seed}.yaml")
}

/// Metadata describing channels, labels and provenance of a converted dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetMetadata {
    pub name: String,
    pub description: String,
    pub reference: String,
    pub licence: String,
    pub release: String,
    #[serde(rename = "numTraining")]
    pub num_training: usize,
    #[serde(rename = "numTest")]
    pub num_test: usize,
    pub seed_used: u64,
    pub dataset_versions: BTreeMap<String, String>,
    pub image_orientation: OrientationCode,
    pub channel_names: BTreeMap<String, String>,
    pub labels: BTreeMap<String, u8>,
    pub file_ending: String,
}

impl DatasetMetadata {
    pub fn builder(name: &str) -> DatasetMetadataBuilder {
        DatasetMetadataBuilder {
            metadata: DatasetMetadata {
                name: name.to_string(),
                description: name.to_string(),
                reference: "TBD".to_string(),
                licence: "TBD".to_string(),
                release: "0.0".to_string(),
                num_training: 0,
                num_test: 0,
                seed_used: 0,
                dataset_versions: BTreeMap::new(),
                image_orientation: OrientationCode::RPI,
                channel_names: BTreeMap::new(),
                labels: BTreeMap::from([("background".to_string(), 0)]),
                file_ending: FILE_ENDING.to_string(),
            },
        }
    }
}

pub struct DatasetMetadataBuilder {
    metadata: DatasetMetadata,
}

impl DatasetMetadataBuilder {
    pub fn counts(mut self, num_training: usize, num_test: usize) -> Self {
        self.metadata.num_training = num_training;
        self.metadata.num_test = num_test;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.metadata.seed_used = seed;
        self
    }

    pub fn versions(mut self, versions: BTreeMap<String, String>) -> Self {
        self.metadata.dataset_versions = versions;
        self
    }

    pub fn orientation(mut self, orientation: OrientationCode) -> Self {
        self.metadata.image_orientation = orientation;
        self
    }

    pub fn channel(mut self, index: u32, name: &str) -> Self {
        self.metadata
            .channel_names
            .insert(index.to_string(), name.to_string());
        self
    }

    pub fn label(mut self, name: &str, value: u8) -> Self {
        self.metadata.labels.insert(name.to_string(), value);
        self
    }

    pub fn build(self) -> DatasetMetadata {
        self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitRecord {
    pub train: Vec<String>,
    pub test: Vec<String>,
}

impl SplitRecord {
    /// Both lists are stored sorted.
    pub fn new(mut train: Vec<String>, mut test: Vec<String>) -> Self {
        train.sort();
        test.sort();
        Self { train, test }
    }
}

#[derive(Debug, Clone)]
pub struct ManifestPaths {
    pub dataset_json: Utf8PathBuf,
    pub split_yaml: Utf8PathBuf,
}

/// Serializes both documents, then publishes them together. Nothing is
/// written when either serialization fails.
///
/// The split record is committed before `dataset.json`, so a failed commit
/// never leaves a `dataset.json` naming a split record that is absent.
pub fn write(
    train: Vec<String>,
    test: Vec<String>,
    metadata: &DatasetMetadata,
    output_dir: &Utf8Path,
) -> Result<ManifestPaths, ConvertError> {
    let record = SplitRecord::new(train, test);
    let paths = ManifestPaths {
        dataset_json: output_dir.join(DATASET_JSON),
        split_yaml: output_dir.join(split_file_name(metadata.seed_used)),
    };

    let yaml = serde_yaml::to_string(&record)
        .map_err(|err| ConvertError::Manifest(format!("split record: {err}")))?;
    let json = to_json_indented(metadata)?;

    // commit order matters: dataset.json last
    let staged = vec![
        store::stage_bytes(&paths.split_yaml, yaml.as_bytes())?,
        store::stage_bytes(&paths.dataset_json, &json)?,
    ];
    store::commit_staged(staged)?;
    tracing::info!(
        dataset_json = %paths.dataset_json,
        split = %paths.split_yaml,
        "manifest written"
    );
    Ok(paths)
}

fn to_json_indented<T: Serialize>(value: &T) -> Result<Vec<u8>, ConvertError> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|err| ConvertError::Manifest(format!("dataset metadata: {err}")))?;
    buffer.push(b'\n');
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_field_names() {
        let metadata = DatasetMetadata::builder("tSCI")
            .counts(8, 2)
            .seed(50)
            .channel(0, "acq-sag_T2w")
            .channel(1, "SC_seg")
            .label("lesion", 1)
            .build();
        let json = String::from_utf8(to_json_indented(&metadata).unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["numTraining"], 8);
        assert_eq!(value["numTest"], 2);
        assert_eq!(value["channel_names"]["1"], "SC_seg");
        assert_eq!(value["labels"]["lesion"], 1);
        assert_eq!(value["image_orientation"], "RPI");
        assert_eq!(value["file_ending"], ".nii.gz");
        assert!(json.contains("\n    \"name\": \"tSCI\""));
    }

    #[test]
    fn split_record_is_committed_before_dataset_json() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(temp.path()).unwrap();
        // a directory in the way makes the dataset.json rename fail
        std::fs::create_dir(root.join(DATASET_JSON)).unwrap();
        let metadata = DatasetMetadata::builder("tSCI").seed(7).build();

        let err = write(vec!["a.nii.gz".to_string()], vec![], &metadata, root).unwrap_err();
        assert!(matches!(err, ConvertError::Filesystem(_)));
        assert!(root.join(split_file_name(7)).is_file());
        assert!(root.join(DATASET_JSON).is_dir());
    }

    #[test]
    fn split_record_is_sorted() {
        let record = SplitRecord::new(
            vec!["b.nii.gz".to_string(), "a.nii.gz".to_string()],
            vec![],
        );
        assert_eq!(record.train, vec!["a.nii.gz", "b.nii.gz"]);
    }
}
