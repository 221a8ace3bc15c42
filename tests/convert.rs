use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use ndarray::Array3;
use serde::Deserialize;

use bids_nnunet::app::Converter;
use bids_nnunet::config::{ConfigLoader, ConfigOverrides, ConvertConfig};
use bids_nnunet::domain::{OrientationCode, SplitRatio};
use bids_nnunet::error::ConvertError;
use bids_nnunet::provenance::{Provenance, ProvenanceLookup};
use bids_nnunet::volume::{Affine, StorageType, Volume};

struct FixedProvenance;

impl ProvenanceLookup for FixedProvenance {
    fn describe(&self, _dataset_dir: &Path) -> Result<Provenance, ConvertError> {
        Ok(Provenance {
            branch: "master".to_string(),
            revision: "abc1234".to_string(),
        })
    }
}

struct NoProvenance;

impl ProvenanceLookup for NoProvenance {
    fn describe(&self, dataset_dir: &Path) -> Result<Provenance, ConvertError> {
        Err(ConvertError::Git(format!(
            "not a git repository: {}",
            dataset_dir.display()
        )))
    }
}

#[derive(Debug, Deserialize)]
struct SplitFile {
    train: Vec<String>,
    test: Vec<String>,
}

const SHAPE: (usize, usize, usize) = (4, 3, 2);

fn ras_affine() -> Affine {
    [
        [1.0, 0.0, 0.0, -2.0],
        [0.0, 1.0, 0.0, -1.5],
        [0.0, 0.0, 2.0, 10.0],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

fn utf8(path: &Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

/// Voxel axes run towards S, R and A with spacings 2, 1 and 3.
fn permuted_affine() -> Affine {
    [
        [0.0, -1.0, 0.0, 5.0],
        [0.0, 0.0, 3.0, -4.0],
        [2.0, 0.0, 0.0, 1.0],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

fn world(affine: &Affine, index: [usize; 3]) -> [f64; 3] {
    let mut point = [0.0; 3];
    for row in 0..3 {
        point[row] = affine[row][3]
            + (0..3)
                .map(|col| affine[row][col] * index[col] as f64)
                .sum::<f64>();
    }
    point
}

fn write_volume(path: &Utf8Path, data: Array3<f32>, storage: StorageType) {
    write_volume_with(path, data, ras_affine(), storage);
}

fn write_volume_with(path: &Utf8Path, data: Array3<f32>, affine: Affine, storage: StorageType) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    Volume::new(data, affine, storage).save(path).unwrap();
}

/// Writes image, structure mask and (optionally) pathology mask of one subject.
fn write_subject(root: &Utf8Path, subject: &str, with_structure: bool) {
    let anat = root.join(subject).join("anat");
    let labels = root.join("derivatives/labels").join(subject).join("anat");
    let stem = format!("{subject}_acq-sag_T2w");

    let image = Array3::from_shape_fn(SHAPE, |(x, y, z)| (x * 100 + y * 10 + z) as f32);
    write_volume(&anat.join(format!("{stem}.nii.gz")), image, StorageType::I16);

    let mut structure = Array3::<f32>::zeros(SHAPE);
    structure[[1, 1, 0]] = 1.0;
    structure[[2, 1, 0]] = 1.0;
    let mut pathology = Array3::<f32>::zeros(SHAPE);
    pathology[[2, 1, 0]] = 1.0;
    pathology[[3, 2, 1]] = 1.0;

    if with_structure {
        write_volume(
            &labels.join(format!("{stem}_seg.nii.gz")),
            structure,
            StorageType::U8,
        );
    }
    write_volume(
        &labels.join(format!("{stem}_lesion.nii.gz")),
        pathology,
        StorageType::U8,
    );
}

fn config(sources: &[&Utf8Path], out: &Utf8Path, seed: u64) -> ConvertConfig {
    let overrides = ConfigOverrides {
        path_data: sources.iter().map(|path| path.to_string()).collect(),
        path_out: Some(out.to_string()),
        dataset_name: Some("tSCI".to_string()),
        seed: Some(seed),
        ..ConfigOverrides::default()
    };
    ConfigLoader::resolve_config(Default::default(), overrides).unwrap()
}

fn file_names(dir: &Utf8Path) -> BTreeSet<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect()
}

fn site_fixture(temp: &Path) -> Utf8PathBuf {
    let source = utf8(temp).join("site_012");
    for i in 1..=5 {
        write_subject(&source, &format!("sub-nsha{i:02}"), true);
    }
    write_subject(&source, "sub-nsha06", false);
    source
}

#[test]
fn convert_site_into_nnunet_layout() {
    let temp = tempfile::tempdir().unwrap();
    let source = site_fixture(temp.path());
    let out = utf8(temp.path()).join("out");

    let converter = Converter::new(FixedProvenance);
    let result = converter.convert(&config(&[&source], &out, 50)).unwrap();

    let root = out.join("Dataset502_tSCISeed50");
    assert_eq!(result.output_root, root);
    assert_eq!(result.num_training + result.num_test, 5);
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.skipped[0].kind, "missing_companion_file");
    assert!(result.failed.is_empty());

    // counters are dense per split
    let labels_tr = file_names(&root.join("labelsTr"));
    assert_eq!(labels_tr.len(), result.num_training);
    let counters: BTreeSet<String> = labels_tr
        .iter()
        .map(|name| {
            let stem = name.strip_suffix(".nii.gz").unwrap();
            stem.rsplit('_').next().unwrap().to_string()
        })
        .collect();
    let expected: BTreeSet<String> = (1..=result.num_training)
        .map(|i| format!("{i:03}"))
        .collect();
    assert_eq!(counters, expected);
    assert_eq!(
        file_names(&root.join("imagesTr")).len(),
        2 * result.num_training
    );
    if result.num_test > 0 {
        assert_eq!(
            file_names(&root.join("labelsTs_site_012")).len(),
            result.num_test
        );
        assert_eq!(result.test_per_site.get("site_012"), Some(&result.num_test));
    }
    assert_eq!(
        result.train_per_site.get("site_012"),
        Some(&result.num_training)
    );
    assert_eq!(result.train_per_site.len(), 1);

    let metadata: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(root.join("dataset.json")).unwrap()).unwrap();
    assert_eq!(metadata["numTraining"], result.num_training);
    assert_eq!(metadata["numTest"], result.num_test);
    assert_eq!(metadata["seed_used"], 50);
    assert_eq!(metadata["image_orientation"], "RPI");
    assert_eq!(metadata["channel_names"]["0"], "acq-sag_T2w");
    assert_eq!(metadata["channel_names"]["1"], "SC_seg");
    assert_eq!(metadata["labels"]["background"], 0);
    assert_eq!(metadata["labels"]["lesion"], 1);
    assert_eq!(metadata["dataset_versions"]["site_012"], "git-master-abc1234");

    let split: SplitFile = serde_yaml::from_str(
        &fs::read_to_string(root.join("train_test_split_seed50.yaml")).unwrap(),
    )
    .unwrap();
    assert_eq!(split.train.len(), result.num_training);
    assert_eq!(split.test.len(), result.num_test);
    assert!(split.train.iter().all(|name| name.ends_with("_acq-sag_T2w.nii.gz")));
    let train: BTreeSet<&String> = split.train.iter().collect();
    assert!(split.test.iter().all(|name| !train.contains(name)));

    // the subject without a structure mask left no trace
    assert!(!split.train.iter().chain(&split.test).any(|name| name.contains("sub-nsha06")));
    for dir in fs::read_dir(&root).unwrap() {
        let dir = dir.unwrap().path();
        if dir.is_dir() {
            let names = file_names(&utf8(&dir));
            assert!(names.iter().all(|name| !name.contains("sub-nsha06")));
        }
    }
}

#[test]
fn emitted_volumes_are_reoriented_and_fused() {
    let temp = tempfile::tempdir().unwrap();
    let source = site_fixture(temp.path());
    let out = utf8(temp.path()).join("out");

    Converter::new(FixedProvenance)
        .convert(&config(&[&source], &out, 50))
        .unwrap();

    let images = out.join("Dataset502_tSCISeed50").join("imagesTr");
    let fused_name = file_names(&images)
        .into_iter()
        .find(|name| name.ends_with("_0001.nii.gz"))
        .unwrap();
    let fused = Volume::load(&images.join(&fused_name)).unwrap();
    assert_eq!(fused.orientation(), OrientationCode::RPI);
    assert_eq!(fused.storage(), StorageType::U8);
    assert_eq!(fused.shape(), [4, 3, 2]);

    let mut values: Vec<u8> = fused.data().iter().map(|v| *v as u8).collect();
    values.sort();
    values.dedup();
    // the pathology voxel outside the structure was promoted into it
    assert_eq!(values, vec![0, 1, 2]);
    assert_eq!(fused.data().iter().filter(|v| **v == 2.0).count(), 2);
    assert_eq!(fused.data().iter().filter(|v| **v == 1.0).count(), 1);

    let image_name = fused_name.replace("_0001.nii.gz", "_0000.nii.gz");
    let image = Volume::load(&images.join(&image_name)).unwrap();
    assert_eq!(image.orientation(), OrientationCode::RPI);
    assert_eq!(image.storage(), StorageType::I16);
    // x was flipped: new index 0 holds the old last slice
    assert_eq!(image.data()[[0, 0, 0]], 300.0);
}

#[test]
fn same_seed_reproduces_the_split() {
    let temp = tempfile::tempdir().unwrap();
    let source = site_fixture(temp.path());
    let first = utf8(temp.path()).join("first");
    let second = utf8(temp.path()).join("second");

    let converter = Converter::new(FixedProvenance);
    converter.convert(&config(&[&source], &first, 50)).unwrap();
    converter.convert(&config(&[&source], &second, 50)).unwrap();

    let read = |root: &Utf8Path| {
        fs::read_to_string(
            root.join("Dataset502_tSCISeed50")
                .join("train_test_split_seed50.yaml"),
        )
        .unwrap()
    };
    assert_eq!(read(&first), read(&second));
}

#[test]
fn unversioned_sources_are_recorded() {
    let temp = tempfile::tempdir().unwrap();
    let source = site_fixture(temp.path());
    let out = utf8(temp.path()).join("out");

    let result = Converter::new(NoProvenance)
        .convert(&config(&[&source], &out, 50))
        .unwrap();
    assert_eq!(result.dataset_versions["site_012"], "unversioned");
}

#[test]
fn test_subjects_without_site_share_one_directory() {
    let temp = tempfile::tempdir().unwrap();
    let source = utf8(temp.path()).join("cohort");
    write_subject(&source, "sub-a01", true);
    write_subject(&source, "sub-a02", true);
    let out = utf8(temp.path()).join("out");

    let mut settings = config(&[&source], &out, 3);
    settings.split = SplitRatio::new(0.5, 0.5).unwrap();
    let result = Converter::new(FixedProvenance).convert(&settings).unwrap();

    assert_eq!((result.num_training, result.num_test), (1, 1));
    let root = out.join("Dataset502_tSCISeed3");
    assert_eq!(file_names(&root.join("imagesTs")).len(), 2);
    assert_eq!(file_names(&root.join("labelsTs")).len(), 1);
    assert_eq!(result.test_per_site.get("unknown"), Some(&1));
    assert_eq!(result.train_per_site.get("unknown"), Some(&1));
}

#[test]
fn missing_source_fails_before_writing() {
    let temp = tempfile::tempdir().unwrap();
    let source = utf8(temp.path()).join("site_999");
    let out = utf8(temp.path()).join("out");

    let err = Converter::new(FixedProvenance)
        .convert(&config(&[&source], &out, 50))
        .unwrap_err();
    assert_matches!(err, ConvertError::InvalidSourcePath(_));
    assert!(!out.exists());
}

#[test]
fn repeated_source_is_emitted_once() {
    let temp = tempfile::tempdir().unwrap();
    let source = site_fixture(temp.path());
    let out = utf8(temp.path()).join("out");

    let result = Converter::new(FixedProvenance)
        .convert(&config(&[&source, &source], &out, 50))
        .unwrap();
    assert_eq!(result.num_training + result.num_test, 5);
    assert_eq!(result.skipped.len(), 1);
}

/// Every `.nii.gz` below `root`, keyed by its parent directory name.
fn emitted_volumes(root: &Utf8Path) -> Vec<(String, Utf8PathBuf)> {
    let mut volumes = Vec::new();
    for dir in fs::read_dir(root).unwrap() {
        let dir = utf8(&dir.unwrap().path());
        if !dir.is_dir() {
            continue;
        }
        for name in file_names(&dir) {
            if name.ends_with(".nii.gz") {
                volumes.push((dir.file_name().unwrap().to_string(), dir.join(name)));
            }
        }
    }
    volumes
}

#[test]
fn unreadable_image_fails_only_that_subject() {
    let temp = tempfile::tempdir().unwrap();
    let source = site_fixture(temp.path());
    write_subject(&source, "sub-nsha06", true);
    fs::write(
        source.join("sub-nsha02/anat/sub-nsha02_acq-sag_T2w.nii.gz"),
        b"not a volume",
    )
    .unwrap();
    let out = utf8(temp.path()).join("out");

    let result = Converter::new(FixedProvenance)
        .convert(&config(&[&source], &out, 50))
        .unwrap();

    assert!(result.skipped.is_empty());
    let failed: Vec<(&str, &str)> = result
        .failed
        .iter()
        .map(|subject| (subject.subject.as_str(), subject.kind))
        .collect();
    assert_eq!(failed, vec![("sub-nsha02", "volume_io")]);
    assert_eq!(result.num_training + result.num_test, 5);

    let root = out.join("Dataset502_tSCISeed50");
    let counters = |dir: &str| -> BTreeSet<String> {
        let dir = root.join(dir);
        if !dir.exists() {
            return BTreeSet::new();
        }
        file_names(&dir)
            .iter()
            .map(|name| {
                let stem = name.strip_suffix(".nii.gz").unwrap();
                stem.rsplit('_').next().unwrap().to_string()
            })
            .collect()
    };
    let dense = |count: usize| -> BTreeSet<String> {
        (1..=count).map(|i| format!("{i:03}")).collect()
    };
    assert_eq!(counters("labelsTr"), dense(result.num_training));
    assert_eq!(counters("labelsTs_site_012"), dense(result.num_test));

    // nothing of the failed subject reached the output
    for (_, path) in emitted_volumes(&root) {
        assert!(!path.as_str().contains("sub-nsha02"), "{path}");
    }
    for manifest in ["dataset.json", "train_test_split_seed50.yaml"] {
        let content = fs::read_to_string(root.join(manifest)).unwrap();
        assert!(!content.contains("sub-nsha02"));
    }
}

#[test]
fn permuted_source_axes_are_reoriented_on_disk() {
    let temp = tempfile::tempdir().unwrap();
    let source = utf8(temp.path()).join("site_012");
    let shape = (4, 5, 6);
    let marker = [1, 2, 3];
    for i in 1..=6 {
        let subject = format!("sub-perm{i:02}");
        let anat = source.join(&subject).join("anat");
        let labels = source.join("derivatives/labels").join(&subject).join("anat");
        let stem = format!("{subject}_acq-sag_T2w");

        let mut image = Array3::<f32>::zeros(shape);
        image[marker] = 123.0;
        let mut mask = Array3::<f32>::zeros(shape);
        mask[marker] = 1.0;
        write_volume_with(
            &anat.join(format!("{stem}.nii.gz")),
            image,
            permuted_affine(),
            StorageType::I16,
        );
        write_volume_with(
            &labels.join(format!("{stem}_seg.nii.gz")),
            mask.clone(),
            permuted_affine(),
            StorageType::U8,
        );
        write_volume_with(
            &labels.join(format!("{stem}_lesion.nii.gz")),
            mask,
            permuted_affine(),
            StorageType::U8,
        );
    }
    let out = utf8(temp.path()).join("out");

    let result = Converter::new(FixedProvenance)
        .convert(&config(&[&source], &out, 50))
        .unwrap();
    assert_eq!((result.num_training, result.num_test), (4, 2));
    assert!(result.failed.is_empty());

    let expected_world = world(&permuted_affine(), marker);
    assert_eq!(expected_world, [3.0, 5.0, 3.0]);

    let volumes = emitted_volumes(&out.join("Dataset502_tSCISeed50"));
    // two image channels and one label per subject
    assert_eq!(volumes.len(), 18);
    for dir in ["imagesTr", "labelsTr"] {
        assert!(volumes.iter().any(|(parent, _)| parent == dir));
    }
    for (parent, path) in &volumes {
        let volume = Volume::load(path).unwrap();
        assert_eq!(volume.orientation(), OrientationCode::RPI, "{path}");
        assert_eq!(volume.shape(), [5, 6, 4], "{path}");
        assert_eq!(volume.voxel_size(), [1.0, 3.0, 2.0], "{path}");

        let expected_value = if parent.starts_with("labels") {
            1.0
        } else if path.as_str().ends_with("_0000.nii.gz") {
            123.0
        } else {
            // structure and pathology overlap on the marker voxel
            2.0
        };
        let marked: Vec<[usize; 3]> = volume
            .data()
            .indexed_iter()
            .filter(|(_, value)| **value != 0.0)
            .map(|((x, y, z), _)| [x, y, z])
            .collect();
        assert_eq!(marked.len(), 1, "{path}");
        assert_eq!(volume.data()[marked[0]], expected_value, "{path}");

        let position = world(volume.affine(), marked[0]);
        for axis in 0..3 {
            assert!(
                (position[axis] - expected_world[axis]).abs() < 1e-4,
                "{path}: {position:?}"
            );
        }
    }
}
