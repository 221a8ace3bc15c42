//! nnU-Net raw dataset tree and the emitter that fills it.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::{FILE_ENDING, OrientationCode, SiteId, Split, SubjectRecord};
use crate::error::ConvertError;
use crate::fusion;
use crate::split::Assignment;
use crate::store;
use crate::volume::Volume;

/// Channel index of the raw image.
pub const IMAGE_CHANNEL: u32 = 0;
/// Channel index of the fused structure label.
pub const FUSED_CHANNEL: u32 = 1;

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: Utf8PathBuf,
    dataset_name: String,
}

impl OutputLayout {
    /// `<path_out>/Dataset<NNN>_<name>Seed<seed>`.
    pub fn new(path_out: &Utf8Path, dataset_number: u32, dataset_name: &str, seed: u64) -> Self {
        Self {
            root: path_out.join(format!("Dataset{dataset_number:03}_{dataset_name}Seed{seed}")),
            dataset_name: dataset_name.to_string(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn log_path(&self) -> Utf8PathBuf {
        self.root.join("logs.txt")
    }

    pub fn image_dir(&self, split: Split, site: Option<&SiteId>) -> Utf8PathBuf {
        self.root.join(split_dir("images", split, site))
    }

    pub fn label_dir(&self, split: Split, site: Option<&SiteId>) -> Utf8PathBuf {
        self.root.join(split_dir("labels", split, site))
    }

    /// Creates the training pair and one test pair per site. Idempotent.
    pub fn prepare<'a>(
        &self,
        test_sites: impl IntoIterator<Item = Option<&'a SiteId>>,
    ) -> Result<(), ConvertError> {
        store::ensure_dir(&self.image_dir(Split::Train, None))?;
        store::ensure_dir(&self.label_dir(Split::Train, None))?;
        for site in test_sites {
            store::ensure_dir(&self.image_dir(Split::Test, site))?;
            store::ensure_dir(&self.label_dir(Split::Test, site))?;
        }
        Ok(())
    }

    pub fn image_path(
        &self,
        split: Split,
        site: Option<&SiteId>,
        basename: &str,
        counter: u32,
        channel: u32,
    ) -> Utf8PathBuf {
        self.image_dir(split, site)
            .join(image_file_name(&self.dataset_name, basename, counter, channel))
    }

    pub fn label_path(
        &self,
        split: Split,
        site: Option<&SiteId>,
        basename: &str,
        counter: u32,
    ) -> Utf8PathBuf {
        self.label_dir(split, site)
            .join(label_file_name(&self.dataset_name, basename, counter))
    }
}

fn split_dir(kind: &str, split: Split, site: Option<&SiteId>) -> String {
    match (split, site) {
        (Split::Train, _) => format!("{kind}Tr"),
        (Split::Test, Some(site)) => format!("{kind}Ts_{site}"),
        (Split::Test, None) => format!("{kind}Ts"),
    }
}

/// `<dataset>_<basename>_<counter:03>_<channel:04>.nii.gz`
pub fn image_file_name(dataset_name: &str, basename: &str, counter: u32, channel: u32) -> String {
    format!("{dataset_name}_{basename}_{counter:03}_{channel:04}{FILE_ENDING}")
}

/// `<dataset>_<basename>_<counter:03>.nii.gz`
pub fn label_file_name(dataset_name: &str, basename: &str, counter: u32) -> String {
    format!("{dataset_name}_{basename}_{counter:03}{FILE_ENDING}")
}

#[derive(Debug, Clone, Serialize)]
pub struct EmittedSubject {
    pub split: Split,
    pub counter: u32,
    pub subject: String,
    pub site: Option<SiteId>,
    /// Raw image file name, as listed in the split record.
    pub image_file_name: String,
    pub files: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedSubject {
    pub subject: String,
    pub path: Utf8PathBuf,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmitReport {
    pub emitted: Vec<EmittedSubject>,
    /// Subjects left out on purpose (missing companion, no assignment).
    pub skipped: Vec<SkippedSubject>,
    /// Subjects whose volumes could not be processed.
    pub failed: Vec<SkippedSubject>,
}

impl EmitReport {
    pub fn count(&self, split: Split) -> usize {
        self.emitted
            .iter()
            .filter(|subject| subject.split == split)
            .count()
    }

    /// Sorted raw image file names of one split.
    pub fn file_names(&self, split: Split) -> Vec<String> {
        let mut names: Vec<String> = self
            .emitted
            .iter()
            .filter(|subject| subject.split == split)
            .map(|subject| subject.image_file_name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn per_site(&self, split: Split) -> BTreeMap<Option<SiteId>, usize> {
        let mut counts = BTreeMap::new();
        for subject in self.emitted.iter().filter(|subject| subject.split == split) {
            *counts.entry(subject.site.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Writes the two image channels and the label of every assigned subject.
pub struct LayoutEmitter<'a> {
    layout: &'a OutputLayout,
    orientation: OrientationCode,
    threshold: f32,
}

impl<'a> LayoutEmitter<'a> {
    pub fn new(layout: &'a OutputLayout, orientation: OrientationCode, threshold: f32) -> Self {
        Self {
            layout,
            orientation,
            threshold,
        }
    }

    /// Processes subjects in secondary-mask path order. A split counter only
    /// advances once all files of a subject were written, so numbering stays
    /// dense across skipped and failed subjects.
    ///
    /// Errors that are not tied to a single subject abort the emission.
    pub fn emit(
        &self,
        subjects: &[SubjectRecord],
        assignment: &Assignment,
    ) -> Result<EmitReport, ConvertError> {
        let mut ordered: Vec<&SubjectRecord> = subjects.iter().collect();
        ordered.sort_by(|a, b| a.secondary_mask_path.cmp(&b.secondary_mask_path));

        let mut counters: BTreeMap<Split, u32> = BTreeMap::new();
        let mut report = EmitReport::default();
        for record in ordered {
            let Some(split) = assignment.get(record) else {
                let err = ConvertError::UnresolvedAssignment(record.display_key().to_string());
                tracing::warn!(
                    subject = record.display_key(),
                    kind = err.kind(),
                    path = %record.secondary_mask_path,
                    "skipping file, not located in the train or test split"
                );
                report.skipped.push(skip(record, &err));
                continue;
            };

            let counter = counters.get(&split).copied().unwrap_or(0) + 1;
            match self.emit_subject(record, split, counter) {
                Ok(emitted) => {
                    counters.insert(split, counter);
                    tracing::info!(
                        subject = record.display_key(),
                        split = %split,
                        counter,
                        "emitted subject"
                    );
                    report.emitted.push(emitted);
                }
                Err(err @ ConvertError::MissingCompanionFile { .. }) => {
                    tracing::warn!(
                        subject = record.display_key(),
                        kind = err.kind(),
                        "{err}; skipping"
                    );
                    report.skipped.push(skip(record, &err));
                }
                Err(err) if err.is_subject_scoped() => {
                    tracing::error!(
                        subject = record.display_key(),
                        kind = err.kind(),
                        "{err}; subject excluded"
                    );
                    report.failed.push(skip(record, &err));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    fn emit_subject(
        &self,
        record: &SubjectRecord,
        split: Split,
        counter: u32,
    ) -> Result<EmittedSubject, ConvertError> {
        let key = record.display_key();
        let volumes = fusion::load_subject(
            &record.secondary_mask_path,
            &record.primary_mask_path,
            &record.image_path,
            key,
        )?;
        let fused = fusion::fuse_volumes(
            &volumes.image,
            &volumes.primary,
            &volumes.secondary,
            key,
            self.threshold,
        )?;

        let site = if split == Split::Test {
            record.site.as_ref()
        } else {
            None
        };
        let basename = record.image_stem();
        let outputs = [
            (
                volumes.image,
                self.layout
                    .image_path(split, site, basename, counter, IMAGE_CHANNEL),
            ),
            (
                fused.volume,
                self.layout
                    .image_path(split, site, basename, counter, FUSED_CHANNEL),
            ),
            (
                volumes.secondary,
                self.layout.label_path(split, site, basename, counter),
            ),
        ];

        let mut written = Vec::with_capacity(outputs.len());
        for (mut volume, path) in outputs {
            if let Err(err) = self.write_volume(&mut volume, &path) {
                store::remove_files(&written);
                return Err(err);
            }
            written.push(path);
        }

        Ok(EmittedSubject {
            split,
            counter,
            subject: key.to_string(),
            site: record.site.clone(),
            image_file_name: record.image_file_name().to_string(),
            files: written,
        })
    }

    fn write_volume(&self, volume: &mut Volume, path: &Utf8Path) -> Result<(), ConvertError> {
        volume.set_orientation(self.orientation);
        volume.save(path)
    }
}

fn skip(record: &SubjectRecord, err: &ConvertError) -> SkippedSubject {
    SkippedSubject {
        subject: record.display_key().to_string(),
        path: record.secondary_mask_path.clone(),
        kind: err.kind(),
        reason: err.to_string(),
    }
}

/// Test-split sites that need their own directory pair.
pub fn test_sites<'a>(
    subjects: &'a [SubjectRecord],
    assignment: &Assignment,
) -> BTreeSet<Option<&'a SiteId>> {
    subjects
        .iter()
        .filter(|record| assignment.get(record) == Some(Split::Test))
        .map(|record| record.site.as_ref())
        .collect()
}
