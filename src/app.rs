use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::bids;
use crate::config::ConvertConfig;
use crate::domain::{SiteId, Split, SubjectRecord};
use crate::error::ConvertError;
use crate::layout::{
    EmitReport, FUSED_CHANNEL, IMAGE_CHANNEL, LayoutEmitter, OutputLayout, SkippedSubject,
    test_sites,
};
use crate::manifest::{self, DatasetMetadata};
use crate::provenance::{ProvenanceLookup, UNVERSIONED};
use crate::split::{CohortSplitter, SourceSubjects};
use crate::store;

#[derive(Debug, Clone, Serialize)]
pub struct ConvertResult {
    pub output_root: Utf8PathBuf,
    pub dataset_json: Utf8PathBuf,
    pub split_file: Utf8PathBuf,
    pub num_training: usize,
    pub num_test: usize,
    /// Emitted subjects per site; subjects without a site are counted under `unknown`.
    pub train_per_site: BTreeMap<String, usize>,
    pub test_per_site: BTreeMap<String, usize>,
    pub dataset_versions: BTreeMap<String, String>,
    pub skipped: Vec<SkippedSubject>,
    pub failed: Vec<SkippedSubject>,
}

#[derive(Clone)]
pub struct Converter<P: ProvenanceLookup> {
    provenance: P,
}

impl<P: ProvenanceLookup> Converter<P> {
    pub fn new(provenance: P) -> Self {
        Self { provenance }
    }

    /// Runs discovery, splitting, emission and manifest generation.
    ///
    /// Source paths are checked before anything is written; subject-level
    /// problems are reported in the result instead of aborting the run.
    pub fn convert(&self, config: &ConvertConfig) -> Result<ConvertResult, ConvertError> {
        validate_sources(config)?;

        let layout = OutputLayout::new(
            &config.path_out,
            config.dataset_number,
            &config.dataset_name,
            config.seed,
        );
        store::ensure_dir(layout.root())?;
        tracing::info!(root = %layout.root(), "converting into nnU-Net layout");

        let dataset_versions = self.dataset_versions(config);

        let mut sources = Vec::with_capacity(config.sources.len());
        for source in &config.sources {
            let subjects = bids::discover_subjects(&source.id, &source.path)?;
            tracing::info!(
                source = %source.id,
                subjects = subjects.len(),
                "discovered annotated images"
            );
            sources.push(SourceSubjects {
                source_id: source.id.clone(),
                subjects,
            });
        }

        let splitter = CohortSplitter::new(config.split, config.seed, config.overrides.clone());
        let assignment = splitter.split(&sources);
        tracing::info!(
            train = assignment.count(Split::Train),
            test = assignment.count(Split::Test),
            seed = config.seed,
            "subjects assigned"
        );

        // a root configured twice yields the same label paths twice
        let mut seen = BTreeSet::new();
        let subjects: Vec<SubjectRecord> = sources
            .into_iter()
            .flat_map(|source| source.subjects)
            .filter(|record| seen.insert(record.secondary_mask_path.clone()))
            .collect();
        layout.prepare(test_sites(&subjects, &assignment))?;

        let emitter = LayoutEmitter::new(&layout, config.orientation, config.threshold);
        let report = emitter.emit(&subjects, &assignment)?;

        let num_training = report.count(Split::Train);
        let num_test = report.count(Split::Test);
        tracing::info!(num_training, num_test, "emission finished");
        let train_per_site = site_counts(&report, Split::Train);
        for (site, count) in &train_per_site {
            tracing::info!(site = %site, count, "training subjects");
        }
        let test_per_site = site_counts(&report, Split::Test);
        for (site, count) in &test_per_site {
            tracing::info!(site = %site, count, "test subjects");
        }
        for (source, version) in &dataset_versions {
            tracing::info!(source = %source, version = %version, "dataset version");
        }

        let metadata = DatasetMetadata::builder(&config.dataset_name)
            .counts(num_training, num_test)
            .seed(config.seed)
            .versions(dataset_versions.clone())
            .orientation(config.orientation)
            .channel(IMAGE_CHANNEL, &config.channels.image)
            .channel(FUSED_CHANNEL, &config.channels.primary)
            .label(&config.label_name, 1)
            .build();
        let paths = manifest::write(
            report.file_names(Split::Train),
            report.file_names(Split::Test),
            &metadata,
            layout.root(),
        )?;

        Ok(ConvertResult {
            output_root: layout.root().to_path_buf(),
            dataset_json: paths.dataset_json,
            split_file: paths.split_yaml,
            num_training,
            num_test,
            train_per_site,
            test_per_site,
            dataset_versions,
            skipped: report.skipped,
            failed: report.failed,
        })
    }

    fn dataset_versions(&self, config: &ConvertConfig) -> BTreeMap<String, String> {
        config
            .sources
            .iter()
            .map(|source| {
                let version = match self.provenance.describe(source.path.as_std_path()) {
                    Ok(provenance) => provenance.to_string(),
                    Err(err) => {
                        tracing::warn!(source = %source.id, "no version information: {err}");
                        UNVERSIONED.to_string()
                    }
                };
                (source.id.clone(), version)
            })
            .collect()
    }
}

/// Every source root must be an existing directory.
pub fn validate_sources(config: &ConvertConfig) -> Result<(), ConvertError> {
    for source in &config.sources {
        if !source.path.as_std_path().is_dir() {
            return Err(ConvertError::InvalidSourcePath(
                source.path.as_std_path().to_path_buf(),
            ));
        }
    }
    Ok(())
}

fn site_counts(report: &EmitReport, split: Split) -> BTreeMap<String, usize> {
    report
        .per_site(split)
        .into_iter()
        .map(|(site, count)| (site_label(site.as_ref()), count))
        .collect()
}

fn site_label(site: Option<&SiteId>) -> String {
    site.map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}
