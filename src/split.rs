use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::domain::{Split, SplitRatio, SubjectRecord};

/// How a named source deviates from the randomized split.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideRule {
    #[default]
    None,
    /// Listed subjects (subject key or image stem) always go to test.
    TestAllowList(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideTable {
    rules: BTreeMap<String, OverrideRule>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source_id: impl Into<String>, rule: OverrideRule) {
        self.rules.insert(source_id.into(), rule);
    }

    pub fn rule_for(&self, source_id: &str) -> &OverrideRule {
        static NONE: OverrideRule = OverrideRule::None;
        self.rules.get(source_id).unwrap_or(&NONE)
    }
}

/// site_014 has only five subjects with usable sagittal T2w images; they are
/// held out for evaluation.
pub fn default_overrides() -> OverrideTable {
    let mut table = OverrideTable::new();
    table.insert(
        "site_014",
        OverrideRule::TestAllowList(
            [
                "sub-que002_acq-sagittal_run-01_T2w",
                "sub-que004_acq-sagittal_run-04_T2w",
                "sub-que005_acq-sagittal_run-01_T2w",
                "sub-que008_acq-sagittal_run-01_T2w",
                "sub-que012_acq-sagittal_run-02_T2w",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        ),
    );
    table
}

/// Subjects discovered in one source, in discovery order.
#[derive(Debug, Clone)]
pub struct SourceSubjects {
    pub source_id: String,
    pub subjects: Vec<SubjectRecord>,
}

/// Split membership keyed by each subject's secondary-mask path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    entries: BTreeMap<Utf8PathBuf, Split>,
}

impl Assignment {
    pub fn insert(&mut self, record: &SubjectRecord, split: Split) {
        self.entries
            .insert(record.secondary_mask_path.clone(), split);
    }

    pub fn get(&self, record: &SubjectRecord) -> Option<Split> {
        self.entries.get(&record.secondary_mask_path).copied()
    }

    pub fn contains(&self, record: &SubjectRecord) -> bool {
        self.entries.contains_key(&record.secondary_mask_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, split: Split) -> usize {
        self.entries.values().filter(|value| **value == split).count()
    }

    pub fn members(&self, split: Split) -> BTreeSet<&Utf8Path> {
        self.entries
            .iter()
            .filter(|(_, value)| **value == split)
            .map(|(key, _)| key.as_path())
            .collect()
    }

    pub fn train_set(&self) -> BTreeSet<&Utf8Path> {
        self.members(Split::Train)
    }

    pub fn test_set(&self) -> BTreeSet<&Utf8Path> {
        self.members(Split::Test)
    }
}

#[derive(Debug, Clone)]
pub struct CohortSplitter {
    ratio: SplitRatio,
    seed: u64,
    overrides: OverrideTable,
}

impl CohortSplitter {
    pub fn new(ratio: SplitRatio, seed: u64, overrides: OverrideTable) -> Self {
        Self {
            ratio,
            seed,
            overrides,
        }
    }

    /// Splits every source independently with the shared seed and merges
    /// the per-source results.
    pub fn split(&self, sources: &[SourceSubjects]) -> Assignment {
        let mut assignment = Assignment::default();
        for source in sources {
            let mut pending = Vec::with_capacity(source.subjects.len());
            for record in &source.subjects {
                if assignment.contains(record) {
                    tracing::warn!(
                        source = %source.source_id,
                        subject = record.display_key(),
                        "subject already assigned by an earlier source"
                    );
                    continue;
                }
                pending.push(record);
            }

            if let OverrideRule::TestAllowList(allowed) = self.overrides.rule_for(&source.source_id) {
                let mut matched = BTreeSet::new();
                pending.retain(|record| {
                    let hit = allowed
                        .iter()
                        .find(|entry| **entry == record.subject_key || **entry == record.image_stem());
                    match hit {
                        Some(entry) => {
                            matched.insert(entry.as_str());
                            assignment.insert(record, Split::Test);
                            false
                        }
                        None => true,
                    }
                });
                for entry in allowed.iter().filter(|entry| !matched.contains(entry.as_str())) {
                    tracing::warn!(
                        source = %source.source_id,
                        entry = entry.as_str(),
                        "allow-list entry matched no subject"
                    );
                }
            }

            let (train, test) = random_split(&pending, self.ratio.test(), self.seed);
            for record in train {
                assignment.insert(record, Split::Train);
            }
            for record in test {
                assignment.insert(record, Split::Test);
            }
            tracing::debug!(
                source = %source.source_id,
                subjects = source.subjects.len(),
                "source split"
            );
        }
        assignment
    }
}

/// Seeded shuffle-then-cut partition: the first `ceil(test_ratio * n)`
/// shuffled items form the test part.
pub fn random_split<T: Clone>(items: &[T], test_ratio: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let n = items.len();
    let n_test = ((test_ratio * n as f64) - 1e-9).ceil().clamp(0.0, n as f64) as usize;

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let test = indices[..n_test].iter().map(|&i| items[i].clone()).collect();
    let train = indices[n_test..].iter().map(|&i| items[i].clone()).collect();
    (train, test)
}
