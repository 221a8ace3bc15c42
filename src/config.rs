use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{OrientationCode, SplitRatio};
use crate::error::ConvertError;
use crate::fusion::DEFAULT_THRESHOLD;
use crate::split::{OverrideRule, OverrideTable, default_overrides};

pub const DEFAULT_CONFIG_FILE: &str = "bids2nnunet.json";
pub const DEFAULT_DATASET_NAME: &str = "tSCIpraxisMultiChannel";
pub const DEFAULT_DATASET_NUMBER: u32 = 502;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub path_out: Option<String>,
    #[serde(default)]
    pub dataset_name: Option<String>,
    #[serde(default)]
    pub dataset_number: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub split: Option<Vec<f64>>,
    #[serde(default)]
    pub orientation: Option<String>,
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub channels: Option<ChannelNames>,
    #[serde(default)]
    pub label_name: Option<String>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Shorthand(String),
    Detailed(SourceEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntryObject {
    pub path: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    /// Replaces the built-in override for this source; an empty list
    /// disables it.
    #[serde(default)]
    pub test_allow_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelNames {
    pub image: String,
    pub primary: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            image: "acq-sag_T2w".to_string(),
            primary: "SC_seg".to_string(),
        }
    }
}

/// One configured dataset root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub id: String,
    pub path: Utf8PathBuf,
    pub base_url: Option<String>,
    pub revision: Option<String>,
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub path_data: Vec<String>,
    pub path_out: Option<String>,
    pub dataset_name: Option<String>,
    pub dataset_number: Option<u32>,
    pub seed: Option<u64>,
    pub split: Option<Vec<f64>>,
    pub orientation: Option<String>,
    pub threshold: Option<f32>,
}

/// Fully validated conversion parameters.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    pub schema_version: u32,
    pub path_out: Utf8PathBuf,
    pub dataset_name: String,
    pub dataset_number: u32,
    pub seed: u64,
    pub split: SplitRatio,
    pub orientation: OrientationCode,
    pub threshold: f32,
    pub channels: ChannelNames,
    pub label_name: String,
    pub sources: Vec<SourceSpec>,
    pub overrides: OverrideTable,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the config file; without an explicit path a missing
    /// `bids2nnunet.json` yields an empty config.
    pub fn load(path: Option<&str>) -> Result<Config, ConvertError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ConvertError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| ConvertError::ConfigParse(err.to_string()))
    }

    pub fn resolve(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<ConvertConfig, ConvertError> {
        let config = Self::load(path)?;
        Self::resolve_config(config, overrides)
    }

    pub fn resolve_config(
        config: Config,
        overrides: ConfigOverrides,
    ) -> Result<ConvertConfig, ConvertError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let path_out = overrides
            .path_out
            .or(config.path_out)
            .map(|value| expand_home(&value))
            .ok_or_else(|| ConvertError::InvalidConfig("an output path is required".to_string()))?;

        let dataset_name = overrides
            .dataset_name
            .or(config.dataset_name)
            .unwrap_or_else(|| DEFAULT_DATASET_NAME.to_string());
        if dataset_name.trim().is_empty() {
            return Err(ConvertError::InvalidConfig(
                "dataset name must not be empty".to_string(),
            ));
        }

        let dataset_number = overrides
            .dataset_number
            .or(config.dataset_number)
            .unwrap_or(DEFAULT_DATASET_NUMBER);
        if !(1..=999).contains(&dataset_number) {
            return Err(ConvertError::InvalidDatasetNumber(dataset_number));
        }

        let split = match overrides.split.or(config.split) {
            Some(values) => SplitRatio::from_slice(&values)?,
            None => SplitRatio::default(),
        };

        let orientation = match overrides.orientation.or(config.orientation) {
            Some(code) => code.parse()?,
            None => OrientationCode::RPI,
        };

        let threshold = overrides
            .threshold
            .or(config.threshold)
            .unwrap_or(DEFAULT_THRESHOLD);
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConvertError::InvalidThreshold(threshold));
        }

        let mut overrides_table = default_overrides();
        let mut sources = resolve_sources(config.sources, &mut overrides_table)?;
        if !overrides.path_data.is_empty() {
            // explicit paths replace configured ones but keep their metadata
            sources = overrides
                .path_data
                .iter()
                .map(|raw| {
                    let path = expand_home(raw);
                    sources
                        .iter()
                        .find(|source| source.path == path)
                        .cloned()
                        .unwrap_or_else(|| SourceSpec {
                            id: source_id_for(&path),
                            path,
                            base_url: None,
                            revision: None,
                        })
                })
                .collect();
        }
        if sources.is_empty() {
            return Err(ConvertError::InvalidConfig(
                "at least one source dataset is required".to_string(),
            ));
        }

        Ok(ConvertConfig {
            schema_version,
            path_out,
            dataset_name,
            dataset_number,
            seed: overrides.seed.or(config.seed).unwrap_or(DEFAULT_SEED),
            split,
            orientation,
            threshold,
            channels: config.channels.unwrap_or_default(),
            label_name: config.label_name.unwrap_or_else(|| "lesion".to_string()),
            sources,
            overrides: overrides_table,
        })
    }
}

/// Resolves source entries, folding their allow-lists into `table`.
pub fn resolve_sources(
    entries: Vec<SourceEntry>,
    table: &mut OverrideTable,
) -> Result<Vec<SourceSpec>, ConvertError> {
    entries
        .into_iter()
        .map(|entry| match entry {
            SourceEntry::Shorthand(value) => {
                let path = expand_home(&value);
                Ok(SourceSpec {
                    id: source_id_for(&path),
                    path,
                    base_url: None,
                    revision: None,
                })
            }
            SourceEntry::Detailed(obj) => {
                let path = expand_home(&obj.path);
                let id = obj.id.unwrap_or_else(|| source_id_for(&path));
                if id.is_empty() {
                    return Err(ConvertError::InvalidConfig(format!(
                        "cannot derive a source id from {}",
                        obj.path
                    )));
                }
                if let Some(list) = obj.test_allow_list {
                    let rule = if list.is_empty() {
                        OverrideRule::None
                    } else {
                        OverrideRule::TestAllowList(list)
                    };
                    table.insert(id.clone(), rule);
                }
                Ok(SourceSpec {
                    id,
                    path,
                    base_url: obj.base_url,
                    revision: obj.revision,
                })
            }
        })
        .collect()
}

/// Last path component, e.g. `site_012` for `~/data/site_012/`.
pub fn source_id_for(path: &Utf8PathBuf) -> String {
    path.components()
        .next_back()
        .map(|component| component.as_str().to_string())
        .unwrap_or_default()
}

fn expand_home(raw: &str) -> Utf8PathBuf {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().to_path_buf()).ok())
        {
            return home.join(rest);
        }
    }
    Utf8PathBuf::from(trimmed)
}
