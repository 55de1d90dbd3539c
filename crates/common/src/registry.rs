//! Dataset registry: name → constructor + default config.
//!
//! Entries whose default config (or backing data) is missing are skipped
//! with a warning, so one broken dataset never prevents using the others.

use std::path::{Path, PathBuf};

use anyhow::Result as AnyhowResult;

use crate::data::{DatasetSplits, SplitOptions};
use crate::dummy::DummyDataset;
use crate::error::ConfigError;
use crate::series::{SeriesConfig, SeriesDataset};

type Constructor = fn(&Path, &SplitOptions) -> AnyhowResult<DatasetSplits>;

struct Entry {
    name: &'static str,
    constructor: Constructor,
    default_config: PathBuf,
}

pub struct DatasetRegistry {
    entries: Vec<Entry>,
}

fn build_dummy(config: &Path, opts: &SplitOptions) -> AnyhowResult<DatasetSplits> {
    DummyDataset::from_json(Some(config), opts)
}

fn build_series(config: &Path, opts: &SplitOptions) -> AnyhowResult<DatasetSplits> {
    SeriesDataset::from_json(config, opts)
}

impl DatasetRegistry {
    /// Probe every known dataset against `config_root`.
    pub fn build(config_root: &Path) -> Self {
        let mut entries = vec![Entry {
            name: "dummy",
            constructor: build_dummy,
            default_config: config_root.join("dummy.json"),
        }];

        let series_config = config_root.join("series.json");
        match SeriesConfig::load(&series_config) {
            Ok(cfg) if cfg.path.exists() => entries.push(Entry {
                name: "series",
                constructor: build_series,
                default_config: series_config,
            }),
            Ok(cfg) => tracing::warn!(
                data = %cfg.path.display(),
                "Could not register series dataset: data file not found"
            ),
            Err(e) => tracing::warn!("Could not register series dataset: {e:#}"),
        }

        Self { entries }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.to_string()).collect()
    }

    /// Default config path of a registered dataset.
    pub fn default_config(&self, name: &str) -> Option<&Path> {
        self.find(name).map(|e| e.default_config.as_path())
    }

    fn find(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Build train/val/test splits of `name`, reading `config` or the
    /// registered default.
    pub fn get_datasets(
        &self,
        name: &str,
        config: Option<&Path>,
        opts: &SplitOptions,
    ) -> AnyhowResult<DatasetSplits> {
        let entry = self.find(name).ok_or_else(|| ConfigError::UnknownDataset {
            name: name.to_string(),
            available: self.names(),
        })?;
        let config = config.unwrap_or(&entry.default_config);
        tracing::info!(dataset = name, config = %config.display(), "Loading dataset");
        (entry.constructor)(config, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_is_always_available() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DatasetRegistry::build(dir.path());
        assert_eq!(registry.names(), vec!["dummy".to_string()]);
        let splits = registry
            .get_datasets("dummy", None, &SplitOptions::default())
            .unwrap();
        assert!(!splits.train.is_empty());
    }

    #[test]
    fn unknown_dataset_lists_available() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DatasetRegistry::build(dir.path());
        let err = registry
            .get_datasets("titan", None, &SplitOptions::default())
            .err()
            .unwrap();
        let msg = err.to_string();
        assert!(msg.contains("titan"));
        assert!(msg.contains("dummy"));
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownDataset { .. })
        ));
    }

    #[test]
    fn series_without_data_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("series.json"),
            r#"{"path": "missing.safetensors",
                "splits": {"train": [0, 1], "valid": [0, 1], "test": [0, 1]}}"#,
        )
        .unwrap();
        let registry = DatasetRegistry::build(dir.path());
        assert!(registry.default_config("series").is_none());
    }
}
