//! Gridded time series stored in one safetensors file.
//!
//! | Tensor | Shape | Required |
//! |--------|-------|----------|
//! | `state` | (T, N, d_state) | yes |
//! | `grid_static` | (N, d_grid_static) | yes |
//! | `forcing` | (T, N, d_forcing) | no |
//! | `batch_static` | (N, d_batch_static) | no |
//!
//! Splits are contiguous time ranges; every start index whose window of
//! `2 + nb_pred_steps` steps fits in the range is one sample.

use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::data::{
    step_diff_stats, DatasetInfo, DatasetSplits, GridDims, Sample, SplitOptions, SplitParams,
    WeatherDataset,
};
use crate::error::ConfigError;

/// Time ranges `[start, end)` of each split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRanges {
    pub train: [usize; 2],
    pub valid: [usize; 2],
    pub test: [usize; 2],
}

/// JSON config of a series dataset. `path` is relative to the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub path: PathBuf,
    pub splits: SplitRanges,
}

fn default_name() -> String {
    "series".to_string()
}

impl SeriesConfig {
    pub fn load(path: &Path) -> AnyhowResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut cfg: Self = serde_json::from_str(&json).map_err(|source| ConfigError::Json {
            path: path.display().to_string(),
            source,
        })?;
        if cfg.path.is_relative() {
            if let Some(dir) = path.parent() {
                cfg.path = dir.join(&cfg.path);
            }
        }
        Ok(cfg)
    }
}

/// Arrays shared by all splits.
#[derive(Clone)]
struct SeriesArrays {
    state: Tensor,
    forcing: Tensor,
    batch_static: Tensor,
}

/// One split of a series dataset.
pub struct SeriesDataset {
    info: DatasetInfo,
    arrays: SeriesArrays,
    range: Range<usize>,
    params: SplitParams,
}

fn to_range(name: &str, [start, end]: [usize; 2], steps: usize) -> AnyhowResult<Range<usize>> {
    anyhow::ensure!(
        start <= end && end <= steps,
        "{name} range [{start}, {end}) outside the {steps} stored steps"
    );
    Ok(start..end)
}

impl SeriesDataset {
    pub fn from_json(config: &Path, opts: &SplitOptions) -> AnyhowResult<DatasetSplits> {
        let cfg = SeriesConfig::load(config)?;
        Self::open(&cfg, opts)
    }

    pub fn open(cfg: &SeriesConfig, opts: &SplitOptions) -> AnyhowResult<DatasetSplits> {
        let mut tensors = candle_core::safetensors::load(&cfg.path, &Device::Cpu)
            .with_context(|| format!("load series {}", cfg.path.display()))?;
        let mut take = |name: &str| tensors.remove(name);

        let state = take("state")
            .ok_or(ConfigError::MissingTensor { name: "state".into() })?
            .to_dtype(DType::F32)?;
        let grid_static = take("grid_static")
            .ok_or(ConfigError::MissingTensor { name: "grid_static".into() })?
            .to_dtype(DType::F32)?;
        let (steps, n, state_dim) = state.dims3()?;
        let forcing = match take("forcing") {
            Some(f) => f.to_dtype(DType::F32)?,
            None => Tensor::zeros((steps, n, 0), DType::F32, &Device::Cpu)?,
        };
        let batch_static = match take("batch_static") {
            Some(b) => b.to_dtype(DType::F32)?,
            None => Tensor::zeros((n, 0), DType::F32, &Device::Cpu)?,
        };
        check_dim("grid_static nodes", n, grid_static.dim(0)?)?;
        check_dim("forcing steps", steps, forcing.dim(0)?)?;
        check_dim("forcing nodes", n, forcing.dim(1)?)?;
        check_dim("batch_static nodes", n, batch_static.dim(0)?)?;

        let train = to_range("train", cfg.splits.train, steps)?;
        let valid = to_range("valid", cfg.splits.valid, steps)?;
        let test = to_range("test", cfg.splits.test, steps)?;
        anyhow::ensure!(train.len() >= 2, "train range needs at least two steps");

        let train_states = state.narrow(0, train.start, train.len())?;
        let state = if opts.train.standardize {
            let flat = train_states.reshape(((), state_dim))?;
            let mean = flat.mean_keepdim(0)?;
            let std = flat
                .broadcast_sub(&mean)?
                .sqr()?
                .mean_keepdim(0)?
                .sqrt()?
                .clamp(1e-6, f32::MAX)?;
            state.broadcast_sub(&mean)?.broadcast_div(&std)?
        } else {
            state
        };
        let (step_diff_mean, step_diff_std) =
            step_diff_stats(&state.narrow(0, train.start, train.len())?)?;

        let dims = GridDims {
            state_dim,
            forcing_dim: forcing.dim(2)?,
            batch_static_dim: batch_static.dim(1)?,
        };
        if opts.train.diagnose {
            tracing::info!(
                name = %cfg.name,
                steps,
                nodes = n,
                ?dims,
                step_diff_std = ?step_diff_std.to_vec1::<f32>()?,
                "Series dataset"
            );
        }

        let info = DatasetInfo {
            name: cfg.name.clone(),
            dims,
            grid_static_features: grid_static,
            step_diff_mean,
            step_diff_std,
        };
        let arrays = SeriesArrays {
            state,
            forcing,
            batch_static,
        };
        let split = |range: Range<usize>, params: SplitParams| -> Box<dyn WeatherDataset> {
            Box::new(SeriesDataset {
                info: info.clone(),
                arrays: arrays.clone(),
                range,
                params,
            })
        };
        Ok(DatasetSplits {
            train: split(train, opts.train),
            val: split(valid, opts.valid),
            test: split(test, opts.test),
        })
    }

    fn window(&self) -> usize {
        self.params.nb_pred_steps + 2
    }
}

fn check_dim(what: &str, expected: usize, actual: usize) -> Result<(), ConfigError> {
    if expected != actual {
        return Err(ConfigError::DimMismatch {
            what: what.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

impl WeatherDataset for SeriesDataset {
    fn info(&self) -> &DatasetInfo {
        &self.info
    }

    fn len(&self) -> usize {
        (self.range.len() + 1).saturating_sub(self.window())
    }

    fn get(&self, idx: usize) -> AnyhowResult<Sample> {
        anyhow::ensure!(idx < self.len(), "sample {idx} out of range ({} samples)", self.len());
        let start = self.range.start + idx;
        let steps = self.params.nb_pred_steps;
        let a = &self.arrays;
        Ok(Sample {
            init_states: a.state.narrow(0, start, 2)?,
            target_states: a.state.narrow(0, start + 2, steps)?,
            batch_static: a.batch_static.clone(),
            forcing: a.forcing.narrow(0, start + 2, steps)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_series(dir: &Path, steps: usize) -> PathBuf {
        let dev = Device::Cpu;
        let state: Vec<f32> = (0..steps * 4 * 2).map(|i| i as f32).collect();
        let mut tensors = HashMap::new();
        tensors.insert(
            "state".to_string(),
            Tensor::from_vec(state, (steps, 4, 2), &dev).unwrap(),
        );
        tensors.insert(
            "grid_static".to_string(),
            Tensor::zeros((4, 3), DType::F32, &dev).unwrap(),
        );
        tensors.insert(
            "forcing".to_string(),
            Tensor::ones((steps, 4, 1), DType::F32, &dev).unwrap(),
        );
        let data = dir.join("series.safetensors");
        candle_core::safetensors::save(&tensors, &data).unwrap();
        let cfg = dir.join("series.json");
        std::fs::write(
            &cfg,
            r#"{"path": "series.safetensors",
                "splits": {"train": [0, 20], "valid": [20, 25], "test": [25, 30]}}"#,
        )
        .unwrap();
        cfg
    }

    #[test]
    fn window_counts_per_split() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_series(dir.path(), 30);
        let opts = SplitOptions {
            valid: SplitParams {
                nb_pred_steps: 3,
                standardize: false,
                diagnose: false,
            },
            ..Default::default()
        };
        let splits = SeriesDataset::from_json(&cfg, &opts).unwrap();
        // 20 steps, windows of 3
        assert_eq!(splits.train.len(), 18);
        // 5 steps, windows of 5
        assert_eq!(splits.val.len(), 1);
        // 5 steps, windows of 21
        assert_eq!(splits.test.len(), 0);
    }

    #[test]
    fn sample_slices_consecutive_steps() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_series(dir.path(), 30);
        let splits = SeriesDataset::from_json(&cfg, &SplitOptions::default()).unwrap();
        let s = splits.train.get(4).unwrap();
        assert_eq!(s.init_states.dims(), &[2, 4, 2]);
        assert_eq!(s.forcing.dims(), &[1, 4, 1]);
        assert_eq!(s.batch_static.dims(), &[4, 0]);
        let first: Vec<f32> = s.target_states.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(first[0], (6 * 8) as f32);
        // each step adds 8 to every entry
        let mean = splits.train.info().step_diff_mean.to_vec1::<f32>().unwrap();
        assert_eq!(mean, vec![8.0, 8.0]);
    }

    #[test]
    fn standardize_rescales_states() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_series(dir.path(), 30);
        let splits = SeriesDataset::from_json(&cfg, &SplitOptions::new(true, false)).unwrap();
        let std = splits.train.info().step_diff_std.to_vec1::<f32>().unwrap();
        let mean = splits.train.info().step_diff_mean.to_vec1::<f32>().unwrap();
        assert!(std.iter().all(|&s| s < 1e-4));
        assert!(mean.iter().all(|&m| m > 0.0 && m < 1.0));
    }

    #[test]
    fn missing_state_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("bad.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "grid_static".to_string(),
            Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &data).unwrap();
        let cfg = SeriesConfig {
            name: "bad".into(),
            path: data,
            splits: SplitRanges {
                train: [0, 1],
                valid: [0, 1],
                test: [0, 1],
            },
        };
        let err = SeriesDataset::open(&cfg, &SplitOptions::default()).err().unwrap();
        assert!(err.to_string().contains("state"));
    }
}
