//! Data pipeline: dataset trait, samples, batching.
//!
//! A sample is one forecast window: two initial states, the static fields of
//! the window, and `T` steps of forcing and target states. Batches stack
//! samples along a new leading axis.
//!
//! * **[`WeatherDataset`]** — random access to samples plus [`DatasetInfo`].
//! * **[`BatchLoader`]** — iterator over (optionally shuffled) batches.
//! * **[`SplitOptions`]** — per-split parameters handed to dataset constructors.

use anyhow::Result as AnyhowResult;
use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

// ── Dataset description ─────────────────────────────────────────────────────

/// Per-node feature widths of the dynamic inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridDims {
    pub state_dim: usize,
    pub forcing_dim: usize,
    pub batch_static_dim: usize,
}

impl GridDims {
    /// Width of the grid input to the model for a given static grid width:
    /// two states, batch statics, forcing and grid statics.
    pub fn grid_input_dim(&self, grid_static_dim: usize) -> usize {
        2 * self.state_dim + self.batch_static_dim + self.forcing_dim + grid_static_dim
    }
}

/// What a model needs to know about a dataset.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub name: String,
    pub dims: GridDims,
    /// (N_grid, d_grid_static).
    pub grid_static_features: Tensor,
    /// One-step state difference mean, (d_state,).
    pub step_diff_mean: Tensor,
    /// One-step state difference std, (d_state,).
    pub step_diff_std: Tensor,
}

impl DatasetInfo {
    pub fn num_grid_nodes(&self) -> usize {
        self.grid_static_features.dim(0).unwrap_or(0)
    }

    pub fn grid_static_dim(&self) -> usize {
        self.grid_static_features.dim(1).unwrap_or(0)
    }
}

/// Per-channel mean and std of one-step differences of a (T, N, d) series.
pub fn step_diff_stats(states: &Tensor) -> Result<(Tensor, Tensor)> {
    let (t, _, d) = states.dims3()?;
    if t < 2 {
        candle_core::bail!("need at least two time steps for step statistics, got {t}");
    }
    let diffs = (states.narrow(0, 1, t - 1)? - states.narrow(0, 0, t - 1)?)?
        .to_dtype(candle_core::DType::F32)?
        .reshape(((), d))?;
    let mean = diffs.mean(0)?;
    let std = diffs.broadcast_sub(&mean)?.sqr()?.mean(0)?.sqrt()?;
    Ok((mean, std))
}

// ── Samples and batches ─────────────────────────────────────────────────────

/// One forecast window, no batch axis.
#[derive(Debug, Clone)]
pub struct Sample {
    /// (2, N, d_state): `[prev_prev, prev]`.
    pub init_states: Tensor,
    /// (T, N, d_state).
    pub target_states: Tensor,
    /// (N, d_batch_static).
    pub batch_static: Tensor,
    /// (T, N, d_forcing).
    pub forcing: Tensor,
}

/// Stacked samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// (B, 2, N, d_state).
    pub init_states: Tensor,
    /// (B, T, N, d_state).
    pub target_states: Tensor,
    /// (B, N, d_batch_static).
    pub batch_static: Tensor,
    /// (B, T, N, d_forcing).
    pub forcing: Tensor,
}

impl Batch {
    /// Stack samples along a new leading axis.
    pub fn collate(samples: &[Sample]) -> Result<Self> {
        let stack = |f: fn(&Sample) -> &Tensor| {
            let parts: Vec<&Tensor> = samples.iter().map(f).collect();
            Tensor::stack(&parts, 0)
        };
        Ok(Self {
            init_states: stack(|s| &s.init_states)?,
            target_states: stack(|s| &s.target_states)?,
            batch_static: stack(|s| &s.batch_static)?,
            forcing: stack(|s| &s.forcing)?,
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            init_states: self.init_states.to_device(device)?,
            target_states: self.target_states.to_device(device)?,
            batch_static: self.batch_static.to_device(device)?,
            forcing: self.forcing.to_device(device)?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.init_states.dim(0).unwrap_or(0)
    }

    /// Number of predicted steps `T`.
    pub fn pred_steps(&self) -> usize {
        self.target_states.dim(1).unwrap_or(0)
    }
}

// ── WeatherDataset trait ────────────────────────────────────────────────────

/// Random-access dataset of forecast windows.
pub trait WeatherDataset: Send + Sync {
    fn info(&self) -> &DatasetInfo;
    fn len(&self) -> usize;
    fn get(&self, idx: usize) -> AnyhowResult<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> dyn WeatherDataset + 'a {
    /// Batches over the whole dataset. `shuffle_seed` shuffles sample order
    /// reproducibly; the last batch may be smaller.
    pub fn loader(&self, batch_size: usize, shuffle_seed: Option<u64>) -> BatchLoader<'_> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(seed) = shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        BatchLoader {
            dataset: self,
            order,
            batch_size: batch_size.max(1),
            pos: 0,
        }
    }
}

/// Iterator over batches of a [`WeatherDataset`].
pub struct BatchLoader<'a> {
    dataset: &'a dyn WeatherDataset,
    order: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl BatchLoader<'_> {
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

impl Iterator for BatchLoader<'_> {
    type Item = AnyhowResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let indices = &self.order[self.pos..end];
        self.pos = end;
        let batch = indices
            .iter()
            .map(|&i| self.dataset.get(i))
            .collect::<AnyhowResult<Vec<_>>>()
            .and_then(|samples| Ok(Batch::collate(&samples)?));
        Some(batch)
    }
}

// ── Split options ───────────────────────────────────────────────────────────

/// Parameters of one split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitParams {
    /// Number of autoregressive steps per sample.
    pub nb_pred_steps: usize,
    #[serde(default)]
    pub standardize: bool,
    /// Log extra statistics while building the split.
    #[serde(default)]
    pub diagnose: bool,
}

/// Parameters for all three splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitOptions {
    pub train: SplitParams,
    pub valid: SplitParams,
    pub test: SplitParams,
}

impl SplitOptions {
    /// One training step, 19 validation/test steps.
    pub fn new(standardize: bool, diagnose: bool) -> Self {
        let split = |nb_pred_steps, diagnose| SplitParams {
            nb_pred_steps,
            standardize,
            diagnose,
        };
        Self {
            train: split(1, diagnose),
            valid: split(19, false),
            test: split(19, false),
        }
    }
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self::new(false, false)
    }
}

/// The three dataset splits.
pub struct DatasetSplits {
    pub train: Box<dyn WeatherDataset>,
    pub val: Box<dyn WeatherDataset>,
    pub test: Box<dyn WeatherDataset>,
}

// ── Tests ───────────────────────────────────────────────────────────────────
