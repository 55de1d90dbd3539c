//! Seeded synthetic dataset on a rectangular grid.
//!
//! Each state channel is a travelling sine wave with a per-sample phase, so
//! consecutive steps are strongly correlated and a model has something
//! learnable without any files on disk. Grid statics are the node
//! coordinates, matching [`crate::synthetic::build_rect_graph`].

use std::f32::consts::PI;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::{
    step_diff_stats, DatasetInfo, DatasetSplits, GridDims, Sample, SplitOptions, SplitParams,
    WeatherDataset,
};

/// Length of the trajectory used for step-difference statistics.
const STATS_STEPS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCounts {
    pub train: usize,
    pub valid: usize,
    pub test: usize,
}

/// JSON config of the dummy dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DummyConfig {
    #[serde(default = "default_grid_nx")]
    pub grid_nx: usize,
    #[serde(default = "default_grid_ny")]
    pub grid_ny: usize,
    #[serde(default = "default_state_dim")]
    pub state_dim: usize,
    #[serde(default = "default_forcing_dim")]
    pub forcing_dim: usize,
    #[serde(default = "default_batch_static_dim")]
    pub batch_static_dim: usize,
    #[serde(default = "default_samples")]
    pub samples: SampleCounts,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_grid_nx() -> usize {
    16
}
fn default_grid_ny() -> usize {
    12
}
fn default_state_dim() -> usize {
    3
}
fn default_forcing_dim() -> usize {
    2
}
fn default_batch_static_dim() -> usize {
    1
}
fn default_samples() -> SampleCounts {
    SampleCounts {
        train: 32,
        valid: 8,
        test: 8,
    }
}
fn default_seed() -> u64 {
    42
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            grid_nx: default_grid_nx(),
            grid_ny: default_grid_ny(),
            state_dim: default_state_dim(),
            forcing_dim: default_forcing_dim(),
            batch_static_dim: default_batch_static_dim(),
            samples: default_samples(),
            seed: default_seed(),
        }
    }
}

impl DummyConfig {
    pub fn load(path: &Path) -> AnyhowResult<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read dummy config {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }

    fn dims(&self) -> GridDims {
        GridDims {
            state_dim: self.state_dim,
            forcing_dim: self.forcing_dim,
            batch_static_dim: self.batch_static_dim,
        }
    }
}

/// Wave parameters of one channel, shared by all samples.
#[derive(Debug, Clone, Copy)]
struct Wave {
    kx: f32,
    ky: f32,
    omega: f32,
    amplitude: f32,
}

impl Wave {
    fn random(rng: &mut StdRng) -> Self {
        Self {
            kx: rng.gen_range(0.5..2.0),
            ky: rng.gen_range(0.5..2.0),
            omega: rng.gen_range(0.1..0.4),
            amplitude: rng.gen_range(0.5..2.0),
        }
    }

    fn at(&self, [x, y]: [f32; 2], t: f32, phase: f32) -> f32 {
        self.amplitude * (2.0 * PI * (self.kx * x + self.ky * y) + self.omega * t + phase).sin()
    }
}

struct Generator {
    positions: Vec<[f32; 2]>,
    state_waves: Vec<Wave>,
    forcing_waves: Vec<Wave>,
    standardize: bool,
}

impl Generator {
    fn new(cfg: &DummyConfig, standardize: bool) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut positions = Vec::with_capacity(cfg.grid_nx * cfg.grid_ny);
        for j in 0..cfg.grid_ny {
            for i in 0..cfg.grid_nx {
                positions.push([
                    (i as f32 + 0.5) / cfg.grid_nx as f32,
                    (j as f32 + 0.5) / cfg.grid_ny as f32,
                ]);
            }
        }
        Self {
            positions,
            state_waves: (0..cfg.state_dim).map(|_| Wave::random(&mut rng)).collect(),
            forcing_waves: (0..cfg.forcing_dim).map(|_| Wave::random(&mut rng)).collect(),
            standardize,
        }
    }

    fn num_nodes(&self) -> usize {
        self.positions.len()
    }

    /// (steps, N, waves.len()) evaluated from `t0`.
    fn field(&self, waves: &[Wave], t0: f32, steps: usize, phase: f32, scale: bool) -> Vec<f32> {
        let mut out = Vec::with_capacity(steps * self.num_nodes() * waves.len());
        for s in 0..steps {
            let t = t0 + s as f32;
            for &p in &self.positions {
                for w in waves {
                    let v = w.at(p, t, phase);
                    // a sine of amplitude A has std A/sqrt(2)
                    out.push(if scale { v * 2f32.sqrt() / w.amplitude } else { v });
                }
            }
        }
        out
    }

    fn sample(&self, seed: u64, pred_steps: usize, dims: GridDims) -> candle_core::Result<Sample> {
        let mut rng = StdRng::seed_from_u64(seed);
        let phase: f32 = rng.gen_range(0.0..2.0 * PI);
        let t0: f32 = rng.gen_range(0.0..100.0);
        let n = self.num_nodes();
        let dev = Device::Cpu;

        let states = Tensor::from_vec(
            self.field(&self.state_waves, t0, pred_steps + 2, phase, self.standardize),
            (pred_steps + 2, n, dims.state_dim),
            &dev,
        )?;
        let forcing = Tensor::from_vec(
            self.field(&self.forcing_waves, t0 + 2.0, pred_steps, 0.0, false),
            (pred_steps, n, dims.forcing_dim),
            &dev,
        )?;
        let batch_static = Tensor::full(phase.sin(), (n, dims.batch_static_dim), &dev)?;
        Ok(Sample {
            init_states: states.narrow(0, 0, 2)?,
            target_states: states.narrow(0, 2, pred_steps)?,
            batch_static,
            forcing,
        })
    }
}

/// One split of the dummy dataset.
pub struct DummyDataset {
    info: DatasetInfo,
    generator: Arc<Generator>,
    params: SplitParams,
    seed: u64,
    len: usize,
}

impl DummyDataset {
    /// Build the three splits. `config` falls back to defaults when `None`.
    pub fn from_json(config: Option<&Path>, opts: &SplitOptions) -> AnyhowResult<DatasetSplits> {
        let cfg = match config {
            Some(path) if path.exists() => DummyConfig::load(path)?,
            _ => DummyConfig::default(),
        };
        Self::splits(&cfg, opts)
    }

    pub fn splits(cfg: &DummyConfig, opts: &SplitOptions) -> AnyhowResult<DatasetSplits> {
        let dims = cfg.dims();
        let generator = Arc::new(Generator::new(cfg, opts.train.standardize));

        // one contiguous trajectory, so no difference spans two windows
        let trajectory = generator.sample(cfg.seed, STATS_STEPS, dims)?;
        let states = Tensor::cat(&[trajectory.init_states, trajectory.target_states], 0)?;
        let (step_diff_mean, step_diff_std) = step_diff_stats(&states)?;

        let positions: Vec<f32> = generator.positions.iter().flat_map(|p| *p).collect();
        let info = DatasetInfo {
            name: "dummy".to_string(),
            dims,
            grid_static_features: Tensor::from_vec(
                positions,
                (generator.num_nodes(), 2),
                &Device::Cpu,
            )?,
            step_diff_mean,
            step_diff_std,
        };
        if opts.train.diagnose {
            tracing::info!(
                nodes = generator.num_nodes(),
                state_dim = dims.state_dim,
                forcing_dim = dims.forcing_dim,
                "Dummy dataset"
            );
        }

        // Disjoint seed ranges per split.
        let split = |params: SplitParams, offset: u64, len: usize| -> Box<dyn WeatherDataset> {
            Box::new(DummyDataset {
                info: info.clone(),
                generator: Arc::clone(&generator),
                params,
                seed: cfg.seed.wrapping_add(offset),
                len,
            })
        };
        Ok(DatasetSplits {
            train: split(opts.train, 0, cfg.samples.train),
            val: split(opts.valid, 1 << 32, cfg.samples.valid),
            test: split(opts.test, 2 << 32, cfg.samples.test),
        })
    }
}

impl WeatherDataset for DummyDataset {
    fn info(&self) -> &DatasetInfo {
        &self.info
    }

    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, idx: usize) -> AnyhowResult<Sample> {
        anyhow::ensure!(idx < self.len, "sample {idx} out of range ({} samples)", self.len);
        Ok(self.generator.sample(
            self.seed.wrapping_add(idx as u64),
            self.params.nb_pred_steps,
            self.info.dims,
        )?)
    }
}
