//! Checkpoint layout.
//!
//! A run directory holds, per tag (`min_val_loss`, `last`):
//!
//! ```text
//! <tag>.safetensors   model weights (VarMap)
//! <tag>.state.json    TrainerState
//! hyperparams.json    HyperParam, shared by every tag
//! ```
//!
//! AdamW moment estimates are not part of a checkpoint; restoring the
//! optimiser restores the step counters and the LR schedule position.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use lam_common::HyperParam;

pub const HYPERPARAMS_FILE: &str = "hyperparams.json";
pub const BEST_TAG: &str = "min_val_loss";
pub const LAST_TAG: &str = "last";

/// Progress counters saved next to the weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Number of completed epochs.
    pub epoch: usize,
    pub global_step: usize,
    #[serde(default)]
    pub best_val_loss: Option<f64>,
    #[serde(default)]
    pub lr_step: usize,
}

impl TrainerState {
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let state = serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?;
        Ok(state)
    }
}

/// `<dir>/<tag>.safetensors`
pub fn weights_path(dir: &Path, tag: &str) -> PathBuf {
    dir.join(format!("{tag}.safetensors"))
}

/// State file belonging to a weights file: `last.safetensors` → `last.state.json`.
pub fn state_path(weights: &Path) -> PathBuf {
    weights.with_extension("state.json")
}

/// Write weights, trainer state and hyperparameters for `tag` into `dir`.
pub fn save_checkpoint(
    dir: &Path,
    tag: &str,
    varmap: &VarMap,
    state: &TrainerState,
    hp: &HyperParam,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = weights_path(dir, tag);
    varmap
        .save(&path)
        .with_context(|| format!("saving weights to {}", path.display()))?;
    state.save(&state_path(&path))?;
    hp.save(&dir.join(HYPERPARAMS_FILE))?;
    tracing::debug!(path = %path.display(), epoch = state.epoch, "Checkpoint saved");
    Ok(path)
}

/// Hyperparameters stored next to a weights file.
pub fn load_hyperparams(weights: &Path) -> anyhow::Result<HyperParam> {
    let dir = weights.parent().unwrap_or_else(|| Path::new("."));
    let path = dir.join(HYPERPARAMS_FILE);
    HyperParam::load(&path).with_context(|| format!("loading {}", path.display()))
}
