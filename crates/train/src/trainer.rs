//! Trainer: encapsulates the full training loop.
//!
//! Decouples the compute graph (autoregressive unroll + loss) from the
//! optimisation step (backward, gradient clipping, AdamW, schedule advance),
//! and owns validation and checkpointing for `fit`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};

use lam_common::{Batch, GraphData, GridDims, HyperParam, LossKind, Precision, WeatherDataset};
use lam_core::GraphLam;

use crate::checkpoint::{save_checkpoint, state_path, TrainerState, BEST_TAG, LAST_TAG};
use crate::scheduler::{LrDecay, LrScheduler};

// ── Config ──────────────────────────────────────────────────────────────────

/// Training knobs that are not part of the model's hyperparameters.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub epochs: usize,
    /// Total optimiser steps, used by the LR schedule.
    pub max_steps: usize,
    /// Epochs between validation runs.
    pub val_interval: usize,
    pub precision: Precision,
    pub lr_min: f64,
    pub lr_warmup_steps: usize,
    pub lr_decay: LrDecay,
    pub weight_decay: f64,
    /// Global gradient-norm clip; 0 disables clipping.
    pub grad_clip_max_norm: f64,
    pub log_every: usize,
    pub seed: u64,
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            epochs: 200,
            max_steps: 0,
            val_interval: 1,
            precision: Precision::F32,
            lr_min: 0.0,
            lr_warmup_steps: 0,
            lr_decay: LrDecay::None,
            weight_decay: 0.01,
            grad_clip_max_norm: 0.0,
            log_every: 50,
            seed: 42,
            output_dir: PathBuf::from("saved_models"),
        }
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub lr: f64,
    pub grad_norm: Option<f64>,
}

/// Result of an evaluation pass.
#[derive(Debug, Clone)]
pub struct EvalMetrics {
    /// Mean loss over all samples.
    pub loss: f64,
    /// RMSE per lead time, averaged over samples, nodes and variables.
    pub rmse: Vec<f64>,
    pub samples: usize,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, and LR schedule.
pub struct Trainer {
    pub model: GraphLam,
    pub varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    lr_scheduler: LrScheduler,
    pub config: TrainerConfig,
    hyperparams: HyperParam,
    pub state: TrainerState,
    device: Device,
}

impl Trainer {
    /// Build the model described by `hyperparams` on top of `graph`.
    pub fn new(
        hyperparams: HyperParam,
        graph: &GraphData,
        dims: GridDims,
        config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.precision.dtype(), &device);
        let model = GraphLam::new(&hyperparams.graph, graph, dims, vb)
            .with_context(|| format!("building {}", hyperparams.graph.model))?;
        let vars = varmap.all_vars();

        let params: usize = vars.iter().map(|v| v.as_tensor().elem_count()).sum();
        let (mesh_nodes, ignored) = model.count_mesh_nodes();
        tracing::info!(
            model = %hyperparams.graph.model,
            params,
            tensors = vars.len(),
            mesh_nodes,
            ignored_mesh_nodes = ignored,
            dtype = ?config.precision.dtype(),
            "Model built"
        );

        let lr_scheduler = LrScheduler::new(
            hyperparams.lr,
            config.lr_min,
            config.lr_warmup_steps,
            config.max_steps,
            config.lr_decay,
        );

        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: hyperparams.lr,
                beta1: 0.9,
                beta2: 0.95,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            lr_scheduler,
            config,
            hyperparams,
            state: TrainerState::default(),
            device,
        })
    }

    pub fn hyperparams(&self) -> &HyperParam {
        &self.hyperparams
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Unroll the model over the batch horizon; returns (prediction, target).
    fn unroll(&self, batch: &Batch) -> anyhow::Result<(Tensor, Tensor)> {
        let batch = batch.to_device(&self.device)?;
        let pred = self
            .model
            .unroll_prediction(&batch.init_states, &batch.forcing, &batch.batch_static)?;
        Ok((pred, batch.target_states))
    }

    /// Execute one optimiser step on a batch.
    pub fn step(&mut self, batch: &Batch) -> anyhow::Result<StepMetrics> {
        let (pred, target) = self.unroll(batch)?;
        let loss = prediction_loss(self.hyperparams.loss, &pred, &target)?;
        let loss_val = loss.to_scalar::<f32>()?;

        self.optimizer
            .set_learning_rate(self.lr_scheduler.current_lr());
        let mut grads = loss.backward()?;

        let debug_grad_norm = if self.config.log_every > 0 && self.state.global_step % self.config.log_every == 0 {
            Some(grad_norm(&grads, &self.vars)?)
        } else {
            None
        };

        if self.config.grad_clip_max_norm > 0.0 {
            clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip_max_norm)?;
        }

        self.optimizer.step(&grads)?;

        let lr = self.lr_scheduler.current_lr();
        self.lr_scheduler.advance();
        self.state.lr_step = self.lr_scheduler.step();
        self.state.global_step += 1;

        Ok(StepMetrics {
            step: self.state.global_step - 1,
            loss: loss_val,
            lr,
            grad_norm: debug_grad_norm,
        })
    }

    /// Mean loss and per-lead-time RMSE over a whole split, in order.
    pub fn evaluate(&self, dataset: &dyn WeatherDataset) -> anyhow::Result<EvalMetrics> {
        let mut loss_sum = 0.0f64;
        let mut sq_sum: Vec<f64> = Vec::new();
        let mut samples = 0usize;

        for batch in dataset.loader(self.config.batch_size, None) {
            let batch = batch?;
            let b = batch.batch_size();
            let (pred, target) = self.unroll(&batch)?;
            let loss = prediction_loss(self.hyperparams.loss, &pred, &target)?;
            loss_sum += loss.to_scalar::<f32>()? as f64 * b as f64;

            // (B, T, N, d) → (T,) summed over the batch
            let per_step: Vec<f32> = diff_f32(&pred, &target)?
                .sqr()?
                .mean(3)?
                .mean(2)?
                .sum(0)?
                .to_vec1()?;
            if sq_sum.is_empty() {
                sq_sum = vec![0.0; per_step.len()];
            }
            for (acc, v) in sq_sum.iter_mut().zip(per_step) {
                *acc += v as f64;
            }
            samples += b;
        }

        if samples == 0 {
            tracing::warn!(dataset = %dataset.info().name, "Evaluation split is empty");
            return Ok(EvalMetrics {
                loss: f64::MAX,
                rmse: Vec::new(),
                samples,
            });
        }
        Ok(EvalMetrics {
            loss: loss_sum / samples as f64,
            rmse: sq_sum.iter().map(|s| (s / samples as f64).sqrt()).collect(),
            samples,
        })
    }

    /// Train for the configured number of epochs, validating every
    /// `val_interval` epochs. Resumes from `self.state.epoch`.
    pub fn fit(&mut self, train: &dyn WeatherDataset, val: &dyn WeatherDataset) -> anyhow::Result<()> {
        let start = self.state.epoch;
        tracing::info!(
            start_epoch = start,
            epochs = self.config.epochs,
            train_samples = train.len(),
            val_samples = val.len(),
            output = %self.config.output_dir.display(),
            "Training"
        );

        for epoch in start..self.config.epochs {
            let loader = train.loader(self.config.batch_size, Some(self.config.seed.wrapping_add(epoch as u64)));
            let pb = ProgressBar::new(loader.num_batches() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40} {pos}/{len} batches {msg}")?
                    .progress_chars("=>-"),
            );

            let mut loss_sum = 0.0f64;
            let mut batches = 0usize;
            for batch in loader {
                let metrics = self.step(&batch?)?;
                loss_sum += metrics.loss as f64;
                batches += 1;
                pb.set_message(format!("epoch {epoch} loss {:.4}", metrics.loss));
                pb.inc(1);
                tracing::debug!(
                    step = metrics.step,
                    loss = metrics.loss,
                    lr = metrics.lr,
                    grad_norm = ?metrics.grad_norm,
                    "Train step"
                );
            }
            pb.finish_and_clear();
            self.state.epoch = epoch + 1;

            let train_loss = loss_sum / batches.max(1) as f64;
            tracing::info!(epoch, train_loss, lr = self.lr_scheduler.current_lr(), "Epoch done");

            if self.config.val_interval > 0 && self.state.epoch % self.config.val_interval == 0 {
                let eval = self.evaluate(val)?;
                tracing::info!(
                    epoch,
                    val_loss = eval.loss,
                    rmse_first = eval.rmse.first().copied().unwrap_or(f64::NAN),
                    rmse_last = eval.rmse.last().copied().unwrap_or(f64::NAN),
                    "Validation"
                );
                if self.state.best_val_loss.map_or(true, |best| eval.loss < best) {
                    self.state.best_val_loss = Some(eval.loss);
                    let path = self.save_checkpoint(BEST_TAG)?;
                    tracing::info!(path = %path.display(), val_loss = eval.loss, "New best model");
                }
            }
            self.save_checkpoint(LAST_TAG)?;
        }
        Ok(())
    }

    /// Save weights and state under `tag` in the output directory.
    pub fn save_checkpoint(&self, tag: &str) -> anyhow::Result<PathBuf> {
        save_checkpoint(&self.config.output_dir, tag, &self.varmap, &self.state, &self.hyperparams)
    }

    /// Load weights from `path`. With `restore_opt`, also restore the
    /// trainer state (epoch, step counters, best loss, LR position).
    pub fn load_checkpoint(&mut self, path: &Path, restore_opt: bool) -> anyhow::Result<()> {
        self.varmap
            .load(path)
            .with_context(|| format!("loading weights from {}", path.display()))?;
        if restore_opt {
            self.state = TrainerState::load(&state_path(path))?;
            self.lr_scheduler.set_step(self.state.lr_step);
        }
        tracing::info!(
            path = %path.display(),
            restore_opt,
            epoch = self.state.epoch,
            "Checkpoint loaded"
        );
        Ok(())
    }
}

// ── Loss ────────────────────────────────────────────────────────────────────

fn diff_f32(pred: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
    (pred - target.to_dtype(pred.dtype())?)?.to_dtype(DType::F32)
}

/// Scalar f32 loss averaged over every predicted step, node and variable.
pub fn prediction_loss(kind: LossKind, pred: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
    let diff = diff_f32(pred, target)?;
    match kind {
        LossKind::Mse => diff.sqr()?.mean_all(),
        LossKind::Mae => diff.abs()?.mean_all(),
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

fn sum_sq(grads: &GradStore, vars: &[Var]) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total)
}

/// Total L2 norm of gradients.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> anyhow::Result<f64> {
    Ok(sum_sq(grads, vars)?.sqrt().max(1e-12))
}

/// Clip gradients so their global L2 norm ≤ `max_norm`.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<()> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm {
        return Ok(());
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
