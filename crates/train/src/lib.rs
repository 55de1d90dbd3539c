//! # lam-train — The Training Engine
//!
//! Autoregressive training, evaluation and checkpointing for graph LAMs:
//!
//! * **[`Trainer`]** — owns model + optimiser + schedule. One call to
//!   [`Trainer::step`] unrolls the model over the batch horizon, computes
//!   the loss, backpropagates, clips gradients and steps AdamW.
//!   [`Trainer::fit`] runs epochs with periodic validation.
//! * **[`LrScheduler`]** — warmup → cosine / linear / constant.
//! * **[`checkpoint`]** — `min_val_loss` / `last` weights with trainer state.

pub mod checkpoint;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{load_hyperparams, save_checkpoint, TrainerState};
pub use scheduler::{LrDecay, LrScheduler};
pub use trainer::{prediction_loss, EvalMetrics, StepMetrics, Trainer, TrainerConfig};
