//! # lam-core — The Graph Engine
//!
//! Every compute primitive needed to build, train, and run a graph-based
//! limited-area weather model lives in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`mlp`] | `Mlp`, `SplitMlp`, `ChunkedMlp` embedders |
//! | [`interaction`] | `InteractionNet`, the message-passing primitive |
//! | [`mesh`] | `MeshModel` extension points, `expand_to_batch` |
//! | [`flat`] | `FlatMesh` (GraphLAM processor) |
//! | [`hierarchical`] | `HierarchicalMesh` init / read-out, `MeshReps` |
//! | [`parallel`] | `ParallelProcessor` (HiLAMParallel) |
//! | [`sequential`] | `SequentialProcessor` down/up sweeps (HiLAM) |
//! | [`model`] | `GraphLam` encode-process-decode, `predict_step`, `unroll_prediction` |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`;
//!    scatter-sum aggregation is `index_add`, gathers are `index_select`.
//! 2. **Fail at construction.** Graph/config inconsistencies surface as
//!    [`ConfigError`](lam_common::ConfigError) when the model is built.
//! 3. **Deterministic.** Same weights + same inputs = same output.

pub mod error;
pub mod flat;
pub mod hierarchical;
pub mod interaction;
pub mod mesh;
pub mod mlp;
pub mod model;
pub mod parallel;
pub mod sequential;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use error::{ModelError, Result};
pub use hierarchical::{HiProcessor, HierarchicalMesh, MeshReps};
pub use interaction::{InteractionConfig, InteractionNet};
pub use mesh::{expand_to_batch, MeshModel};
pub use model::GraphLam;
pub use sequential::{down_sweep, up_sweep, SweepOp};
