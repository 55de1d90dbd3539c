//! # lam-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`HyperParam`]** / **[`GraphConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`ConfigError`]** — construction-time configuration failures.
//! * **[`GraphData`]** / **[`load_graph`]** — grid + mesh graph, loaded from safetensors.
//! * **[`LevelPartition`]** — join/split per-level tensors.
//! * **[`WeatherDataset`]** / **[`DatasetRegistry`]** — data loading & batching.

pub mod config;
pub mod data;
pub mod dummy;
pub mod error;
pub mod graph;
pub mod partition;
pub mod registry;
pub mod series;
pub mod synthetic;

pub use config::{
    Aggregation, EvalSplit, GraphConfig, HyperParam, LossKind, ModelKind, Precision,
};
pub use data::{
    Batch, BatchLoader, DatasetInfo, DatasetSplits, GridDims, Sample, SplitOptions, SplitParams,
    WeatherDataset,
};
pub use error::ConfigError;
pub use graph::{load_graph, EdgeIndex, EdgeSet, GraphData, GraphTopology, MeshGraph, MeshLevel};
pub use partition::LevelPartition;
pub use registry::DatasetRegistry;
pub use synthetic::build_rect_graph;
