//! The mesh side of encode-process-decode.
//!
//! The grid embedders, encoder and decoder are shared by every model; a
//! [`MeshModel`] supplies the rest: how many mesh nodes exist, how the
//! bottom mesh level is embedded, and how mesh representations are
//! processed between encoding and decoding.

use candle_core::{Result as CandleResult, Tensor};

use crate::error::Result;

pub trait MeshModel: Send + Sync {
    /// `(total mesh nodes, nodes ignored by encoder/decoder)`. Only the
    /// bottom level is connected to the grid, so the ignored count is every
    /// node above level 0.
    fn count_mesh_nodes(&self) -> (usize, usize);

    /// Embedding of the bottom mesh level, (N_0, h).
    fn embed_mesh_nodes(&self) -> Result<Tensor>;

    /// (B, N_0, h) → (B, N_0, h).
    fn process(&self, mesh_rep: &Tensor) -> Result<Tensor>;
}

/// (N, d) → (B, N, d), materialised so index ops see a contiguous tensor.
pub fn expand_to_batch(x: &Tensor, batch_size: usize) -> CandleResult<Tensor> {
    let (n, d) = x.dims2()?;
    x.unsqueeze(0)?.broadcast_as((batch_size, n, d))?.contiguous()
}
