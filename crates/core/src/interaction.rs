//! Interaction network: one message-passing layer over a fixed edge set.
//!
//! ```text
//! m_e    = edge_mlp([e, x_sender(e), x_receiver(e)])
//! a_v    = Σ_{e → v} m_e            (or the mean)
//! x_v'   = x_v + aggr_mlp([x_v, a_v])
//! e'     = e + m_e                  (only with update_edges)
//! ```
//!
//! Edge and node chunks give each chunk of edges (receiver nodes) its own
//! edge (aggregation) MLP. Receivers only ever see messages from their own
//! incoming edges, so chunks spanning several mesh levels never mix.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use lam_common::{Aggregation, ConfigError, EdgeIndex, LevelPartition};

use crate::error::{check_shape, Result};
use crate::mlp::ChunkedMlp;

/// Construction parameters of an [`InteractionNet`].
#[derive(Debug, Clone)]
pub struct InteractionConfig {
    pub hidden_dim: usize,
    pub hidden_layers: usize,
    pub update_edges: bool,
    pub aggregation: Aggregation,
    /// Edge counts per chunk, summing to the number of edges.
    pub edge_chunks: Option<LevelPartition>,
    /// Receiver counts per chunk, summing to the number of receivers.
    pub node_chunks: Option<LevelPartition>,
}

impl InteractionConfig {
    pub fn new(hidden_dim: usize, hidden_layers: usize) -> Self {
        Self {
            hidden_dim,
            hidden_layers,
            update_edges: true,
            aggregation: Aggregation::Sum,
            edge_chunks: None,
            node_chunks: None,
        }
    }

    pub fn update_edges(mut self, update: bool) -> Self {
        self.update_edges = update;
        self
    }

    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn chunks(mut self, edges: LevelPartition, nodes: LevelPartition) -> Self {
        self.edge_chunks = Some(edges);
        self.node_chunks = Some(nodes);
        self
    }

    fn blueprint(&self, inputs: usize) -> Vec<usize> {
        let mut blueprint = vec![inputs * self.hidden_dim];
        blueprint.extend(std::iter::repeat(self.hidden_dim).take(self.hidden_layers + 1));
        blueprint
    }
}

pub struct InteractionNet {
    senders: Tensor,
    receivers: Tensor,
    num_senders: usize,
    num_receivers: usize,
    num_edges: usize,
    hidden_dim: usize,
    /// (1, N_receivers, 1) reciprocal in-degree, for mean aggregation.
    inv_degree: Option<Tensor>,
    edge_mlp: ChunkedMlp,
    aggr_mlp: ChunkedMlp,
    update_edges: bool,
}

fn check_chunks(what: &'static str, chunks: Option<&LevelPartition>, expected: usize) -> Result<()> {
    if let Some(p) = chunks {
        if p.total() != expected {
            return Err(ConfigError::ChunkSizeMismatch {
                what,
                expected,
                actual: p.total(),
            }
            .into());
        }
    }
    Ok(())
}

impl InteractionNet {
    /// Weights under `edge_mlp` and `aggr_mlp`; index tensors are placed on
    /// the builder's device.
    pub fn new(index: &EdgeIndex, cfg: &InteractionConfig, vb: VarBuilder) -> Result<Self> {
        check_chunks("edge chunks", cfg.edge_chunks.as_ref(), index.len())?;
        check_chunks("node chunks", cfg.node_chunks.as_ref(), index.num_receivers())?;

        let device = vb.device().clone();
        let senders = Tensor::new(index.senders(), &device)?;
        let receivers = Tensor::new(index.receivers(), &device)?;
        let inv_degree = match cfg.aggregation {
            Aggregation::Sum => None,
            Aggregation::Mean => {
                let inv: Vec<f32> = index
                    .in_degree()
                    .into_iter()
                    .map(|d| 1.0 / d.max(1) as f32)
                    .collect();
                let t = Tensor::from_vec(inv, (1, index.num_receivers(), 1), &device)?;
                Some(t.to_dtype(vb.dtype())?)
            }
        };

        let edge_mlp = ChunkedMlp::new(
            &cfg.blueprint(3),
            true,
            cfg.edge_chunks.as_ref(),
            1,
            vb.pp("edge_mlp"),
        )?;
        let aggr_mlp = ChunkedMlp::new(
            &cfg.blueprint(2),
            true,
            cfg.node_chunks.as_ref(),
            1,
            vb.pp("aggr_mlp"),
        )?;

        Ok(Self {
            senders,
            receivers,
            num_senders: index.num_senders(),
            num_receivers: index.num_receivers(),
            num_edges: index.len(),
            hidden_dim: cfg.hidden_dim,
            inv_degree,
            edge_mlp,
            aggr_mlp,
            update_edges: cfg.update_edges,
        })
    }

    /// One message-passing step. Shapes: senders (B, N_s, h), receivers
    /// (B, N_r, h), edges (B, M, h). Returns updated (receivers, edges).
    pub fn forward(&self, send_rep: &Tensor, rec_rep: &Tensor, edge_rep: &Tensor) -> Result<(Tensor, Tensor)> {
        let b = rec_rep.dim(0)?;
        let h = self.hidden_dim;
        check_shape("interaction senders", send_rep, &[b, self.num_senders, h])?;
        check_shape("interaction receivers", rec_rep, &[b, self.num_receivers, h])?;
        check_shape("interaction edges", edge_rep, &[b, self.num_edges, h])?;

        let x_s = send_rep.index_select(&self.senders, 1)?;
        let x_r = rec_rep.index_select(&self.receivers, 1)?;
        let messages = self
            .edge_mlp
            .forward(&Tensor::cat(&[edge_rep, &x_s, &x_r], 2)?)?;

        let aggr = Tensor::zeros((b, self.num_receivers, h), messages.dtype(), messages.device())?
            .index_add(&self.receivers, &messages, 1)?;
        let aggr = match &self.inv_degree {
            Some(inv) => aggr.broadcast_mul(inv)?,
            None => aggr,
        };

        let rec_new = (rec_rep + self.aggr_mlp.forward(&Tensor::cat(&[rec_rep, &aggr], 2)?)?)?;
        let edge_new = if self.update_edges {
            (edge_rep + messages)?
        } else {
            edge_rep.clone()
        };
        Ok((rec_new, edge_new))
    }

    /// [`forward`](Self::forward), keeping only the receiver update.
    pub fn update_nodes(&self, send_rep: &Tensor, rec_rep: &Tensor, edge_rep: &Tensor) -> Result<Tensor> {
        Ok(self.forward(send_rep, rec_rep, edge_rep)?.0)
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }
}
