//! Flat mesh processor (GraphLAM).
//!
//! One mesh level; the processor is a stack of interaction nets over the
//! same-level edges, each updating both node and edge representations.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use lam_common::{GraphConfig, MeshLevel};

use crate::error::Result;
use crate::interaction::{InteractionConfig, InteractionNet};
use crate::mesh::{expand_to_batch, MeshModel};
use crate::mlp::Mlp;

pub struct FlatMesh {
    num_nodes: usize,
    static_features: Tensor,
    m2m_features: Tensor,
    mesh_embedder: Mlp,
    m2m_embedder: Mlp,
    processor: Vec<InteractionNet>,
}

impl FlatMesh {
    pub fn new(level: &MeshLevel, cfg: &GraphConfig, vb: VarBuilder) -> Result<Self> {
        let dtype = vb.dtype();
        let mesh_dim = level.static_features().dim(1)?;
        let m2m_dim = level.m2m().feature_dim();
        let mesh_embedder = Mlp::new(&cfg.mlp_blueprint(mesh_dim), true, vb.pp("mesh_embedder"))?;
        let m2m_embedder = Mlp::new(&cfg.mlp_blueprint(m2m_dim), true, vb.pp("m2m_embedder"))?;

        let net_cfg =
            InteractionConfig::new(cfg.hidden_dim, cfg.hidden_layers).aggregation(cfg.mesh_aggr);
        let processor = (0..cfg.processor_layers)
            .map(|i| InteractionNet::new(level.m2m().index(), &net_cfg, vb.pp(format!("processor.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            nodes = level.num_nodes(),
            m2m_edges = level.m2m().num_edges(),
            layers = cfg.processor_layers,
            "Flat mesh"
        );
        Ok(Self {
            num_nodes: level.num_nodes(),
            static_features: level.static_features().to_dtype(dtype)?,
            m2m_features: level.m2m().features().to_dtype(dtype)?,
            mesh_embedder,
            m2m_embedder,
            processor,
        })
    }
}

impl MeshModel for FlatMesh {
    fn count_mesh_nodes(&self) -> (usize, usize) {
        (self.num_nodes, 0)
    }

    fn embed_mesh_nodes(&self) -> Result<Tensor> {
        Ok(self.mesh_embedder.forward(&self.static_features)?)
    }

    fn process(&self, mesh_rep: &Tensor) -> Result<Tensor> {
        let batch_size = mesh_rep.dim(0)?;
        let mut edge_rep = expand_to_batch(&self.m2m_embedder.forward(&self.m2m_features)?, batch_size)?;
        let mut mesh_rep = mesh_rep.clone();
        for net in &self.processor {
            (mesh_rep, edge_rep) = net.forward(&mesh_rep, &mesh_rep, &edge_rep)?;
        }
        Ok(mesh_rep)
    }
}
