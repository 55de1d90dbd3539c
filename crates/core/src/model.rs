//! Encode-process-decode graph LAM.
//!
//! ```text
//! grid features = [X_t, X_{t-1}, batch static, forcing, grid static]
//! grid_emb  = grid_embedder(grid features)
//! mesh_rep  = g2m_gnn(grid_emb → mesh level 0)
//! grid_rep  = grid_emb + encoding_grid_mlp(grid_emb)
//! mesh_rep  = mesh.process(mesh_rep)
//! grid_rep  = m2g_gnn(mesh_rep → grid_rep)
//! X_{t+1}   = X_t + output_map(grid_rep) · σ_Δ + μ_Δ
//! ```
//!
//! The network predicts a standardised one-step difference which is rescaled
//! with the dataset's step statistics and added to the current state.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use lam_common::{ConfigError, GraphConfig, GraphData, GridDims, ModelKind};

use crate::error::{check_shape, Result};
use crate::flat::FlatMesh;
use crate::hierarchical::HierarchicalMesh;
use crate::interaction::{InteractionConfig, InteractionNet};
use crate::mesh::{expand_to_batch, MeshModel};
use crate::mlp::Mlp;

pub struct GraphLam {
    kind: ModelKind,
    dims: GridDims,
    num_grid: usize,
    dtype: DType,
    grid_static_features: Tensor,
    g2m_features: Tensor,
    m2g_features: Tensor,
    step_diff_mean: Tensor,
    step_diff_std: Tensor,
    grid_embedder: Mlp,
    g2m_embedder: Mlp,
    m2g_embedder: Mlp,
    g2m_gnn: InteractionNet,
    encoding_grid_mlp: Mlp,
    m2g_gnn: InteractionNet,
    output_map: Mlp,
    mesh: Box<dyn MeshModel>,
}

impl GraphLam {
    /// Build the model selected by `cfg.model`. The graph must be
    /// hierarchical exactly when the model is.
    pub fn new(cfg: &GraphConfig, graph: &GraphData, dims: GridDims, vb: VarBuilder) -> Result<Self> {
        let kind = cfg.model;
        if kind.is_hierarchical() != graph.is_hierarchical() {
            return Err(ConfigError::HierarchyMismatch {
                model: kind.name(),
                required: if kind.is_hierarchical() {
                    "hierarchical"
                } else {
                    "non-hierarchical"
                },
            }
            .into());
        }
        let state_dim = graph.step_diff_std.dims1()?;
        if state_dim != dims.state_dim {
            return Err(ConfigError::DimMismatch {
                what: "step difference statistics".to_string(),
                expected: dims.state_dim,
                actual: state_dim,
            }
            .into());
        }

        let dtype = vb.dtype();
        let (num_grid, grid_static_dim) = graph.grid_static_features.dims2()?;
        let grid_dim = dims.grid_input_dim(grid_static_dim);
        let hidden = cfg.hidden_dim;

        let grid_embedder = Mlp::new(&cfg.mlp_blueprint(grid_dim), true, vb.pp("grid_embedder"))?;
        let g2m_embedder = Mlp::new(&cfg.mlp_blueprint(graph.g2m.feature_dim()), true, vb.pp("g2m_embedder"))?;
        let m2g_embedder = Mlp::new(&cfg.mlp_blueprint(graph.m2g.feature_dim()), true, vb.pp("m2g_embedder"))?;

        let gnn_cfg = InteractionConfig::new(hidden, cfg.hidden_layers).update_edges(false);
        let g2m_gnn = InteractionNet::new(graph.g2m.index(), &gnn_cfg, vb.pp("g2m_gnn"))?;
        let encoding_grid_mlp = Mlp::new(&cfg.mlp_blueprint(hidden), true, vb.pp("encoding_grid_mlp"))?;
        let m2g_gnn = InteractionNet::new(graph.m2g.index(), &gnn_cfg, vb.pp("m2g_gnn"))?;

        let mut output_blueprint = vec![hidden; cfg.hidden_layers + 1];
        output_blueprint.push(dims.state_dim);
        let output_map = Mlp::new(&output_blueprint, false, vb.pp("output_map"))?;

        let mesh: Box<dyn MeshModel> = match kind {
            ModelKind::GraphLam => Box::new(FlatMesh::new(&graph.mesh.levels()[0], cfg, vb.pp("mesh"))?),
            ModelKind::HiLam | ModelKind::HiLamParallel => {
                Box::new(HierarchicalMesh::new(&graph.mesh, cfg, vb.pp("mesh"))?)
            }
        };

        let (num_mesh, _) = mesh.count_mesh_nodes();
        tracing::info!(
            model = %kind,
            nodes = num_grid + num_mesh,
            grid = num_grid,
            mesh = num_mesh,
            g2m_edges = graph.g2m.num_edges(),
            m2g_edges = graph.m2g.num_edges(),
            grid_dim,
            "Loaded graph"
        );

        Ok(Self {
            kind,
            dims,
            num_grid,
            dtype,
            grid_static_features: graph.grid_static_features.to_dtype(dtype)?,
            g2m_features: graph.g2m.features().to_dtype(dtype)?,
            m2g_features: graph.m2g.features().to_dtype(dtype)?,
            step_diff_mean: graph.step_diff_mean.to_dtype(dtype)?,
            step_diff_std: graph.step_diff_std.to_dtype(dtype)?,
            grid_embedder,
            g2m_embedder,
            m2g_embedder,
            g2m_gnn,
            encoding_grid_mlp,
            m2g_gnn,
            output_map,
            mesh,
        })
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn device(&self) -> &Device {
        self.grid_static_features.device()
    }

    /// `(total mesh nodes, nodes ignored by encoder/decoder)`.
    pub fn count_mesh_nodes(&self) -> (usize, usize) {
        self.mesh.count_mesh_nodes()
    }

    /// One step ahead: `X_{t-1}, X_t → X_{t+1}`.
    ///
    /// * `prev_state`, `prev_prev_state`: (B, N_grid, d_state)
    /// * `batch_static`: (B, N_grid, d_batch_static)
    /// * `forcing`: (B, N_grid, d_forcing)
    ///
    /// The output has the shape and dtype of `prev_state`.
    pub fn predict_step(
        &self,
        prev_state: &Tensor,
        prev_prev_state: &Tensor,
        batch_static: &Tensor,
        forcing: &Tensor,
    ) -> Result<Tensor> {
        let b = prev_state.dim(0)?;
        let n = self.num_grid;
        let d = self.dims;
        check_shape("prev_state", prev_state, &[b, n, d.state_dim])?;
        check_shape("prev_prev_state", prev_prev_state, &[b, n, d.state_dim])?;
        check_shape("batch_static", batch_static, &[b, n, d.batch_static_dim])?;
        check_shape("forcing", forcing, &[b, n, d.forcing_dim])?;

        let out_dtype = prev_state.dtype();
        let prev = prev_state.to_dtype(self.dtype)?;
        let grid_static = expand_to_batch(&self.grid_static_features, b)?;
        let parts = [
            prev.clone(),
            prev_prev_state.to_dtype(self.dtype)?,
            batch_static.to_dtype(self.dtype)?,
            forcing.to_dtype(self.dtype)?,
            grid_static,
        ];
        let parts: Vec<&Tensor> = parts.iter().filter(|t| t.dim(2).unwrap_or(0) > 0).collect();
        let grid_features = Tensor::cat(&parts, 2)?;

        let grid_emb = self.grid_embedder.forward(&grid_features)?;
        let g2m_emb = expand_to_batch(&self.g2m_embedder.forward(&self.g2m_features)?, b)?;
        let m2g_emb = expand_to_batch(&self.m2g_embedder.forward(&self.m2g_features)?, b)?;
        let mesh_emb = expand_to_batch(&self.mesh.embed_mesh_nodes()?, b)?;

        // encode
        let mesh_rep = self.g2m_gnn.update_nodes(&grid_emb, &mesh_emb, &g2m_emb)?;
        let grid_rep = (&grid_emb + self.encoding_grid_mlp.forward(&grid_emb)?)?;

        let mesh_rep = self.mesh.process(&mesh_rep)?;

        // decode
        let grid_rep = self.m2g_gnn.update_nodes(&mesh_rep, &grid_rep, &m2g_emb)?;
        let net_output = self.output_map.forward(&grid_rep)?;

        let rescaled = net_output
            .broadcast_mul(&self.step_diff_std)?
            .broadcast_add(&self.step_diff_mean)?;
        Ok((prev + rescaled)?.to_dtype(out_dtype)?)
    }

    /// Roll [`predict_step`](Self::predict_step) over the forcing horizon.
    ///
    /// * `init_states`: (B, 2, N_grid, d_state), `[X_{-1}, X_0]`
    /// * `forcing`: (B, T, N_grid, d_forcing)
    /// * `batch_static`: (B, N_grid, d_batch_static)
    ///
    /// Returns (B, T, N_grid, d_state).
    pub fn unroll_prediction(&self, init_states: &Tensor, forcing: &Tensor, batch_static: &Tensor) -> Result<Tensor> {
        let steps = forcing.dim(1)?;
        let mut prev_prev = init_states.get_on_dim(1, 0)?.contiguous()?;
        let mut prev = init_states.get_on_dim(1, 1)?.contiguous()?;
        let mut predictions = Vec::with_capacity(steps);
        for t in 0..steps {
            let forcing_t = forcing.get_on_dim(1, t)?.contiguous()?;
            let pred = self.predict_step(&prev, &prev_prev, batch_static, &forcing_t)?;
            prev_prev = std::mem::replace(&mut prev, pred.clone());
            predictions.push(pred);
        }
        Ok(Tensor::stack(&predictions, 1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use lam_common::{build_rect_graph, DatasetInfo};

    const NX: usize = 8;
    const NY: usize = 6;

    fn dims() -> GridDims {
        GridDims {
            state_dim: 3,
            forcing_dim: 2,
            batch_static_dim: 1,
        }
    }

    fn graph(levels: usize, step_diff_mean: f32) -> GraphData {
        let dev = Device::Cpu;
        let topo = build_rect_graph(NX, NY, levels)
            .unwrap()
            .normalize_edge_lengths()
            .unwrap();
        let info = DatasetInfo {
            name: "test".into(),
            dims: dims(),
            grid_static_features: Tensor::randn(0f32, 1.0, (NX * NY, 2), &dev).unwrap(),
            step_diff_mean: Tensor::full(step_diff_mean, 3, &dev).unwrap(),
            step_diff_std: Tensor::ones(3, DType::F32, &dev).unwrap(),
        };
        GraphData::new(topo, &info, &dev).unwrap()
    }

    fn model(kind: ModelKind, graph: &GraphData, varmap: &VarMap) -> Result<GraphLam> {
        let cfg = GraphConfig {
            model: kind,
            hidden_dim: 8,
            processor_layers: 2,
            ..Default::default()
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        GraphLam::new(&cfg, graph, dims(), vb)
    }

    fn inputs(b: usize) -> (Tensor, Tensor, Tensor, Tensor) {
        let dev = Device::Cpu;
        let n = NX * NY;
        (
            Tensor::randn(0f32, 1.0, (b, n, 3), &dev).unwrap(),
            Tensor::randn(0f32, 1.0, (b, n, 3), &dev).unwrap(),
            Tensor::randn(0f32, 1.0, (b, n, 1), &dev).unwrap(),
            Tensor::randn(0f32, 1.0, (b, n, 2), &dev).unwrap(),
        )
    }

    #[test]
    fn predict_step_shape_for_every_model() {
        for (kind, levels) in [
            (ModelKind::GraphLam, 1),
            (ModelKind::HiLam, 2),
            (ModelKind::HiLamParallel, 2),
        ] {
            let g = graph(levels, 0.0);
            let varmap = VarMap::new();
            let m = model(kind, &g, &varmap).unwrap();
            let (prev, prev_prev, stat, forcing) = inputs(1);
            let out = m.predict_step(&prev, &prev_prev, &stat, &forcing).unwrap();
            assert_eq!(out.dims(), prev.dims(), "{kind}");
        }
    }

    #[test]
    fn zero_network_returns_previous_state() {
        for (kind, levels) in [(ModelKind::GraphLam, 1), (ModelKind::HiLam, 3)] {
            let g = graph(levels, 0.0);
            let varmap = VarMap::new();
            let m = model(kind, &g, &varmap).unwrap();
            for var in varmap.all_vars() {
                var.set(&var.zeros_like().unwrap()).unwrap();
            }
            let (prev, prev_prev, stat, forcing) = inputs(2);
            let out = m.predict_step(&prev, &prev_prev, &stat, &forcing).unwrap();
            let diff = (out - &prev).unwrap().abs().unwrap().flatten_all().unwrap();
            let max = diff.max(0).unwrap().to_scalar::<f32>().unwrap();
            assert_eq!(max, 0.0, "{kind}");
        }
    }

    #[test]
    fn zero_network_adds_step_mean() {
        let g = graph(1, 0.5);
        let varmap = VarMap::new();
        let m = model(ModelKind::GraphLam, &g, &varmap).unwrap();
        for var in varmap.all_vars() {
            var.set(&var.zeros_like().unwrap()).unwrap();
        }
        let (prev, prev_prev, stat, forcing) = inputs(1);
        let out = m.predict_step(&prev, &prev_prev, &stat, &forcing).unwrap();
        let delta: Vec<f32> = (out - &prev).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(delta.iter().all(|d| (d - 0.5).abs() < 1e-6));
    }

    #[test]
    fn unroll_stacks_every_step() {
        let g = graph(2, 0.0);
        let varmap = VarMap::new();
        let m = model(ModelKind::HiLamParallel, &g, &varmap).unwrap();
        let dev = Device::Cpu;
        let n = NX * NY;
        let init = Tensor::randn(0f32, 1.0, (2, 2, n, 3), &dev).unwrap();
        let forcing = Tensor::randn(0f32, 1.0, (2, 4, n, 2), &dev).unwrap();
        let stat = Tensor::zeros((2, n, 1), DType::F32, &dev).unwrap();
        let out = m.unroll_prediction(&init, &forcing, &stat).unwrap();
        assert_eq!(out.dims(), &[2, 4, n, 3]);
    }

    #[test]
    fn model_and_graph_must_agree_on_hierarchy() {
        let varmap = VarMap::new();
        let err = model(ModelKind::GraphLam, &graph(2, 0.0), &varmap).err().unwrap();
        assert!(matches!(
            err,
            crate::ModelError::Config(ConfigError::HierarchyMismatch { model: "graph_lam", required: "non-hierarchical" })
        ));
        let err = model(ModelKind::HiLam, &graph(1, 0.0), &varmap).err().unwrap();
        assert!(matches!(
            err,
            crate::ModelError::Config(ConfigError::HierarchyMismatch { model: "hi_lam", required: "hierarchical" })
        ));
    }

    #[test]
    fn wrong_state_width_is_a_shape_error() {
        let g = graph(1, 0.0);
        let varmap = VarMap::new();
        let m = model(ModelKind::GraphLam, &g, &varmap).unwrap();
        let (_, prev_prev, stat, forcing) = inputs(1);
        let prev = Tensor::zeros((1, NX * NY, 4), DType::F32, &Device::Cpu).unwrap();
        let err = m.predict_step(&prev, &prev_prev, &stat, &forcing).unwrap_err();
        assert!(matches!(err, crate::ModelError::Shape { stage: "prev_state", .. }));
    }

    #[test]
    fn mesh_node_counts() {
        let g = graph(3, 0.0);
        let varmap = VarMap::new();
        let m = model(ModelKind::HiLam, &g, &varmap).unwrap();
        let sizes = g.mesh.level_partition();
        let (total, ignored) = m.count_mesh_nodes();
        assert_eq!(total, sizes.total());
        assert_eq!(ignored, sizes.total() - sizes.sizes()[0]);
    }
}
