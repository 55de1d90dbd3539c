//! Hierarchical mesh skeleton shared by HiLAM and HiLAMParallel.
//!
//! ```text
//! embed levels ≥ 1 and all mesh edges
//! init:     for l = 1..L-1    level l ← up GNN(level l-1)
//! process:  HiProcessor (parallel or sequential sweeps)
//! read-out: for l = L-2..=0   level l ← down GNN(level l+1), nodes only
//! ```
//!
//! Only level 0 is returned; it is the level connected to the grid.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use lam_common::{ConfigError, GraphConfig, LevelPartition, MeshGraph, ModelKind};

use crate::error::Result;
use crate::interaction::{InteractionConfig, InteractionNet};
use crate::mesh::{expand_to_batch, MeshModel};
use crate::mlp::Mlp;
use crate::parallel::ParallelProcessor;
use crate::sequential::SequentialProcessor;

// ── Representations ─────────────────────────────────────────────────────────

/// Per-level node and per-family edge representations, all (B, ·, h).
#[derive(Debug, Clone)]
pub struct MeshReps {
    /// One per level, level 0 first.
    pub levels: Vec<Tensor>,
    /// Same-level edges, one per level.
    pub same: Vec<Tensor>,
    /// Up edges, entry `l` goes from level l to level l+1.
    pub up: Vec<Tensor>,
    /// Down edges, entry `l` goes from level l+1 to level l.
    pub down: Vec<Tensor>,
}

// ── Processor dispatch ──────────────────────────────────────────────────────

/// Processor run between init and read-out.
pub enum HiProcessor {
    Parallel(ParallelProcessor),
    Sequential(SequentialProcessor),
}

impl HiProcessor {
    pub fn step(&self, reps: MeshReps) -> Result<MeshReps> {
        match self {
            Self::Parallel(p) => p.step(reps),
            Self::Sequential(p) => p.step(reps),
        }
    }
}

// ── HierarchicalMesh ────────────────────────────────────────────────────────

pub struct HierarchicalMesh {
    static_features: Vec<Tensor>,
    same_features: Vec<Tensor>,
    up_features: Vec<Tensor>,
    down_features: Vec<Tensor>,
    mesh_embedders: Vec<Mlp>,
    same_embedders: Vec<Mlp>,
    up_embedders: Vec<Mlp>,
    down_embedders: Vec<Mlp>,
    init_gnns: Vec<InteractionNet>,
    read_gnns: Vec<InteractionNet>,
    processor: HiProcessor,
    partition: LevelPartition,
}

/// Shared feature width of a family of tensors, checked across levels.
fn common_dim(what: &str, features: &[&Tensor]) -> Result<usize> {
    let first = match features.first() {
        Some(f) => f.dim(1)?,
        None => return Ok(0),
    };
    for (l, f) in features.iter().enumerate().skip(1) {
        let d = f.dim(1)?;
        if d != first {
            return Err(ConfigError::DimMismatch {
                what: format!("{what} feature width at level {l}"),
                expected: first,
                actual: d,
            }
            .into());
        }
    }
    Ok(first)
}

fn embedders(cfg: &GraphConfig, input_dim: usize, count: usize, vb: VarBuilder) -> Result<Vec<Mlp>> {
    let blueprint = cfg.mlp_blueprint(input_dim);
    (0..count)
        .map(|l| Ok(Mlp::new(&blueprint, true, vb.pp(l.to_string()))?))
        .collect()
}

impl HierarchicalMesh {
    /// Build the skeleton and the processor selected by `cfg.model`.
    pub fn new(mesh: &MeshGraph, cfg: &GraphConfig, vb: VarBuilder) -> Result<Self> {
        if !mesh.is_hierarchical() || !cfg.model.is_hierarchical() {
            return Err(ConfigError::HierarchyMismatch {
                model: cfg.model.name(),
                required: if cfg.model.is_hierarchical() {
                    "hierarchical"
                } else {
                    "non-hierarchical"
                },
            }
            .into());
        }
        let dtype = vb.dtype();
        let n_levels = mesh.num_levels();
        let partition = mesh.level_partition();

        tracing::info!(levels = n_levels, "Loaded hierarchical graph");
        for (l, level) in mesh.levels().iter().enumerate() {
            tracing::info!(
                level = l,
                nodes = level.num_nodes(),
                same_edges = level.m2m().num_edges(),
                up_edges = mesh.up().get(l).map(|e| e.num_edges()),
                down_edges = mesh.down().get(l).map(|e| e.num_edges()),
                "Mesh level"
            );
        }

        let static_refs: Vec<&Tensor> = mesh.levels().iter().map(|l| l.static_features()).collect();
        let same_refs: Vec<&Tensor> = mesh.levels().iter().map(|l| l.m2m().features()).collect();
        let up_refs: Vec<&Tensor> = mesh.up().iter().map(|e| e.features()).collect();
        let down_refs: Vec<&Tensor> = mesh.down().iter().map(|e| e.features()).collect();

        let mesh_embedders = embedders(cfg, common_dim("mesh node", &static_refs)?, n_levels, vb.pp("mesh_embedders"))?;
        let same_embedders = embedders(cfg, common_dim("m2m edge", &same_refs)?, n_levels, vb.pp("same_embedders"))?;
        let up_embedders = embedders(cfg, common_dim("up edge", &up_refs)?, n_levels - 1, vb.pp("up_embedders"))?;
        let down_embedders = embedders(cfg, common_dim("down edge", &down_refs)?, n_levels - 1, vb.pp("down_embedders"))?;

        let init_cfg = InteractionConfig::new(cfg.hidden_dim, cfg.hidden_layers);
        let read_cfg = init_cfg.clone().update_edges(false);
        let init_gnns = mesh
            .up()
            .iter()
            .enumerate()
            .map(|(l, e)| InteractionNet::new(e.index(), &init_cfg, vb.pp(format!("init_gnns.{l}"))))
            .collect::<Result<Vec<_>>>()?;
        let read_gnns = mesh
            .down()
            .iter()
            .enumerate()
            .map(|(l, e)| InteractionNet::new(e.index(), &read_cfg, vb.pp(format!("read_gnns.{l}"))))
            .collect::<Result<Vec<_>>>()?;

        let processor = match cfg.model {
            ModelKind::HiLamParallel => {
                HiProcessor::Parallel(ParallelProcessor::new(mesh, cfg, vb.pp("processor"))?)
            }
            _ => HiProcessor::Sequential(SequentialProcessor::new(mesh, cfg, vb.pp("processor"))?),
        };

        let cast = |ts: Vec<&Tensor>| -> Result<Vec<Tensor>> {
            ts.into_iter()
                .map(|t| Ok(t.to_dtype(dtype)?))
                .collect()
        };
        Ok(Self {
            static_features: cast(static_refs)?,
            same_features: cast(same_refs)?,
            up_features: cast(up_refs)?,
            down_features: cast(down_refs)?,
            mesh_embedders,
            same_embedders,
            up_embedders,
            down_embedders,
            init_gnns,
            read_gnns,
            processor,
            partition,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.partition.len()
    }

    /// Embed levels ≥ 1 and every mesh edge family, next to the given
    /// level-0 representation (B, N_0, h).
    pub fn embed(&self, mesh_rep: &Tensor) -> Result<MeshReps> {
        let b = mesh_rep.dim(0)?;
        let embed_all = |mlps: &[Mlp], features: &[Tensor]| -> Result<Vec<Tensor>> {
            mlps.iter()
                .zip(features)
                .map(|(mlp, f)| Ok(expand_to_batch(&mlp.forward(f)?, b)?))
                .collect()
        };
        let mut levels = vec![mesh_rep.clone()];
        levels.extend(embed_all(&self.mesh_embedders[1..], &self.static_features[1..])?);
        Ok(MeshReps {
            levels,
            same: embed_all(&self.same_embedders, &self.same_features)?,
            up: embed_all(&self.up_embedders, &self.up_features)?,
            down: embed_all(&self.down_embedders, &self.down_features)?,
        })
    }

    /// Propagate upwards: level l receives from level l-1 over up edges,
    /// which are updated too.
    pub fn init(&self, mut reps: MeshReps) -> Result<MeshReps> {
        for (l, gnn) in self.init_gnns.iter().enumerate() {
            let (node, edge) = gnn.forward(&reps.levels[l], &reps.levels[l + 1], &reps.up[l])?;
            reps.levels[l + 1] = node;
            reps.up[l] = edge;
        }
        Ok(reps)
    }

    /// Propagate downwards to level 0 over down edges and return it.
    pub fn read_out(&self, mut reps: MeshReps) -> Result<Tensor> {
        for (l, gnn) in self.read_gnns.iter().enumerate().rev() {
            reps.levels[l] = gnn.update_nodes(&reps.levels[l + 1], &reps.levels[l], &reps.down[l])?;
        }
        Ok(reps.levels.swap_remove(0))
    }

    pub fn processor(&self) -> &HiProcessor {
        &self.processor
    }
}

impl MeshModel for HierarchicalMesh {
    fn count_mesh_nodes(&self) -> (usize, usize) {
        let total = self.partition.total();
        (total, total - self.partition.sizes()[0])
    }

    fn embed_mesh_nodes(&self) -> Result<Tensor> {
        Ok(self.mesh_embedders[0].forward(&self.static_features[0])?)
    }

    fn process(&self, mesh_rep: &Tensor) -> Result<Tensor> {
        let reps = self.embed(mesh_rep)?;
        let reps = self.init(reps)?;
        let reps = self.processor.step(reps)?;
        self.read_out(reps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use lam_common::build_rect_graph;

    fn build(model: ModelKind, levels: usize, layers: usize) -> (HierarchicalMesh, MeshGraph) {
        let topo = build_rect_graph(12, 12, levels).unwrap();
        let cfg = GraphConfig {
            model,
            hidden_dim: 8,
            processor_layers: layers,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (HierarchicalMesh::new(&topo.mesh, &cfg, vb).unwrap(), topo.mesh)
    }

    #[test]
    fn counts_ignore_levels_above_bottom() {
        let (mesh, graph) = build(ModelKind::HiLam, 3, 1);
        let sizes = graph.level_partition();
        assert_eq!(sizes.sizes(), &[36, 4, 4]);
        assert_eq!(mesh.count_mesh_nodes(), (44, 8));
    }

    #[test]
    fn process_returns_bottom_level() {
        for model in [ModelKind::HiLam, ModelKind::HiLamParallel] {
            let (mesh, _) = build(model, 2, 2);
            let emb = mesh.embed_mesh_nodes().unwrap();
            let rep = expand_to_batch(&emb, 1).unwrap();
            let out = mesh.process(&rep).unwrap();
            assert_eq!(out.dims(), &[1, 36, 8]);
        }
    }

    #[test]
    fn process_handles_batched_input() {
        for model in [ModelKind::HiLam, ModelKind::HiLamParallel] {
            let (mesh, _) = build(model, 3, 2);
            let emb = mesh.embed_mesh_nodes().unwrap();
            let single = expand_to_batch(&emb, 1).unwrap();
            let rep = Tensor::cat(&[&single, &single.affine(-1.0, 0.5).unwrap()], 0).unwrap();
            let out = mesh.process(&rep).unwrap();
            assert_eq!(out.dims(), &[2, 36, 8]);

            // batch members are processed independently
            let flat = |t: &Tensor| -> Vec<f32> { t.get(0).unwrap().flatten_all().unwrap().to_vec1().unwrap() };
            let first = flat(&out);
            let alone = flat(&mesh.process(&single).unwrap());
            for (a, b) in first.iter().zip(&alone) {
                assert!((a - b).abs() < 1e-5, "{model:?}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn embed_shapes_per_level() {
        let (mesh, graph) = build(ModelKind::HiLamParallel, 3, 1);
        let rep = Tensor::zeros((2, 36, 8), DType::F32, &Device::Cpu).unwrap();
        let reps = mesh.embed(&rep).unwrap();
        assert_eq!(reps.levels.len(), 3);
        assert_eq!(reps.up.len(), 2);
        for (l, level) in graph.levels().iter().enumerate() {
            assert_eq!(reps.levels[l].dims(), &[2, level.num_nodes(), 8]);
            assert_eq!(reps.same[l].dims(), &[2, level.m2m().num_edges(), 8]);
        }
        for (l, down) in graph.down().iter().enumerate() {
            assert_eq!(reps.down[l].dims(), &[2, down.num_edges(), 8]);
        }
    }

    #[test]
    fn flat_graph_is_rejected() {
        let topo = build_rect_graph(6, 6, 1).unwrap();
        let cfg = GraphConfig {
            model: ModelKind::HiLam,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = HierarchicalMesh::new(&topo.mesh, &cfg, vb).err().unwrap();
        assert!(matches!(
            err,
            crate::ModelError::Config(ConfigError::HierarchyMismatch { model: "hi_lam", .. })
        ));
    }
}
