//! Parallel hierarchical processor (HiLAMParallel).
//!
//! All levels are concatenated into one node tensor and all mesh edges
//! (same-level, then up, then down) into one edge tensor. Each processor
//! layer is a single interaction net over the combined edge index, with one
//! edge MLP per edge set and one aggregation MLP per level. Messages are
//! always summed at the receivers.

use candle_nn::VarBuilder;

use lam_common::{EdgeIndex, GraphConfig, LevelPartition, MeshGraph};

use crate::error::Result;
use crate::hierarchical::MeshReps;
use crate::interaction::{InteractionConfig, InteractionNet};

pub struct ParallelProcessor {
    nets: Vec<InteractionNet>,
    node_partition: LevelPartition,
    edge_partition: LevelPartition,
    num_levels: usize,
}

/// Edge index over the concatenated levels, ordered same-level (per level),
/// up (per level pair), down (per level pair), with matching chunk sizes.
pub fn combined_edge_index(mesh: &MeshGraph) -> Result<(EdgeIndex, LevelPartition)> {
    let partition = mesh.level_partition();
    let offsets = partition.offsets();
    let mut senders = Vec::new();
    let mut receivers = Vec::new();
    let mut sections = Vec::new();
    let mut push = |index: &EdgeIndex, send_offset: usize, rec_offset: usize| {
        let (s, r) = index.shifted(send_offset, rec_offset);
        sections.push(s.len());
        senders.extend(s);
        receivers.extend(r);
    };
    for (l, level) in mesh.levels().iter().enumerate() {
        push(level.m2m().index(), offsets[l], offsets[l]);
    }
    for (l, up) in mesh.up().iter().enumerate() {
        push(up.index(), offsets[l], offsets[l + 1]);
    }
    for (l, down) in mesh.down().iter().enumerate() {
        push(down.index(), offsets[l + 1], offsets[l]);
    }
    let total = partition.total();
    let index = EdgeIndex::new("mesh", senders, receivers, total, total)?;
    Ok((index, LevelPartition::new(sections)))
}

impl ParallelProcessor {
    pub fn new(mesh: &MeshGraph, cfg: &GraphConfig, vb: VarBuilder) -> Result<Self> {
        let node_partition = mesh.level_partition();
        let (index, edge_partition) = combined_edge_index(mesh)?;
        let net_cfg = InteractionConfig::new(cfg.hidden_dim, cfg.hidden_layers)
            .chunks(edge_partition.clone(), node_partition.clone());
        let nets = (0..cfg.processor_layers)
            .map(|i| InteractionNet::new(&index, &net_cfg, vb.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            layers = cfg.processor_layers,
            nodes = node_partition.total(),
            edges = index.len(),
            "Parallel hierarchical processor"
        );
        Ok(Self {
            nets,
            node_partition,
            edge_partition,
            num_levels: mesh.num_levels(),
        })
    }

    /// Run every layer on the joined representations. With zero layers the
    /// representations are returned unchanged.
    pub fn step(&self, reps: MeshReps) -> Result<MeshReps> {
        if self.nets.is_empty() {
            return Ok(reps);
        }
        let mut mesh_rep = self.node_partition.concat(&reps.levels, 1)?;
        let edges: Vec<_> = reps
            .same
            .into_iter()
            .chain(reps.up)
            .chain(reps.down)
            .collect();
        let mut edge_rep = self.edge_partition.concat(&edges, 1)?;

        for net in &self.nets {
            (mesh_rep, edge_rep) = net.forward(&mesh_rep, &mesh_rep, &edge_rep)?;
        }

        let levels = self.node_partition.split(&mesh_rep, 1)?;
        let mut edges = self.edge_partition.split(&edge_rep, 1)?;
        let down = edges.split_off(2 * self.num_levels - 1);
        let up = edges.split_off(self.num_levels);
        Ok(MeshReps {
            levels,
            same: edges,
            up,
            down,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarMap;
    use lam_common::{build_rect_graph, Aggregation, EdgeSet, MeshLevel};

    fn reps(mesh: &MeshGraph, b: usize, h: usize) -> MeshReps {
        let dev = Device::Cpu;
        let t = |n: usize| Tensor::randn(0f32, 1.0, (b, n, h), &dev).unwrap();
        MeshReps {
            levels: mesh.levels().iter().map(|l| t(l.num_nodes())).collect(),
            same: mesh.levels().iter().map(|l| t(l.m2m().num_edges())).collect(),
            up: mesh.up().iter().map(|e| t(e.num_edges())).collect(),
            down: mesh.down().iter().map(|e| t(e.num_edges())).collect(),
        }
    }

    fn processor_with(mesh: &MeshGraph, varmap: &VarMap, layers: usize, mesh_aggr: Aggregation) -> ParallelProcessor {
        let cfg = GraphConfig {
            hidden_dim: 8,
            processor_layers: layers,
            mesh_aggr,
            ..Default::default()
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        ParallelProcessor::new(mesh, &cfg, vb).unwrap()
    }

    fn processor(mesh: &MeshGraph, layers: usize) -> ParallelProcessor {
        processor_with(mesh, &VarMap::new(), layers, Aggregation::Sum)
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn edge_set(name: &str, senders: Vec<u32>, receivers: Vec<u32>, n_s: usize, n_r: usize) -> EdgeSet {
        let m = senders.len();
        let index = EdgeIndex::new(name, senders, receivers, n_s, n_r).unwrap();
        EdgeSet::new(name, index, Tensor::ones((m, 3), DType::F32, &Device::Cpu).unwrap()).unwrap()
    }

    /// Two levels of 3 and 2 nodes. Only level-0 node 0 receives a down edge.
    fn two_level_mesh() -> MeshGraph {
        let level = |name: &str, n: usize, s: Vec<u32>, r: Vec<u32>| {
            let features = Tensor::ones((n, 2), DType::F32, &Device::Cpu).unwrap();
            MeshLevel::new(name, features, edge_set(name, s, r, n, n)).unwrap()
        };
        let levels = vec![
            level("m2m.0", 3, vec![2, 0, 1], vec![0, 1, 2]),
            level("m2m.1", 2, vec![0, 1], vec![1, 0]),
        ];
        let up = vec![edge_set("mesh_up.0", vec![0, 2], vec![0, 1], 3, 2)];
        let down = vec![edge_set("mesh_down.0", vec![0], vec![0], 2, 3)];
        MeshGraph::new(levels, up, down).unwrap()
    }

    #[test]
    fn combined_index_offsets_levels() {
        let topo = build_rect_graph(12, 12, 2).unwrap();
        let mesh = &topo.mesh;
        let (index, sections) = combined_edge_index(mesh).unwrap();
        let n0 = mesh.levels()[0].num_nodes() as u32;
        assert_eq!(sections.len(), 4);
        assert_eq!(sections.total(), index.len());

        let offsets = sections.offsets();
        // up edges: senders on level 0, receivers on level 1
        let up = offsets[2]..offsets[3];
        assert!(index.senders()[up.clone()].iter().all(|&s| s < n0));
        assert!(index.receivers()[up].iter().all(|&r| r >= n0));
        // down edges: the reverse
        let down = offsets[3]..index.len();
        assert!(index.senders()[down.clone()].iter().all(|&s| s >= n0));
        assert!(index.receivers()[down].iter().all(|&r| r < n0));
    }

    #[test]
    fn zero_layers_is_identity() {
        let topo = build_rect_graph(12, 12, 3).unwrap();
        let p = processor(&topo.mesh, 0);
        let input = reps(&topo.mesh, 2, 8);
        let out = p.step(input.clone()).unwrap();
        for (a, b) in input.levels.iter().zip(&out.levels) {
            let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
            let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn step_preserves_every_shape() {
        let topo = build_rect_graph(12, 12, 3).unwrap();
        let p = processor(&topo.mesh, 2);
        let input = reps(&topo.mesh, 2, 8);
        let out = p.step(input.clone()).unwrap();
        assert_eq!(out.same.len(), 3);
        assert_eq!(out.up.len(), 2);
        assert_eq!(out.down.len(), 2);
        let all_in = input.levels.iter().chain(&input.same).chain(&input.up).chain(&input.down);
        let all_out = out.levels.iter().chain(&out.same).chain(&out.up).chain(&out.down);
        for (a, b) in all_in.zip(all_out) {
            assert_eq!(a.dims(), b.dims());
        }
    }

    #[test]
    fn batch_members_are_independent() {
        let topo = build_rect_graph(12, 12, 3).unwrap();
        let p = processor(&topo.mesh, 2);
        let input = reps(&topo.mesh, 2, 8);
        let first = |r: &MeshReps| MeshReps {
            levels: r.levels.iter().map(|t| t.narrow(0, 0, 1).unwrap()).collect(),
            same: r.same.iter().map(|t| t.narrow(0, 0, 1).unwrap()).collect(),
            up: r.up.iter().map(|t| t.narrow(0, 0, 1).unwrap()).collect(),
            down: r.down.iter().map(|t| t.narrow(0, 0, 1).unwrap()).collect(),
        };
        let batched = first(&p.step(input.clone()).unwrap());
        let alone = p.step(first(&input)).unwrap();
        for (a, b) in batched.levels.iter().zip(&alone.levels) {
            for (x, y) in values(a).iter().zip(values(b)) {
                assert!((x - y).abs() < 1e-5, "{x} vs {y}");
            }
        }
    }

    #[test]
    fn level_chunks_only_see_their_own_edges() {
        let mesh = two_level_mesh();
        let p = processor(&mesh, 1);
        let input = reps(&mesh, 2, 8);
        let mut shifted = input.clone();
        shifted.levels[1] = shifted.levels[1].affine(1.0, 1.0).unwrap();

        let base = p.step(input).unwrap();
        let moved = p.step(shifted).unwrap();
        let rows = |r: &MeshReps, start: usize, len: usize| values(&r.levels[0].narrow(1, start, len).unwrap());
        // node 0 hears level 1 through the down edge
        assert_ne!(rows(&base, 0, 1), rows(&moved, 0, 1));
        // nodes 1 and 2 only hear level 0
        assert_eq!(rows(&base, 1, 2), rows(&moved, 1, 2));
    }

    #[test]
    fn mesh_aggregation_option_is_ignored() {
        let topo = build_rect_graph(12, 12, 2).unwrap();
        let varmap = VarMap::new();
        let summed = processor_with(&topo.mesh, &varmap, 1, Aggregation::Sum);
        let averaged = processor_with(&topo.mesh, &varmap, 1, Aggregation::Mean);
        let input = reps(&topo.mesh, 1, 8);
        let a = summed.step(input.clone()).unwrap();
        let b = averaged.step(input).unwrap();
        for (x, y) in a.levels.iter().zip(&b.levels) {
            assert_eq!(values(x), values(y));
        }
    }
}
