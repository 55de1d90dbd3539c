//! Sequential hierarchical processor (HiLAM).
//!
//! Each processor layer is a down sweep followed by an up sweep:
//!
//! ```text
//! down: Same(L-1), Down(L-2), Same(L-2), …, Down(0), Same(0)
//! up:   Same(0),   Up(1),     Same(1),   …, Up(L-1), Same(L-1)
//! ```
//!
//! The top level is processed by same-level edges at the end of one up
//! sweep and again at the start of the next down sweep (and level 0 at the
//! sweep turn). Every step of every sweep has its own weights. Messages
//! are always summed at the receivers.

use candle_nn::VarBuilder;

use lam_common::{EdgeSet, GraphConfig, MeshGraph};

use crate::error::Result;
use crate::hierarchical::MeshReps;
use crate::interaction::{InteractionConfig, InteractionNet};

/// One step of a sweep. The level is always the receiving level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOp {
    /// Same-level edges on level l.
    Same(usize),
    /// Down edges from level l+1 into level l.
    Down(usize),
    /// Up edges from level l-1 into level l.
    Up(usize),
}

pub fn down_sweep(levels: usize) -> Vec<SweepOp> {
    let mut plan = vec![SweepOp::Same(levels - 1)];
    for l in (0..levels - 1).rev() {
        plan.extend([SweepOp::Down(l), SweepOp::Same(l)]);
    }
    plan
}

pub fn up_sweep(levels: usize) -> Vec<SweepOp> {
    let mut plan = vec![SweepOp::Same(0)];
    for l in 1..levels {
        plan.extend([SweepOp::Up(l), SweepOp::Same(l)]);
    }
    plan
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Down,
    Up,
}

/// GNNs of one sweep: one per level for same-level edges and one per level
/// pair for the vertical edges of the sweep direction.
struct Sweep {
    plan: Vec<SweepOp>,
    same: Vec<InteractionNet>,
    vertical: Vec<InteractionNet>,
}

fn nets<'a>(
    sets: impl Iterator<Item = &'a EdgeSet>,
    cfg: &InteractionConfig,
    vb: VarBuilder,
) -> Result<Vec<InteractionNet>> {
    sets.enumerate()
        .map(|(l, e)| InteractionNet::new(e.index(), cfg, vb.pp(l.to_string())))
        .collect()
}

impl Sweep {
    fn new(mesh: &MeshGraph, direction: Direction, cfg: &InteractionConfig, vb: VarBuilder) -> Result<Self> {
        let levels = mesh.num_levels();
        let same = nets(mesh.levels().iter().map(|l| l.m2m()), cfg, vb.pp("same"))?;
        let (vertical, plan) = match direction {
            Direction::Down => (nets(mesh.down().iter(), cfg, vb.pp("vertical"))?, down_sweep(levels)),
            Direction::Up => (nets(mesh.up().iter(), cfg, vb.pp("vertical"))?, up_sweep(levels)),
        };
        Ok(Self {
            plan,
            same,
            vertical,
        })
    }

    fn run(&self, reps: &mut MeshReps) -> Result<()> {
        for &op in &self.plan {
            match op {
                SweepOp::Same(l) => {
                    let (node, edge) =
                        self.same[l].forward(&reps.levels[l], &reps.levels[l], &reps.same[l])?;
                    reps.levels[l] = node;
                    reps.same[l] = edge;
                }
                SweepOp::Down(l) => {
                    let (node, edge) =
                        self.vertical[l].forward(&reps.levels[l + 1], &reps.levels[l], &reps.down[l])?;
                    reps.levels[l] = node;
                    reps.down[l] = edge;
                }
                SweepOp::Up(l) => {
                    let (node, edge) =
                        self.vertical[l - 1].forward(&reps.levels[l - 1], &reps.levels[l], &reps.up[l - 1])?;
                    reps.levels[l] = node;
                    reps.up[l - 1] = edge;
                }
            }
        }
        Ok(())
    }
}

pub struct SequentialProcessor {
    /// (down sweep, up sweep) per processor layer.
    layers: Vec<(Sweep, Sweep)>,
}

impl SequentialProcessor {
    pub fn new(mesh: &MeshGraph, cfg: &GraphConfig, vb: VarBuilder) -> Result<Self> {
        let net_cfg = InteractionConfig::new(cfg.hidden_dim, cfg.hidden_layers);
        let layers = (0..cfg.processor_layers)
            .map(|i| {
                let vb = vb.pp(i.to_string());
                Ok((
                    Sweep::new(mesh, Direction::Down, &net_cfg, vb.pp("down"))?,
                    Sweep::new(mesh, Direction::Up, &net_cfg, vb.pp("up"))?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            layers = cfg.processor_layers,
            levels = mesh.num_levels(),
            "Sequential hierarchical processor"
        );
        Ok(Self { layers })
    }

    pub fn step(&self, mut reps: MeshReps) -> Result<MeshReps> {
        for (down, up) in &self.layers {
            down.run(&mut reps)?;
            up.run(&mut reps)?;
        }
        Ok(reps)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarMap;
    use lam_common::{build_rect_graph, Aggregation};

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

    fn processor(mesh: &MeshGraph, varmap: &VarMap, layers: usize, mesh_aggr: Aggregation) -> SequentialProcessor {
        let cfg = GraphConfig {
            hidden_dim: 4,
            processor_layers: layers,
            mesh_aggr,
            ..Default::default()
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        SequentialProcessor::new(mesh, &cfg, vb).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn sweep_plans() {
        use SweepOp::*;
        assert_eq!(down_sweep(3), vec![Same(2), Down(1), Same(1), Down(0), Same(0)]);
        assert_eq!(up_sweep(3), vec![Same(0), Up(1), Same(1), Up(2), Same(2)]);
        assert_eq!(down_sweep(1), vec![Same(0)]);
    }

    #[test]
    fn each_level_processed_once_per_direction() {
        for levels in 2..6 {
            for plan in [down_sweep(levels), up_sweep(levels)] {
                let mut same: Vec<usize> = plan
                    .iter()
                    .filter_map(|op| match op {
                        SweepOp::Same(l) => Some(*l),
                        _ => None,
                    })
                    .collect();
                same.sort();
                assert_eq!(same, (0..levels).collect::<Vec<_>>());
                assert_eq!(plan.len(), 2 * levels - 1);
            }
        }
    }

    #[test]
    fn step_updates_levels_and_keeps_shapes() {
        let topo = build_rect_graph(12, 12, 3).unwrap();
        let mesh = &topo.mesh;
        let varmap = VarMap::new();
        let p = processor(mesh, &varmap, 2, Aggregation::Sum);
        assert_eq!(p.num_layers(), 2);

        let reps = reps(mesh, 1, 4);
        let out = p.step(reps.clone()).unwrap();
        for (a, b) in reps.levels.iter().zip(&out.levels) {
            assert_eq!(a.dims(), b.dims());
            let d = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
            assert!(d > 0.0);
        }
        // 2 layers x 2 sweeps x (3 same + 2 vertical) nets, each with two
        // MLPs of 2 linears + layer norm
        assert_eq!(varmap.all_vars().len(), 2 * 2 * (3 + 2) * 2 * 6);
    }

    /// With every other net zeroed (an exact identity), a single sweep step
    /// must change only its receiving level, by exactly one application.
    #[test]
    fn each_sweep_step_runs_once_on_its_receiving_level() {
        let topo = build_rect_graph(12, 12, 3).unwrap();
        let mesh = &topo.mesh;
        let input = reps(mesh, 2, 4);

        for (direction, plan) in [("down", down_sweep(3)), ("up", up_sweep(3))] {
            for op in plan {
                let varmap = VarMap::new();
                let p = processor(mesh, &varmap, 1, Aggregation::Sum);
                let prefix = match op {
                    SweepOp::Same(l) => format!("0.{direction}.same.{l}."),
                    SweepOp::Down(l) => format!("0.down.vertical.{l}."),
                    SweepOp::Up(l) => format!("0.up.vertical.{}.", l - 1),
                };
                for (name, var) in varmap.data().lock().unwrap().iter() {
                    if !name.starts_with(&prefix) {
                        var.set(&var.zeros_like().unwrap()).unwrap();
                    }
                }

                let (down, up) = &p.layers[0];
                let sweep = if direction == "down" { down } else { up };
                let (target, expected) = match op {
                    SweepOp::Same(l) => {
                        let lv = &input.levels[l];
                        (l, sweep.same[l].update_nodes(lv, lv, &input.same[l]).unwrap())
                    }
                    SweepOp::Down(l) => (
                        l,
                        sweep.vertical[l]
                            .update_nodes(&input.levels[l + 1], &input.levels[l], &input.down[l])
                            .unwrap(),
                    ),
                    SweepOp::Up(l) => (
                        l,
                        sweep.vertical[l - 1]
                            .update_nodes(&input.levels[l - 1], &input.levels[l], &input.up[l - 1])
                            .unwrap(),
                    ),
                };
                assert_ne!(values(&expected), values(&input.levels[target]), "{op:?} is inert");

                let out = p.step(input.clone()).unwrap();
                for (l, (before, after)) in input.levels.iter().zip(&out.levels).enumerate() {
                    if l == target {
                        assert_eq!(values(after), values(&expected), "{direction} {op:?}");
                    } else {
                        assert_eq!(values(after), values(before), "{direction} {op:?} touched level {l}");
                    }
                }
            }
        }
    }

    #[test]
    fn mesh_aggregation_option_does_not_reach_sweeps() {
        let topo = build_rect_graph(12, 12, 2).unwrap();
        let mesh = &topo.mesh;
        let varmap = VarMap::new();
        let summed = processor(mesh, &varmap, 1, Aggregation::Sum);
        // same VarMap, so both processors share every weight
        let averaged = processor(mesh, &varmap, 1, Aggregation::Mean);

        let input = reps(mesh, 1, 4);
        let a = summed.step(input.clone()).unwrap();
        let b = averaged.step(input).unwrap();
        for (x, y) in a.levels.iter().zip(&b.levels) {
            assert_eq!(values(x), values(y));
        }
    }
}
