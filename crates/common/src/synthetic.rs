//! Synthetic rectangular graphs.
//!
//! A regular `nx × ny` grid on the unit square with a lattice mesh hierarchy
//! on top. Level 0 has roughly half the grid resolution, each coarser level
//! roughly a third of the previous one, never fewer than 2 nodes per axis.

use candle_core::{Device, Tensor};

use crate::error::ConfigError;
use crate::graph::{EdgeIndex, EdgeSet, GraphTopology, MeshGraph, MeshLevel};

/// Number of mesh nodes each grid node reads from when decoding.
const M2G_NEIGHBOURS: usize = 4;

/// Nodes of a regular lattice, row-major, at cell centres of the unit square.
#[derive(Debug, Clone, Copy)]
struct Lattice {
    nx: usize,
    ny: usize,
}

impl Lattice {
    fn len(&self) -> usize {
        self.nx * self.ny
    }

    fn positions(&self) -> Vec<[f32; 2]> {
        let mut pos = Vec::with_capacity(self.len());
        for j in 0..self.ny {
            for i in 0..self.nx {
                pos.push([
                    (i as f32 + 0.5) / self.nx as f32,
                    (j as f32 + 0.5) / self.ny as f32,
                ]);
            }
        }
        pos
    }

    /// Coarser lattice, `factor` times fewer nodes per axis.
    fn coarsen(&self, factor: usize) -> Self {
        Self {
            nx: self.nx.div_ceil(factor).max(2),
            ny: self.ny.div_ceil(factor).max(2),
        }
    }

    /// Bidirectional 4-neighbour edges.
    fn neighbour_edges(&self) -> (Vec<u32>, Vec<u32>) {
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        let idx = |i: usize, j: usize| (j * self.nx + i) as u32;
        for j in 0..self.ny {
            for i in 0..self.nx {
                if i + 1 < self.nx {
                    senders.extend([idx(i, j), idx(i + 1, j)]);
                    receivers.extend([idx(i + 1, j), idx(i, j)]);
                }
                if j + 1 < self.ny {
                    senders.extend([idx(i, j), idx(i, j + 1)]);
                    receivers.extend([idx(i, j + 1), idx(i, j)]);
                }
            }
        }
        (senders, receivers)
    }
}

fn dist2(a: [f32; 2], b: [f32; 2]) -> f32 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)
}

/// Indices of the `k` points in `candidates` closest to `p`, nearest first.
fn k_nearest(p: [f32; 2], candidates: &[[f32; 2]], k: usize) -> Vec<u32> {
    let mut order: Vec<(f32, u32)> = candidates
        .iter()
        .enumerate()
        .map(|(i, &c)| (dist2(p, c), i as u32))
        .collect();
    order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    order.into_iter().take(k).map(|(_, i)| i).collect()
}

/// `[length, dx, dy]` per edge, displacement from sender to receiver.
fn edge_features(
    senders: &[u32],
    receivers: &[u32],
    send_pos: &[[f32; 2]],
    rec_pos: &[[f32; 2]],
) -> candle_core::Result<Tensor> {
    let mut data = Vec::with_capacity(3 * senders.len());
    for (&s, &r) in senders.iter().zip(receivers) {
        let (a, b) = (send_pos[s as usize], rec_pos[r as usize]);
        let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
        data.extend([(dx * dx + dy * dy).sqrt(), dx, dy]);
    }
    Tensor::from_vec(data, (senders.len(), 3), &Device::Cpu)
}

fn node_features(pos: &[[f32; 2]]) -> candle_core::Result<Tensor> {
    let data: Vec<f32> = pos.iter().flat_map(|p| p.iter().copied()).collect();
    Tensor::from_vec(data, (pos.len(), 2), &Device::Cpu)
}

fn edge_set(
    name: &str,
    (senders, receivers): (Vec<u32>, Vec<u32>),
    send_pos: &[[f32; 2]],
    rec_pos: &[[f32; 2]],
) -> Result<EdgeSet, ConfigError> {
    let features = edge_features(&senders, &receivers, send_pos, rec_pos)?;
    let index = EdgeIndex::new(name, senders, receivers, send_pos.len(), rec_pos.len())?;
    EdgeSet::new(name, index, features)
}

/// Build a grid of `nx × ny` nodes with a `levels`-level lattice mesh.
/// `levels == 1` gives a flat graph.
pub fn build_rect_graph(nx: usize, ny: usize, levels: usize) -> Result<GraphTopology, ConfigError> {
    if levels == 0 {
        return Err(ConfigError::LevelCountMismatch {
            what: "mesh_features",
            expected: 1,
            actual: 0,
        });
    }
    if nx == 0 || ny == 0 {
        return Err(ConfigError::DimMismatch {
            what: "grid nodes per axis".to_string(),
            expected: 1,
            actual: 0,
        });
    }

    let grid = Lattice { nx, ny };
    let grid_pos = grid.positions();

    let mut lattices = vec![grid.coarsen(2)];
    for _ in 1..levels {
        let prev = lattices[lattices.len() - 1];
        lattices.push(prev.coarsen(3));
    }
    let level_pos: Vec<Vec<[f32; 2]>> = lattices.iter().map(Lattice::positions).collect();

    let mut mesh_levels = Vec::with_capacity(levels);
    for (l, (lattice, pos)) in lattices.iter().zip(&level_pos).enumerate() {
        let name = format!("m2m.{l}");
        mesh_levels.push(MeshLevel::new(
            &name,
            node_features(pos)?,
            edge_set(&name, lattice.neighbour_edges(), pos, pos)?,
        )?);
    }

    let mut up = Vec::with_capacity(levels - 1);
    let mut down = Vec::with_capacity(levels - 1);
    for l in 0..levels - 1 {
        let (lower, upper) = (&level_pos[l], &level_pos[l + 1]);
        let parents: Vec<u32> = lower.iter().map(|&p| k_nearest(p, upper, 1)[0]).collect();
        let children: Vec<u32> = (0..lower.len() as u32).collect();
        up.push(edge_set(
            &format!("mesh_up.{l}"),
            (children.clone(), parents.clone()),
            lower,
            upper,
        )?);
        down.push(edge_set(
            &format!("mesh_down.{l}"),
            (parents, children),
            upper,
            lower,
        )?);
    }

    let mesh0 = &level_pos[0];
    let g2m_senders: Vec<u32> = (0..grid_pos.len() as u32).collect();
    let g2m_receivers: Vec<u32> = grid_pos.iter().map(|&p| k_nearest(p, mesh0, 1)[0]).collect();
    let g2m = edge_set("g2m", (g2m_senders, g2m_receivers), &grid_pos, mesh0)?;

    let k = M2G_NEIGHBOURS.min(mesh0.len());
    let mut m2g_senders = Vec::with_capacity(k * grid_pos.len());
    let mut m2g_receivers = Vec::with_capacity(k * grid_pos.len());
    for (g, &p) in grid_pos.iter().enumerate() {
        for m in k_nearest(p, mesh0, k) {
            m2g_senders.push(m);
            m2g_receivers.push(g as u32);
        }
    }
    let m2g = edge_set("m2g", (m2g_senders, m2g_receivers), mesh0, &grid_pos)?;

    Ok(GraphTopology {
        num_grid_nodes: grid.len(),
        g2m,
        m2g,
        mesh: MeshGraph::new(mesh_levels, up, down)?,
    })
}
