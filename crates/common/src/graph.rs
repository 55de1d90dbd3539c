//! Grid + mesh graph: edge sets, mesh levels and loading from disk.
//!
//! A graph directory holds one `graph.safetensors` with these tensors:
//!
//! | Name | Shape | Notes |
//! |------|-------|-------|
//! | `g2m_edge_index` / `m2g_edge_index` | (2, M) | row 0 senders, row 1 receivers |
//! | `g2m_features` / `m2g_features` | (M, d) | |
//! | `mesh_features.{l}` | (N_l, d) | one per level, level 0 is the finest |
//! | `m2m_edge_index.{l}` / `m2m_features.{l}` | | same-level edges |
//! | `mesh_up_edge_index.{l}` / `mesh_up_features.{l}` | | level l → l+1 |
//! | `mesh_down_edge_index.{l}` / `mesh_down_features.{l}` | | level l+1 → l |
//!
//! Indices are local to their node set: grid indices count grid nodes,
//! mesh indices count nodes of the level they point into.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::data::DatasetInfo;
use crate::error::ConfigError;
use crate::partition::LevelPartition;

/// File name of the graph tensors inside a graph directory.
pub const GRAPH_FILE: &str = "graph.safetensors";

// ── EdgeIndex ───────────────────────────────────────────────────────────────

/// Directed edges between a sender node set and a receiver node set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeIndex {
    senders: Vec<u32>,
    receivers: Vec<u32>,
    num_senders: usize,
    num_receivers: usize,
}

impl EdgeIndex {
    /// Build and range-check an edge index. `name` only labels errors.
    pub fn new(
        name: &str,
        senders: Vec<u32>,
        receivers: Vec<u32>,
        num_senders: usize,
        num_receivers: usize,
    ) -> Result<Self, ConfigError> {
        if senders.len() != receivers.len() {
            return Err(ConfigError::EdgeIndexShape {
                edges: name.to_string(),
                shape: vec![senders.len(), receivers.len()],
            });
        }
        check_range(name, "sender", &senders, num_senders)?;
        check_range(name, "receiver", &receivers, num_receivers)?;
        Ok(Self {
            senders,
            receivers,
            num_senders,
            num_receivers,
        })
    }

    /// Read a (2, M) integer tensor.
    pub fn from_tensor(
        name: &str,
        index: &Tensor,
        num_senders: usize,
        num_receivers: usize,
    ) -> Result<Self, ConfigError> {
        if index.rank() != 2 || index.dim(0)? != 2 {
            return Err(ConfigError::EdgeIndexShape {
                edges: name.to_string(),
                shape: index.dims().to_vec(),
            });
        }
        let rows = index.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let mut rows = rows.into_iter();
        let senders = rows.next().unwrap_or_default();
        let receivers = rows.next().unwrap_or_default();
        Self::new(name, senders, receivers, num_senders, num_receivers)
    }

    pub fn senders(&self) -> &[u32] {
        &self.senders
    }

    pub fn receivers(&self) -> &[u32] {
        &self.receivers
    }

    pub fn num_senders(&self) -> usize {
        self.num_senders
    }

    pub fn num_receivers(&self) -> usize {
        self.num_receivers
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Number of incoming edges per receiver node.
    pub fn in_degree(&self) -> Vec<u32> {
        let mut degree = vec![0u32; self.num_receivers];
        for &r in &self.receivers {
            degree[r as usize] += 1;
        }
        degree
    }

    /// Shift indices into a larger node numbering: senders by
    /// `sender_offset`, receivers by `receiver_offset`.
    pub fn shifted(&self, sender_offset: usize, receiver_offset: usize) -> (Vec<u32>, Vec<u32>) {
        let s = self
            .senders
            .iter()
            .map(|&i| i + sender_offset as u32)
            .collect();
        let r = self
            .receivers
            .iter()
            .map(|&i| i + receiver_offset as u32)
            .collect();
        (s, r)
    }

    /// The index as a (2, M) `u32` tensor.
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let mut flat = Vec::with_capacity(2 * self.len());
        flat.extend_from_slice(&self.senders);
        flat.extend_from_slice(&self.receivers);
        Tensor::from_vec(flat, (2, self.len()), device)
    }
}

fn check_range(name: &str, row: &'static str, idx: &[u32], bound: usize) -> Result<(), ConfigError> {
    match idx.iter().find(|&&i| i as usize >= bound) {
        Some(&index) => Err(ConfigError::EdgeIndexOutOfRange {
            edges: name.to_string(),
            row,
            index,
            bound,
        }),
        None => Ok(()),
    }
}

// ── EdgeSet ─────────────────────────────────────────────────────────────────

/// An edge index together with its static edge features (M, d).
#[derive(Debug, Clone)]
pub struct EdgeSet {
    name: String,
    index: EdgeIndex,
    features: Tensor,
    feature_dim: usize,
}

impl EdgeSet {
    /// Fails when the index and the features disagree on the edge count.
    pub fn new(name: &str, index: EdgeIndex, features: Tensor) -> Result<Self, ConfigError> {
        let (feature_edges, feature_dim) = features.dims2()?;
        if feature_edges != index.len() {
            return Err(ConfigError::EdgeCountMismatch {
                edges: name.to_string(),
                index_edges: index.len(),
                feature_edges,
            });
        }
        Ok(Self {
            name: name.to_string(),
            index,
            features,
            feature_dim,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> &EdgeIndex {
        &self.index
    }

    pub fn features(&self) -> &Tensor {
        &self.features
    }

    pub fn num_edges(&self) -> usize {
        self.index.len()
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn scaled(self, scale: f64) -> candle_core::Result<Self> {
        Ok(Self {
            features: self.features.affine(scale, 0.0)?,
            ..self
        })
    }

    fn to_device(self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            features: self.features.to_device(device)?,
            ..self
        })
    }
}

// ── Mesh ────────────────────────────────────────────────────────────────────

/// One mesh level: node static features and same-level edges.
#[derive(Debug, Clone)]
pub struct MeshLevel {
    static_features: Tensor,
    m2m: EdgeSet,
    num_nodes: usize,
}

impl MeshLevel {
    /// `static_features` is (N, d); the m2m index must join those N nodes.
    pub fn new(name: &str, static_features: Tensor, m2m: EdgeSet) -> Result<Self, ConfigError> {
        if static_features.rank() != 2 {
            return Err(ConfigError::DimMismatch {
                what: format!("{name} static feature rank"),
                expected: 2,
                actual: static_features.rank(),
            });
        }
        let num_nodes = static_features.dim(0)?;
        let index = m2m.index();
        if index.num_senders() != num_nodes || index.num_receivers() != num_nodes {
            return Err(ConfigError::DimMismatch {
                what: format!("{name} node count"),
                expected: num_nodes,
                actual: index.num_senders().max(index.num_receivers()),
            });
        }
        Ok(Self {
            static_features,
            m2m,
            num_nodes,
        })
    }

    pub fn static_features(&self) -> &Tensor {
        &self.static_features
    }

    pub fn m2m(&self) -> &EdgeSet {
        &self.m2m
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }
}

/// The mesh: one level for flat graphs, L ≥ 2 levels plus L-1 up and
/// L-1 down edge sets for hierarchical graphs.
#[derive(Debug, Clone)]
pub struct MeshGraph {
    levels: Vec<MeshLevel>,
    up: Vec<EdgeSet>,
    down: Vec<EdgeSet>,
}

impl MeshGraph {
    pub fn new(
        levels: Vec<MeshLevel>,
        up: Vec<EdgeSet>,
        down: Vec<EdgeSet>,
    ) -> Result<Self, ConfigError> {
        if levels.is_empty() {
            return Err(ConfigError::LevelCountMismatch {
                what: "mesh_features",
                expected: 1,
                actual: 0,
            });
        }
        let expected = levels.len() - 1;
        for (what, sets) in [("mesh_up_features", &up), ("mesh_down_features", &down)] {
            if sets.len() != expected {
                return Err(ConfigError::LevelCountMismatch {
                    what,
                    expected,
                    actual: sets.len(),
                });
            }
        }
        for (l, (u, d)) in up.iter().zip(&down).enumerate() {
            let (lower, upper) = (levels[l].num_nodes(), levels[l + 1].num_nodes());
            check_endpoints(u, lower, upper)?;
            check_endpoints(d, upper, lower)?;
        }
        Ok(Self { levels, up, down })
    }

    pub fn levels(&self) -> &[MeshLevel] {
        &self.levels
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn is_hierarchical(&self) -> bool {
        self.levels.len() > 1
    }

    /// Up edges, entry `l` goes from level l to level l+1.
    pub fn up(&self) -> &[EdgeSet] {
        &self.up
    }

    /// Down edges, entry `l` goes from level l+1 to level l.
    pub fn down(&self) -> &[EdgeSet] {
        &self.down
    }

    /// Node count per level, finest first.
    pub fn level_partition(&self) -> LevelPartition {
        LevelPartition::new(self.levels.iter().map(MeshLevel::num_nodes).collect())
    }

    /// Longest same-level edge, read from the first feature column.
    fn longest_edge(&self) -> candle_core::Result<f64> {
        let mut longest = 0f64;
        for level in &self.levels {
            if level.m2m.num_edges() == 0 {
                continue;
            }
            let lengths = level.m2m.features().narrow(1, 0, 1)?;
            let max = lengths
                .to_dtype(DType::F32)?
                .max_keepdim(0)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            longest = longest.max(max.first().copied().unwrap_or(0.0) as f64);
        }
        Ok(longest)
    }

    fn map_edges(
        self,
        f: impl Fn(EdgeSet) -> candle_core::Result<EdgeSet>,
    ) -> candle_core::Result<Self> {
        let levels = self
            .levels
            .into_iter()
            .map(|level| {
                Ok(MeshLevel {
                    m2m: f(level.m2m)?,
                    ..level
                })
            })
            .collect::<candle_core::Result<_>>()?;
        let up = self.up.into_iter().map(&f).collect::<candle_core::Result<_>>()?;
        let down = self.down.into_iter().map(&f).collect::<candle_core::Result<_>>()?;
        Ok(Self { levels, up, down })
    }
}

/// Grid node count as one past the largest g2m sender.
fn infer_grid_nodes(g2m_index: &Tensor) -> Result<usize, ConfigError> {
    if g2m_index.rank() != 2 || g2m_index.dim(0)? != 2 {
        return Err(ConfigError::EdgeIndexShape {
            edges: "g2m".to_string(),
            shape: g2m_index.dims().to_vec(),
        });
    }
    if g2m_index.dim(1)? == 0 {
        return Err(ConfigError::EmptyEdges {
            edges: "g2m",
            what: "grid node count",
        });
    }
    let senders = g2m_index.to_dtype(DType::U32)?.get(0)?;
    Ok(senders.max(0)?.to_scalar::<u32>()? as usize + 1)
}

fn check_endpoints(set: &EdgeSet, senders: usize, receivers: usize) -> Result<(), ConfigError> {
    let index = set.index();
    if index.num_senders() != senders {
        return Err(ConfigError::DimMismatch {
            what: format!("{} sender count", set.name()),
            expected: senders,
            actual: index.num_senders(),
        });
    }
    if index.num_receivers() != receivers {
        return Err(ConfigError::DimMismatch {
            what: format!("{} receiver count", set.name()),
            expected: receivers,
            actual: index.num_receivers(),
        });
    }
    Ok(())
}

// ── GraphTopology ───────────────────────────────────────────────────────────

/// Everything stored in `graph.safetensors`.
#[derive(Debug, Clone)]
pub struct GraphTopology {
    pub num_grid_nodes: usize,
    pub g2m: EdgeSet,
    pub m2g: EdgeSet,
    pub mesh: MeshGraph,
}

impl GraphTopology {
    /// Load from a safetensors file. When `num_grid_nodes` is `None` it is
    /// inferred from the largest grid index.
    pub fn load(path: &Path, num_grid_nodes: Option<usize>) -> Result<Self, ConfigError> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let mut take = |name: String| {
            tensors
                .remove(&name)
                .ok_or(ConfigError::MissingTensor { name })
        };

        let mut mesh_features = Vec::new();
        let mut m2m_index = Vec::new();
        let mut m2m_features = Vec::new();
        let mut l = 0;
        while let Ok(features) = take(format!("mesh_features.{l}")) {
            mesh_features.push(features);
            l += 1;
        }
        let n_levels = mesh_features.len();
        if n_levels == 0 {
            return Err(ConfigError::MissingTensor {
                name: "mesh_features.0".to_string(),
            });
        }
        let mut l = 0;
        while let Ok(features) = take(format!("m2m_features.{l}")) {
            m2m_features.push(features);
            m2m_index.push(take(format!("m2m_edge_index.{l}"))?);
            l += 1;
        }
        if m2m_features.len() != n_levels {
            return Err(ConfigError::LevelCountMismatch {
                what: "m2m_features",
                expected: n_levels,
                actual: m2m_features.len(),
            });
        }

        let level_sizes: Vec<usize> = mesh_features
            .iter()
            .map(|f| f.dim(0))
            .collect::<candle_core::Result<_>>()?;

        let g2m_index = take("g2m_edge_index".to_string())?;
        let num_grid_nodes = match num_grid_nodes {
            Some(n) => n,
            None => infer_grid_nodes(&g2m_index)?,
        };
        let mesh0 = level_sizes[0];
        let g2m = EdgeSet::new(
            "g2m",
            EdgeIndex::from_tensor("g2m", &g2m_index, num_grid_nodes, mesh0)?,
            take("g2m_features".to_string())?,
        )?;
        let m2g = EdgeSet::new(
            "m2g",
            EdgeIndex::from_tensor(
                "m2g",
                &take("m2g_edge_index".to_string())?,
                mesh0,
                num_grid_nodes,
            )?,
            take("m2g_features".to_string())?,
        )?;

        let mut levels = Vec::with_capacity(n_levels);
        for (l, ((static_features, index), features)) in mesh_features
            .into_iter()
            .zip(m2m_index)
            .zip(m2m_features)
            .enumerate()
        {
            let name = format!("m2m.{l}");
            let n = level_sizes[l];
            let index = EdgeIndex::from_tensor(&name, &index, n, n)?;
            levels.push(MeshLevel::new(
                &name,
                static_features,
                EdgeSet::new(&name, index, features)?,
            )?);
        }

        let mut up = Vec::with_capacity(n_levels - 1);
        let mut down = Vec::with_capacity(n_levels - 1);
        for l in 0..n_levels - 1 {
            let (lower, upper) = (level_sizes[l], level_sizes[l + 1]);
            let name = format!("mesh_up.{l}");
            let index = take(format!("mesh_up_edge_index.{l}"))?;
            up.push(EdgeSet::new(
                &name,
                EdgeIndex::from_tensor(&name, &index, lower, upper)?,
                take(format!("mesh_up_features.{l}"))?,
            )?);
            let name = format!("mesh_down.{l}");
            let index = take(format!("mesh_down_edge_index.{l}"))?;
            down.push(EdgeSet::new(
                &name,
                EdgeIndex::from_tensor(&name, &index, upper, lower)?,
                take(format!("mesh_down_features.{l}"))?,
            )?);
        }

        Ok(Self {
            num_grid_nodes,
            g2m,
            m2g,
            mesh: MeshGraph::new(levels, up, down)?,
        })
    }

    /// Write in the layout [`GraphTopology::load`] reads.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        let mut put_edges = |prefix: &str, suffix: &str, set: &EdgeSet| -> candle_core::Result<()> {
            tensors.insert(
                format!("{prefix}_edge_index{suffix}"),
                set.index().to_tensor(&dev)?,
            );
            tensors.insert(format!("{prefix}_features{suffix}"), set.features().clone());
            Ok(())
        };
        put_edges("g2m", "", &self.g2m)?;
        put_edges("m2g", "", &self.m2g)?;
        for (l, level) in self.mesh.levels().iter().enumerate() {
            put_edges("m2m", &format!(".{l}"), &level.m2m)?;
        }
        for (l, set) in self.mesh.up().iter().enumerate() {
            put_edges("mesh_up", &format!(".{l}"), set)?;
        }
        for (l, set) in self.mesh.down().iter().enumerate() {
            put_edges("mesh_down", &format!(".{l}"), set)?;
        }
        for (l, level) in self.mesh.levels().iter().enumerate() {
            tensors.insert(format!("mesh_features.{l}"), level.static_features.clone());
        }
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Divide every edge feature by the longest same-level mesh edge.
    pub fn normalize_edge_lengths(self) -> candle_core::Result<Self> {
        let longest = self.mesh.longest_edge()?;
        if longest <= 0.0 {
            return Ok(self);
        }
        let scale = 1.0 / longest;
        Ok(Self {
            num_grid_nodes: self.num_grid_nodes,
            g2m: self.g2m.scaled(scale)?,
            m2g: self.m2g.scaled(scale)?,
            mesh: self.mesh.map_edges(|set| set.scaled(scale))?,
        })
    }

    fn to_device(self, device: &Device) -> candle_core::Result<Self> {
        let mesh = self.mesh.map_edges(|set| set.to_device(device))?;
        let levels = mesh
            .levels
            .into_iter()
            .map(|level| {
                Ok(MeshLevel {
                    static_features: level.static_features.to_device(device)?,
                    ..level
                })
            })
            .collect::<candle_core::Result<_>>()?;
        Ok(Self {
            num_grid_nodes: self.num_grid_nodes,
            g2m: self.g2m.to_device(device)?,
            m2g: self.m2g.to_device(device)?,
            mesh: MeshGraph {
                levels,
                up: mesh.up,
                down: mesh.down,
            },
        })
    }
}

// ── GraphData ───────────────────────────────────────────────────────────────

/// Immutable graph data owned by a model: topology plus the grid-side
/// statics that come from the dataset.
#[derive(Debug, Clone)]
pub struct GraphData {
    /// (N_grid, d_grid_static).
    pub grid_static_features: Tensor,
    pub g2m: EdgeSet,
    pub m2g: EdgeSet,
    pub mesh: MeshGraph,
    /// Mean of one-step state differences, (d_state,).
    pub step_diff_mean: Tensor,
    /// Std of one-step state differences, (d_state,).
    pub step_diff_std: Tensor,
}

impl GraphData {
    pub fn new(topology: GraphTopology, info: &DatasetInfo, device: &Device) -> Result<Self, ConfigError> {
        let (n_grid, _) = info.grid_static_features.dims2()?;
        if n_grid != topology.num_grid_nodes {
            return Err(ConfigError::DimMismatch {
                what: "grid node count of graph vs dataset".to_string(),
                expected: n_grid,
                actual: topology.num_grid_nodes,
            });
        }
        let topology = topology.to_device(device)?;
        Ok(Self {
            grid_static_features: info.grid_static_features.to_device(device)?,
            g2m: topology.g2m,
            m2g: topology.m2g,
            mesh: topology.mesh,
            step_diff_mean: info.step_diff_mean.to_device(device)?,
            step_diff_std: info.step_diff_std.to_device(device)?,
        })
    }

    pub fn num_grid_nodes(&self) -> usize {
        self.g2m.index().num_senders()
    }

    pub fn is_hierarchical(&self) -> bool {
        self.mesh.is_hierarchical()
    }
}

/// Load `graph_dir/graph.safetensors`, normalise edge lengths and attach the
/// dataset statics. Returns the hierarchical flag alongside the data.
pub fn load_graph(
    graph_dir: &Path,
    info: &DatasetInfo,
    device: &Device,
) -> Result<(bool, GraphData), ConfigError> {
    let path = graph_dir.join(GRAPH_FILE);
    if !path.exists() {
        return Err(ConfigError::Io {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "graph file not found"),
        });
    }
    let (n_grid, _) = info.grid_static_features.dims2()?;
    let topology = GraphTopology::load(&path, Some(n_grid))?.normalize_edge_lengths()?;
    let graph = GraphData::new(topology, info, device)?;
    let hierarchical = graph.is_hierarchical();
    tracing::info!(
        graph = %graph_dir.display(),
        hierarchical,
        levels = graph.mesh.num_levels(),
        "Loaded graph"
    );
    Ok((hierarchical, graph))
}

// ── Tests ───────────────────────────────────────────────────────────────────
