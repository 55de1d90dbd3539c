//! Model and training hyper-parameters.
//!
//! Serialised as JSON next to checkpoints so a run can be rebuilt exactly.
//! Every field has a default, so a minimal `{}` JSON produces the default
//! GraphLAM architecture.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ── Model selection ─────────────────────────────────────────────────────────

/// The closed set of model architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Flat mesh processor (GC-LAM / L1-LAM).
    GraphLam,
    /// Hierarchical mesh, sequential down/up sweeps.
    HiLam,
    /// Hierarchical mesh, all levels and edge families processed jointly.
    HiLamParallel,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [Self::GraphLam, Self::HiLam, Self::HiLamParallel];

    pub fn name(&self) -> &'static str {
        match self {
            Self::GraphLam => "graph_lam",
            Self::HiLam => "hi_lam",
            Self::HiLamParallel => "hi_lam_parallel",
        }
    }

    /// Whether the model needs a multi-level mesh graph.
    pub fn is_hierarchical(&self) -> bool {
        !matches!(self, Self::GraphLam)
    }
}

impl FromStr for ModelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| ConfigError::UnknownModel {
                name: s.to_string(),
                known: Self::ALL.iter().map(|k| k.name()).collect(),
            })
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Small option enums ──────────────────────────────────────────────────────

/// Reduction applied to incoming messages at each receiver node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Sum,
    Mean,
}

impl FromStr for Aggregation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Self::Sum),
            "mean" => Ok(Self::Mean),
            _ => Err(ConfigError::UnknownOption {
                kind: "aggregation",
                value: s.to_string(),
            }),
        }
    }
}

/// Training loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    Mse,
    Mae,
}

impl FromStr for LossKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mse" => Ok(Self::Mse),
            "mae" => Ok(Self::Mae),
            _ => Err(ConfigError::UnknownOption {
                kind: "loss",
                value: s.to_string(),
            }),
        }
    }
}

/// Numerical precision of model parameters (`32`, `16` or `bf16`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    #[serde(rename = "32")]
    F32,
    #[serde(rename = "16")]
    F16,
    #[serde(rename = "bf16")]
    Bf16,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }
}

impl FromStr for Precision {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "32" => Ok(Self::F32),
            "16" => Ok(Self::F16),
            "bf16" => Ok(Self::Bf16),
            _ => Err(ConfigError::UnknownOption {
                kind: "precision",
                value: s.to_string(),
            }),
        }
    }
}

/// Data split used when evaluating instead of training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalSplit {
    Val,
    Test,
}

impl EvalSplit {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

impl FromStr for EvalSplit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "val" => Ok(Self::Val),
            "test" => Ok(Self::Test),
            _ => Err(ConfigError::UnknownOption {
                kind: "evaluation split",
                value: s.to_string(),
            }),
        }
    }
}

// ── GraphConfig ─────────────────────────────────────────────────────────────

/// Architecture of the graph model. Owned by the model, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_model")]
    pub model: ModelKind,
    /// Graph directory name under the graph root.
    #[serde(default = "default_graph_name")]
    pub name: String,
    /// Dimensionality of all hidden representations.
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    /// Number of hidden layers in every MLP.
    #[serde(default = "default_hidden_layers")]
    pub hidden_layers: usize,
    /// Number of GNN layers (or down/up sweeps) in the processor.
    #[serde(default = "default_processor_layers")]
    pub processor_layers: usize,
    /// Reduction used by the GraphLAM processor layers. Hierarchical
    /// processors always sum.
    #[serde(default)]
    pub mesh_aggr: Aggregation,
}

fn default_model() -> ModelKind {
    ModelKind::GraphLam
}
fn default_graph_name() -> String {
    "multiscale".to_string()
}
fn default_hidden_dim() -> usize {
    64
}
fn default_hidden_layers() -> usize {
    1
}
fn default_processor_layers() -> usize {
    4
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            name: default_graph_name(),
            hidden_dim: default_hidden_dim(),
            hidden_layers: default_hidden_layers(),
            processor_layers: default_processor_layers(),
            mesh_aggr: Aggregation::Sum,
        }
    }
}

impl GraphConfig {
    /// MLP layer widths for an embedder reading `input_dim` features:
    /// `[input_dim, hidden_dim, ..., hidden_dim]` with `hidden_layers + 1`
    /// hidden entries.
    pub fn mlp_blueprint(&self, input_dim: usize) -> Vec<usize> {
        let mut blueprint = Vec::with_capacity(self.hidden_layers + 2);
        blueprint.push(input_dim);
        blueprint.extend(std::iter::repeat(self.hidden_dim).take(self.hidden_layers + 1));
        blueprint
    }
}

// ── HyperParam ──────────────────────────────────────────────────────────────

/// Everything needed to rebuild a model: architecture plus optimisation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParam {
    /// Registry name of the dataset the model was trained on.
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default)]
    pub loss: LossKind,
}

fn default_dataset() -> String {
    "dummy".to_string()
}
fn default_lr() -> f64 {
    1e-3
}

impl Default for HyperParam {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            graph: GraphConfig::default(),
            lr: default_lr(),
            loss: LossKind::Mse,
        }
    }
}

impl HyperParam {
    /// Save to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let hp = serde_json::from_str(&json)?;
        Ok(hp)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_kind_parses_registry_names() {
        assert_eq!("graph_lam".parse::<ModelKind>().unwrap(), ModelKind::GraphLam);
        assert_eq!("hi_lam".parse::<ModelKind>().unwrap(), ModelKind::HiLam);
        assert_eq!(
            "hi_lam_parallel".parse::<ModelKind>().unwrap(),
            ModelKind::HiLamParallel
        );
        let err = "unet".parse::<ModelKind>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModel { .. }));
    }

    #[test]
    fn hyperparam_json_round_trip() {
        let hp = HyperParam {
            graph: GraphConfig {
                model: ModelKind::HiLamParallel,
                mesh_aggr: Aggregation::Mean,
                ..Default::default()
            },
            loss: LossKind::Mae,
            ..Default::default()
        };
        let json = serde_json::to_string(&hp).unwrap();
        assert!(json.contains("\"hi_lam_parallel\""));
        let loaded: HyperParam = serde_json::from_str(&json).unwrap();
        assert_eq!(hp, loaded);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let loaded: HyperParam = serde_json::from_str(r#"{"graph": {"hidden_dim": 32}}"#).unwrap();
        assert_eq!(loaded.graph.hidden_dim, 32);
        assert_eq!(loaded.graph.hidden_layers, 1);
        assert_eq!(loaded.graph.processor_layers, 4);
        assert_eq!(loaded.graph.model, ModelKind::GraphLam);
        assert_eq!(loaded.lr, 1e-3);
    }

    #[test]
    fn mlp_blueprint_widths() {
        let cfg = GraphConfig {
            hidden_dim: 8,
            hidden_layers: 2,
            ..Default::default()
        };
        assert_eq!(cfg.mlp_blueprint(5), vec![5, 8, 8, 8]);
    }

    #[test]
    fn precision_strings() {
        assert_eq!("bf16".parse::<Precision>().unwrap().dtype(), DType::BF16);
        assert_eq!("32".parse::<Precision>().unwrap(), Precision::F32);
        assert!("64".parse::<Precision>().is_err());
    }
}
