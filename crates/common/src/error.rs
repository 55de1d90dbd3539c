//! Configuration errors.
//!
//! Everything in here is fatal at construction time: a model or graph that
//! fails one of these checks is never built.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown model `{name}` (known models: {})", .known.join(", "))]
    UnknownModel {
        name: String,
        known: Vec<&'static str>,
    },

    #[error("dataset `{name}` not found in registry (available datasets: {})", .available.join(", "))]
    UnknownDataset { name: String, available: Vec<String> },

    #[error("unknown {kind} `{value}`")]
    UnknownOption { kind: &'static str, value: String },

    #[error("{edges}: edge index holds {index_edges} edges but features hold {feature_edges}")]
    EdgeCountMismatch {
        edges: String,
        index_edges: usize,
        feature_edges: usize,
    },

    #[error("{edges}: edge index must have shape (2, M), got {shape:?}")]
    EdgeIndexShape { edges: String, shape: Vec<usize> },

    #[error("{edges}: {row} index {index} out of range for {bound} nodes")]
    EdgeIndexOutOfRange {
        edges: String,
        row: &'static str,
        index: u32,
        bound: usize,
    },

    #[error("inconsistent number of levels: {what} has {actual}, expected {expected}")]
    LevelCountMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("model `{model}` needs a {required} mesh graph")]
    HierarchyMismatch {
        model: &'static str,
        required: &'static str,
    },

    #[error("{what}: chunk sizes sum to {actual}, expected {expected}")]
    ChunkSizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{edges} has no edges, cannot infer the {what}")]
    EmptyEdges {
        edges: &'static str,
        what: &'static str,
    },

    #[error("graph tensor `{name}` is missing")]
    MissingTensor { name: String },

    #[error("{what}: dimension {actual} does not match {expected}")]
    DimMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_lists_known_names() {
        let err = ConfigError::UnknownModel {
            name: "transformer".into(),
            known: vec!["graph_lam", "hi_lam"],
        };
        let msg = err.to_string();
        assert!(msg.contains("transformer"));
        assert!(msg.contains("graph_lam, hi_lam"));
    }

    #[test]
    fn hierarchy_mismatch_message() {
        let err = ConfigError::HierarchyMismatch {
            model: "graph_lam",
            required: "non-hierarchical",
        };
        assert!(err.to_string().contains("non-hierarchical"));
    }
}
