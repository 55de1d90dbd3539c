//! Model errors.

use lam_common::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Fatal at construction time.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Input tensor with an unexpected shape at forward time.
    #[error("{stage}: expected shape {expected:?}, got {actual:?}")]
    Shape {
        stage: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Fail with [`ModelError::Shape`] unless `x` has exactly `expected` dims.
pub(crate) fn check_shape(stage: &'static str, x: &candle_core::Tensor, expected: &[usize]) -> Result<()> {
    if x.dims() != expected {
        return Err(ModelError::Shape {
            stage,
            expected: expected.to_vec(),
            actual: x.dims().to_vec(),
        });
    }
    Ok(())
}
