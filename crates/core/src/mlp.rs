//! MLP embedders.
//!
//! ```text
//! Linear → SiLU → Linear → SiLU → … → Linear [→ LayerNorm]
//! ```
//!
//! No activation after the last linear layer. [`SplitMlp`] applies an
//! independent [`Mlp`] to each chunk of one tensor axis, so edges or nodes of
//! different mesh levels get their own weights while living in one tensor.

use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};

use lam_common::LevelPartition;

const LAYER_NORM_EPS: f64 = 1e-5;

/// Dense MLP over the last axis.
pub struct Mlp {
    layers: Vec<Linear>,
    norm: Option<LayerNorm>,
}

impl Mlp {
    /// `blueprint` lists layer widths, input first. Weights live under
    /// `linear.{i}` and `norm`.
    pub fn new(blueprint: &[usize], layer_norm_out: bool, vb: VarBuilder) -> Result<Self> {
        if blueprint.len() < 2 {
            candle_core::bail!("mlp blueprint needs input and output widths, got {blueprint:?}");
        }
        let layers = blueprint
            .windows(2)
            .enumerate()
            .map(|(i, w)| linear(w[0], w[1], vb.pp(format!("linear.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = if layer_norm_out {
            let out = blueprint[blueprint.len() - 1];
            Some(layer_norm(out, LAYER_NORM_EPS, vb.pp("norm"))?)
        } else {
            None
        };
        Ok(Self { layers, norm })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut x = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i < last {
                x = candle_nn::ops::silu(&x)?;
            }
        }
        match &self.norm {
            Some(norm) => norm.forward(&x),
            None => Ok(x),
        }
    }
}

/// One [`Mlp`] per chunk of axis `dim`. Weights under `chunk.{k}`.
pub struct SplitMlp {
    chunks: Vec<Mlp>,
    partition: LevelPartition,
    dim: usize,
}

impl SplitMlp {
    pub fn new(
        blueprint: &[usize],
        layer_norm_out: bool,
        partition: LevelPartition,
        dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let chunks = (0..partition.len())
            .map(|k| Mlp::new(blueprint, layer_norm_out, vb.pp(format!("chunk.{k}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            chunks,
            partition,
            dim,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let parts = self.partition.split(x, self.dim)?;
        let outs = parts
            .iter()
            .zip(&self.chunks)
            .map(|(part, mlp)| mlp.forward(&part.contiguous()?))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&outs, self.dim)
    }
}

/// Either a single MLP or a chunked one, selected by the chunk layout.
pub enum ChunkedMlp {
    Single(Mlp),
    Split(SplitMlp),
}

impl ChunkedMlp {
    /// A single MLP when `partition` is `None` or has one chunk.
    pub fn new(
        blueprint: &[usize],
        layer_norm_out: bool,
        partition: Option<&LevelPartition>,
        dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        match partition {
            Some(p) if p.len() > 1 => Ok(Self::Split(SplitMlp::new(
                blueprint,
                layer_norm_out,
                p.clone(),
                dim,
                vb,
            )?)),
            _ => Ok(Self::Single(Mlp::new(blueprint, layer_norm_out, vb)?)),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Single(m) => m.forward(x),
            Self::Split(m) => m.forward(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn mlp_output_width_and_params() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mlp = Mlp::new(&[5, 8, 8], true, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 7, 5), &Device::Cpu).unwrap();
        assert_eq!(mlp.forward(&x).unwrap().dims(), &[2, 7, 8]);
        // 2 linears (weight + bias) + layer norm (weight + bias)
        assert_eq!(varmap.all_vars().len(), 6);
    }

    #[test]
    fn layer_norm_output_is_normalised() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mlp = Mlp::new(&[3, 16], true, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, 3), &Device::Cpu).unwrap();
        let y = mlp.forward(&x).unwrap();
        let mean: Vec<f32> = y.mean(2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(mean.iter().all(|m| m.abs() < 1e-4));
    }

    #[test]
    fn split_mlp_uses_separate_weights_per_chunk() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let p = LevelPartition::new(vec![3, 2]);
        let mlp = SplitMlp::new(&[4, 6], false, p, 1, vb).unwrap();
        // identical rows in both chunks map to different outputs
        let x = Tensor::ones((1, 5, 4), DType::F32, &Device::Cpu).unwrap();
        let y = mlp.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 5, 6]);
        let first: Vec<f32> = y.get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        let last: Vec<f32> = y.get(0).unwrap().get(4).unwrap().to_vec1().unwrap();
        assert_ne!(first, last);
        assert_eq!(varmap.all_vars().len(), 4);
    }

    #[test]
    fn blueprint_too_short() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(Mlp::new(&[4], false, vb).is_err());
    }
}
