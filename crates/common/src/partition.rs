//! Ordered size partitions used to join per-level tensors along one axis
//! and split them back.

use candle_core::{bail, Result, Tensor};

/// Sizes of consecutive chunks along one tensor axis (e.g. nodes per mesh
/// level, or edges per edge family).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelPartition {
    sizes: Vec<usize>,
}

impl LevelPartition {
    pub fn new(sizes: Vec<usize>) -> Self {
        Self { sizes }
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn total(&self) -> usize {
        self.sizes.iter().sum()
    }

    /// Start offset of every chunk.
    pub fn offsets(&self) -> Vec<usize> {
        self.sizes
            .iter()
            .scan(0usize, |acc, &size| {
                let start = *acc;
                *acc += size;
                Some(start)
            })
            .collect()
    }

    /// Concatenate one tensor per chunk along `dim`, checking each size.
    pub fn concat(&self, parts: &[Tensor], dim: usize) -> Result<Tensor> {
        if parts.len() != self.sizes.len() {
            bail!(
                "partition has {} chunks, got {} tensors",
                self.sizes.len(),
                parts.len()
            );
        }
        for (i, (part, &size)) in parts.iter().zip(&self.sizes).enumerate() {
            let actual = part.dim(dim)?;
            if actual != size {
                bail!("chunk {i}: expected {size} entries along dim {dim}, got {actual}");
            }
        }
        Tensor::cat(parts, dim)
    }

    /// Split `x` along `dim` into one contiguous tensor per chunk, in order.
    pub fn split(&self, x: &Tensor, dim: usize) -> Result<Vec<Tensor>> {
        let actual = x.dim(dim)?;
        if actual != self.total() {
            bail!(
                "cannot split {actual} entries along dim {dim} into chunks totalling {}",
                self.total()
            );
        }
        self.offsets()
            .into_iter()
            .zip(&self.sizes)
            .map(|(start, &size)| x.narrow(dim, start, size)?.contiguous())
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn offsets_are_prefix_sums() {
        let p = LevelPartition::new(vec![4, 2, 3]);
        assert_eq!(p.offsets(), vec![0, 4, 6]);
        assert_eq!(p.total(), 9);
    }

    #[test]
    fn concat_then_split_reproduces_parts() {
        let dev = Device::Cpu;
        let p = LevelPartition::new(vec![5, 3, 1]);
        let parts: Vec<Tensor> = p
            .sizes()
            .iter()
            .map(|&n| Tensor::randn(0f32, 1.0, (2, n, 4), &dev).unwrap())
            .collect();

        let joined = p.concat(&parts, 1).unwrap();
        assert_eq!(joined.dims(), &[2, 9, 4]);

        let back = p.split(&joined, 1).unwrap();
        assert_eq!(back.len(), 3);
        for (orig, split) in parts.iter().zip(&back) {
            assert_eq!(orig.dims(), split.dims());
            // gather kernels reject strided views
            assert!(split.is_contiguous());
            split.index_select(&Tensor::new(&[0u32], &dev).unwrap(), 1).unwrap();
            let a: Vec<f32> = orig.flatten_all().unwrap().to_vec1().unwrap();
            let b: Vec<f32> = split.flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn split_rejects_wrong_total() {
        let p = LevelPartition::new(vec![2, 2]);
        let x = Tensor::zeros((1, 5, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(p.split(&x, 1).is_err());
    }

    #[test]
    fn concat_rejects_wrong_chunk_size() {
        let dev = Device::Cpu;
        let p = LevelPartition::new(vec![2, 2]);
        let a = Tensor::zeros((1, 2, 3), DType::F32, &dev).unwrap();
        let b = Tensor::zeros((1, 3, 3), DType::F32, &dev).unwrap();
        assert!(p.concat(&[a, b], 1).is_err());
    }
}
