//! Stochastic depth with a learned per-channel layer scale.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use crate::{Error, Result};

/// Initial layer-scale value.
const INIT_SCALE: f64 = 1e-4;

/// Drop whole samples of `x` with probability `drop_prob`, rescaling survivors.
///
/// Identity outside training or when `drop_prob == 0`.
pub fn drop_path(x: &Tensor, drop_prob: f64, train: bool) -> Result<Tensor> {
    if !train || drop_prob == 0.0 {
        return Ok(x.clone());
    }
    if !(0.0..1.0).contains(&drop_prob) {
        return Err(Error::Config(format!(
            "drop path probability must be in [0, 1), got {drop_prob}"
        )));
    }
    let keep_prob = 1.0 - drop_prob;
    let mut shape = vec![1usize; x.rank()];
    shape[0] = x.dim(0)?;
    let keep = Tensor::rand(0f32, 1f32, shape, x.device())?
        .ge(drop_prob)?
        .to_dtype(x.dtype())?;
    let keep = (keep / keep_prob)?;
    Ok(x.broadcast_mul(&keep)?)
}

/// `drop_path(scale * x)` with `scale: [1, C, 1]`.
#[derive(Debug, Clone)]
pub struct AffineDropPath {
    scale: Tensor,
    drop_prob: f64,
}

impl AffineDropPath {
    pub fn new(channels: usize, drop_prob: f64, vb: VarBuilder) -> Result<Self> {
        let scale = vb.get_with_hints((1, channels, 1), "scale", Init::Const(INIT_SCALE))?;
        Ok(Self { scale, drop_prob })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let scaled = x.broadcast_mul(&self.scale.to_dtype(x.dtype())?)?;
        drop_path(&scaled, self.drop_prob, train)
    }
}

/// Residual branch wrapper: identity, or [`AffineDropPath`] when `path_pdrop > 0`.
#[derive(Debug, Clone)]
pub enum PathDrop {
    Identity,
    Affine(AffineDropPath),
}

impl PathDrop {
    pub fn new(channels: usize, drop_prob: f64, vb: VarBuilder) -> Result<Self> {
        if drop_prob > 0.0 {
            Ok(Self::Affine(AffineDropPath::new(channels, drop_prob, vb)?))
        } else {
            Ok(Self::Identity)
        }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Affine(layer) => layer.forward(x, train),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn inference_is_identity() {
        let x = Tensor::randn(0f32, 1.0, (3, 4, 5), &Device::Cpu).unwrap();
        let y = drop_path(&x, 0.5, false).unwrap();
        let diff: f32 = (x - y).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn training_drops_whole_samples() {
        let x = Tensor::ones((64, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let y = drop_path(&x, 0.5, true).unwrap();
        let per_sample: Vec<f32> = y.sum((1, 2)).unwrap().to_vec1().unwrap();
        // Every sample is either dropped or scaled by 1 / keep_prob.
        assert!(per_sample
            .iter()
            .all(|&s| s == 0.0 || (s - 12.0).abs() < 1e-5));
    }

    #[test]
    fn affine_scale_starts_small() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = AffineDropPath::new(4, 0.1, vb).unwrap();
        let x = Tensor::ones((1, 4, 2), DType::F32, &dev).unwrap();
        let y = layer.forward(&x, false).unwrap();
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| (v - 1e-4).abs() < 1e-9));
    }
}
