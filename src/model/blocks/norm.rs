//! LayerNorm over the channel axis of `[B, C, T]` tensors.

use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::Result;

const EPS: f64 = 1e-5;

/// Channel-first LayerNorm with elementwise affine.
///
/// Statistics are taken over `C` independently for every `(b, t)`, so the
/// layer never mixes time steps and padding stays local.
#[derive(Debug, Clone)]
pub struct ChannelLayerNorm {
    /// `[1, C, 1]`
    weight: Tensor,
    /// `[1, C, 1]`
    bias: Tensor,
    eps: f64,
}

impl ChannelLayerNorm {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((1, channels, 1), "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints((1, channels, 1), "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            eps: EPS,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mu = x.mean_keepdim(1)?;
        let centered = x.broadcast_sub(&mu)?;
        let sigma = centered.sqr()?.mean_keepdim(1)?;
        let normed = centered.broadcast_div(&(sigma + self.eps)?.sqrt()?)?;
        let out = normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?;
        Ok(out)
    }
}

/// Optional normalization: a real [`ChannelLayerNorm`] or a pass-through.
#[derive(Debug, Clone)]
pub enum MaybeNorm {
    Layer(ChannelLayerNorm),
    Identity,
}

impl MaybeNorm {
    pub fn new(enabled: bool, channels: usize, vb: VarBuilder) -> Result<Self> {
        if enabled {
            Ok(Self::Layer(ChannelLayerNorm::new(channels, vb)?))
        } else {
            Ok(Self::Identity)
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Layer(norm) => norm.forward(x),
            Self::Identity => Ok(x.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn normalizes_each_time_step() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let norm = ChannelLayerNorm::new(8, vb).unwrap();

        let x = (Tensor::randn(0f32, 3.0, (2, 8, 5), &dev).unwrap() + 4.0).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 8, 5]);

        let mean: Vec<f32> = y.mean(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(mean.iter().all(|m| m.abs() < 1e-4));
        let var: Vec<f32> = y
            .sqr()
            .unwrap()
            .mean(1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(var.iter().all(|v| (v - 1.0).abs() < 1e-3));
    }

    #[test]
    fn identity_passes_through() {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 3), &dev).unwrap();
        let y = MaybeNorm::Identity.forward(&x).unwrap();
        let diff: f32 = (x - y).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }
}
