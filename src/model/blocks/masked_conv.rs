//! 1-D convolution carrying a validity mask.
//!
//! ```text
//! x [B, C_in, T], mask [B, 1, T]
//!   → Conv1d(k, stride, padding, groups)      [B, C_out, T / stride]
//!   → mask resampled (nearest) to T / stride
//!   → out * mask
//! ```

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::{mask_as, resample_mask, BiasParams};
use crate::{Error, Result};

/// Convolution hyper-parameters beyond the channel counts.
#[derive(Debug, Clone, Copy)]
pub struct MaskedConvConfig {
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
    pub bias: bool,
}

impl Default for MaskedConvConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            groups: 1,
            bias: true,
        }
    }
}

/// Masked 1-D convolution.
#[derive(Debug, Clone)]
pub struct MaskedConv1d {
    conv: candle_nn::Conv1d,
    stride: usize,
}

impl MaskedConv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        cfg: MaskedConvConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if cfg.stride == 0 {
            return Err(Error::Config("conv stride must be >= 1".to_string()));
        }
        let conv_cfg = candle_nn::Conv1dConfig {
            padding: cfg.padding,
            stride: cfg.stride,
            dilation: 1,
            groups: cfg.groups,
            ..Default::default()
        };
        let conv = if cfg.bias {
            candle_nn::conv1d(in_channels, out_channels, kernel_size, conv_cfg, vb)?
        } else {
            candle_nn::conv1d_no_bias(in_channels, out_channels, kernel_size, conv_cfg, vb)?
        };
        Ok(Self {
            conv,
            stride: cfg.stride,
        })
    }

    /// Same-length convolution: stride 1, padding `kernel_size / 2`.
    pub fn same(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = MaskedConvConfig {
            padding: kernel_size / 2,
            bias,
            ..Default::default()
        };
        Self::new(in_channels, out_channels, kernel_size, cfg, vb)
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Forward pass. `T` must be divisible by the stride.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let t = x.dim(2)?;
        if t % self.stride != 0 {
            return Err(Error::Shape(format!(
                "sequence length {t} is not divisible by conv stride {}",
                self.stride
            )));
        }
        let out = self.conv.forward(&x.contiguous()?)?;
        let out_mask = resample_mask(mask, t / self.stride)?;
        let out = out.broadcast_mul(&mask_as(&out_mask, &out)?)?;
        Ok((out, out_mask))
    }
}

impl BiasParams for MaskedConv1d {
    fn bias_params(&self) -> Vec<&Tensor> {
        self.conv.bias().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn same_conv_keeps_length_and_masks_padding() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let conv = MaskedConv1d::same(4, 6, 3, true, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 4, 10), &dev).unwrap();
        let mut m = vec![1u8; 20];
        m[7..10].iter_mut().for_each(|v| *v = 0);
        let mask = Tensor::from_vec(m, (2, 1, 10), &dev).unwrap();

        let (out, out_mask) = conv.forward(&x, &mask).unwrap();
        assert_eq!(out.dims(), &[2, 6, 10]);
        assert_eq!(out_mask.dims(), &[2, 1, 10]);
        let tail: f32 = out
            .narrow(0, 0, 1)
            .unwrap()
            .narrow(2, 7, 3)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(tail, 0.0);
    }

    #[test]
    fn strided_conv_halves_length() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = MaskedConvConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };
        let conv = MaskedConv1d::new(4, 4, 3, cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, 16), &dev).unwrap();
        let mask = Tensor::ones((1, 1, 16), DType::U8, &dev).unwrap();
        let (out, out_mask) = conv.forward(&x, &mask).unwrap();
        assert_eq!(out.dims(), &[1, 4, 8]);
        assert_eq!(out_mask.dims(), &[1, 1, 8]);
    }

    #[test]
    fn indivisible_length_is_rejected() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = MaskedConvConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        };
        let conv = MaskedConv1d::new(4, 4, 3, cfg, vb).unwrap();
        let x = Tensor::zeros((1, 4, 15), DType::F32, &dev).unwrap();
        let mask = Tensor::ones((1, 1, 15), DType::U8, &dev).unwrap();
        assert!(matches!(conv.forward(&x, &mask), Err(Error::Shape(_))));
    }

    #[test]
    fn no_bias_conv_lists_no_bias() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let conv = MaskedConv1d::same(4, 4, 3, false, vb).unwrap();
        assert!(conv.bias_params().is_empty());
    }
}
