//! Residual convolution block.
//!
//! ```text
//! x ─→ MaskedConv(C → 2C, k, stride s) → ReLU → MaskedConv(2C → C, k) ─┐
//!  └─→ identity, or MaskedConv(C → C, 1, stride s) when s > 1 ─────────┴→ + → ReLU
//! ```

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::masked_conv::{MaskedConv1d, MaskedConvConfig};
use super::BiasParams;
use crate::{Error, Result};

const EXPANSION: usize = 2;

#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv1: MaskedConv1d,
    conv2: MaskedConv1d,
    downsample: Option<MaskedConv1d>,
}

impl ConvBlock {
    pub fn new(channels: usize, kernel_size: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        if kernel_size % 2 == 0 || kernel_size < 3 {
            return Err(Error::Config(format!(
                "conv block kernel must be odd and >= 3, got {kernel_size}"
            )));
        }
        let width = channels * EXPANSION;
        let padding = kernel_size / 2;
        let conv1 = MaskedConv1d::new(
            channels,
            width,
            kernel_size,
            MaskedConvConfig {
                stride,
                padding,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let conv2 = MaskedConv1d::new(
            width,
            channels,
            kernel_size,
            MaskedConvConfig {
                padding,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        let downsample = if stride > 1 {
            Some(MaskedConv1d::new(
                channels,
                channels,
                1,
                MaskedConvConfig {
                    stride,
                    ..Default::default()
                },
                vb.pp("downsample"),
            )?)
        } else {
            None
        };
        Ok(Self {
            conv1,
            conv2,
            downsample,
        })
    }

    /// Forward pass: `([B, C, T], [B, 1, T])` → `([B, C, T / s], [B, 1, T / s])`.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (out, out_mask) = self.conv1.forward(x, mask)?;
        let (out, out_mask) = self.conv2.forward(&out.relu()?, &out_mask)?;
        let identity = match &self.downsample {
            Some(conv) => conv.forward(x, mask)?.0,
            None => x.clone(),
        };
        Ok(((out + identity)?.relu()?, out_mask))
    }
}

impl BiasParams for ConvBlock {
    fn bias_params(&self) -> Vec<&Tensor> {
        let mut params = self.conv1.bias_params();
        params.extend(self.conv2.bias_params());
        if let Some(conv) = &self.downsample {
            params.extend(conv.bias_params());
        }
        params
    }
}
