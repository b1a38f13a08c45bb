//! Pre-norm transformer block with optional temporal downsampling.
//!
//! ```text
//! x [B, C, T]
//!   → LN → MaskedSelfAttention(stride s)             [B, C, T / s]
//!   → + MaxPool(x) (skip path, identity if s == 1)
//!   → + MLP(LN(·)): Conv1x1(C → 4C) → GELU → Conv1x1(4C → C)
//! ```
//!
//! Both residual branches pass through [`PathDrop`] (stochastic depth).

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::attention::{downsample_kernel, pointwise, AttentionConfig, MaskedSelfAttention};
use super::drop_path::PathDrop;
use super::norm::ChannelLayerNorm;
use super::pooling::max_pool1d;
use super::{mask_as, BiasParams};
use crate::Result;

/// Hyper-parameters of a [`TransformerBlock`].
#[derive(Debug, Clone, Copy)]
pub struct TransformerBlockConfig {
    pub n_head: usize,
    /// `(query stride, key/value stride)`.
    pub ds_strides: (usize, usize),
    pub window: Option<usize>,
    pub use_rel_pe: bool,
    pub attn_pdrop: f64,
    pub proj_pdrop: f64,
    pub path_pdrop: f64,
}

impl TransformerBlockConfig {
    pub fn new(n_head: usize) -> Self {
        Self {
            n_head,
            ds_strides: (1, 1),
            window: None,
            use_rel_pe: false,
            attn_pdrop: 0.0,
            proj_pdrop: 0.0,
            path_pdrop: 0.0,
        }
    }
}

/// Two-layer pointwise MLP: `C → hidden → C` with GELU and dropout.
#[derive(Debug, Clone)]
pub(crate) struct PointwiseMlp {
    fc1: candle_nn::Conv1d,
    fc2: candle_nn::Conv1d,
    drop: candle_nn::Dropout,
}

impl PointwiseMlp {
    pub(crate) fn new(channels: usize, hidden: usize, pdrop: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: pointwise(channels, hidden, vb.pp("0"))?,
            fc2: pointwise(hidden, channels, vb.pp("3"))?,
            drop: candle_nn::Dropout::new(pdrop as f32),
        })
    }

    pub(crate) fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.fc1.forward(&x.contiguous()?)?.gelu_erf()?;
        let h = self.drop.forward(&h, train)?;
        let h = self.fc2.forward(&h)?;
        Ok(self.drop.forward(&h, train)?)
    }

    pub(crate) fn biases(&self) -> Vec<&Tensor> {
        [&self.fc1, &self.fc2]
            .into_iter()
            .filter_map(|conv| conv.bias())
            .collect()
    }
}

/// Transformer block over masked `[B, C, T]` sequences.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    ln1: ChannelLayerNorm,
    ln2: ChannelLayerNorm,
    attn: MaskedSelfAttention,
    mlp: PointwiseMlp,
    drop_path_attn: PathDrop,
    drop_path_mlp: PathDrop,
    /// Query stride; the skip path is max-pooled by the same factor.
    skip_stride: usize,
}

impl TransformerBlock {
    pub fn new(channels: usize, cfg: TransformerBlockConfig, vb: VarBuilder) -> Result<Self> {
        let attn_cfg = AttentionConfig {
            n_head: cfg.n_head,
            q_stride: cfg.ds_strides.0,
            kv_stride: cfg.ds_strides.1,
            window: cfg.window,
            use_rel_pe: cfg.use_rel_pe,
            attn_pdrop: cfg.attn_pdrop,
            proj_pdrop: cfg.proj_pdrop,
        };
        Ok(Self {
            ln1: ChannelLayerNorm::new(channels, vb.pp("ln1"))?,
            ln2: ChannelLayerNorm::new(channels, vb.pp("ln2"))?,
            attn: MaskedSelfAttention::new(channels, attn_cfg, vb.pp("attn"))?,
            mlp: PointwiseMlp::new(channels, 4 * channels, cfg.proj_pdrop, vb.pp("mlp"))?,
            drop_path_attn: PathDrop::new(channels, cfg.path_pdrop, vb.pp("drop_path_attn"))?,
            drop_path_mlp: PathDrop::new(channels, cfg.path_pdrop, vb.pp("drop_path_mlp"))?,
            skip_stride: cfg.ds_strides.0,
        })
    }

    fn skip(&self, x: &Tensor) -> Result<Tensor> {
        if self.skip_stride > 1 {
            let kernel = downsample_kernel(self.skip_stride);
            max_pool1d(x, kernel, self.skip_stride, kernel / 2)
        } else {
            Ok(x.clone())
        }
    }

    /// Forward pass: `([B, C, T], [B, 1, T])` → `([B, C, T / s], [B, 1, T / s])`.
    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (out, out_mask) = self.attn.forward(&self.ln1.forward(x)?, mask, train)?;
        let mask_f = mask_as(&out_mask, &out)?;
        let skip = self.skip(x)?.broadcast_mul(&mask_f)?;
        let out = (skip + self.drop_path_attn.forward(&out, train)?)?;

        let mlp = self.mlp.forward(&self.ln2.forward(&out)?, train)?;
        let mlp = mlp.broadcast_mul(&mask_f)?;
        let out = (&out + self.drop_path_mlp.forward(&mlp, train)?)?;
        Ok((out, out_mask))
    }
}

impl BiasParams for TransformerBlock {
    fn bias_params(&self) -> Vec<&Tensor> {
        let mut params = self.attn.bias_params();
        params.extend(self.mlp.biases());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn plain_block_keeps_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let block = TransformerBlock::new(16, TransformerBlockConfig::new(4), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 16, 20), &dev).unwrap();
        let mask = Tensor::ones((2, 1, 20), DType::U8, &dev).unwrap();
        let (out, out_mask) = block.forward(&x, &mask, false).unwrap();
        assert_eq!(out.dims(), &[2, 16, 20]);
        assert_eq!(out_mask.dims(), &[2, 1, 20]);
    }

    #[test]
    fn strided_block_with_drop_path_trains() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = TransformerBlockConfig {
            ds_strides: (2, 2),
            window: Some(5),
            use_rel_pe: true,
            attn_pdrop: 0.1,
            proj_pdrop: 0.1,
            path_pdrop: 0.1,
            ..TransformerBlockConfig::new(2)
        };
        let block = TransformerBlock::new(8, cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (3, 8, 16), &dev).unwrap();
        let mask = Tensor::ones((3, 1, 16), DType::U8, &dev).unwrap();
        let (out, out_mask) = block.forward(&x, &mask, true).unwrap();
        assert_eq!(out.dims(), &[3, 8, 8]);
        assert_eq!(out_mask.dims(), &[3, 1, 8]);
    }

    #[test]
    fn lists_every_bias() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let block = TransformerBlock::new(8, TransformerBlockConfig::new(2), vb).unwrap();
        // q/k/v/proj pointwise convs + two MLP convs; depthwise convs have none.
        assert_eq!(block.bias_params().len(), 6);
    }
}
