//! Masked temporal building blocks.
//!
//! Every block works on `(features [B, C, T], mask [B, 1, T])` pairs and
//! returns a fresh pair whose mask has the same length as the features.
//! Masks are `u8` tensors holding 0 (padding) or 1 (valid).
//!
//! - [`masked_conv`] — strided 1-D convolution that co-updates the mask
//! - [`norm`] — channel-axis LayerNorm
//! - [`attention`] — masked self-attention (optionally local) and cross-attention
//! - [`transformer_block`] — pre-norm attention + MLP with pooled skip path
//! - [`conv_block`] — residual conv-ReLU-conv block
//! - [`aggregation`] — cross-attention fusion of two streams
//! - [`pooling`] — temporal max pooling
//! - [`drop_path`] — stochastic depth with layer scale
//! - [`position`] — sinusoidal tables and linear resampling

pub mod aggregation;
pub mod attention;
pub mod conv_block;
pub mod drop_path;
pub mod masked_conv;
pub mod norm;
pub mod pooling;
pub mod position;
pub mod transformer_block;

use candle_core::Tensor;

use crate::Result;

pub use aggregation::AggregationBlock;
pub use conv_block::ConvBlock;
pub use masked_conv::MaskedConv1d;
pub use norm::ChannelLayerNorm;
pub use pooling::TemporalMaxer;
pub use transformer_block::TransformerBlock;

/// Components owning linear/convolution bias terms.
///
/// Implementors list their biases explicitly so initialization never has to
/// walk an object graph.
pub trait BiasParams {
    /// Bias tensors of every linear/convolution layer in this component.
    fn bias_params(&self) -> Vec<&Tensor>;
}

/// Overwrite every listed bias with zeros, in place.
///
/// The tensors share storage with the variables they were created from, so
/// the update is visible through the owning `VarMap`.
pub fn zero_biases(params: &[&Tensor]) -> Result<()> {
    for bias in params {
        let zeros = bias.zeros_like()?;
        bias.slice_set(&zeros, 0, 0)?;
    }
    Ok(())
}

/// Convert a `u8` validity mask to the dtype of `like`, for multiplication.
pub(crate) fn mask_as(mask: &Tensor, like: &Tensor) -> Result<Tensor> {
    Ok(mask.to_dtype(like.dtype())?)
}

/// Resample a `[B, 1, T]` mask to `len` steps with nearest-neighbour lookup.
pub(crate) fn resample_mask(mask: &Tensor, len: usize) -> Result<Tensor> {
    let t = mask.dim(2)?;
    if t == len {
        return Ok(mask.clone());
    }
    let index: Vec<u32> = (0..len).map(|i| ((i * t) / len) as u32).collect();
    let index = Tensor::from_vec(index, len, mask.device())?;
    Ok(mask.index_select(&index, 2)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn resample_mask_picks_nearest() {
        let dev = Device::Cpu;
        let mask = Tensor::new(&[[[1u8, 1, 1, 1, 1, 0, 0, 0]]], &dev).unwrap();
        let down = resample_mask(&mask, 4).unwrap();
        let vals: Vec<u8> = down.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals, vec![1, 1, 1, 0]);
    }

    #[test]
    fn zero_biases_updates_in_place() {
        let dev = Device::Cpu;
        let bias = Tensor::ones(5, DType::F32, &dev).unwrap();
        zero_biases(&[&bias]).unwrap();
        let sum: f32 = bias.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }
}
