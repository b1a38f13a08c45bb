//! Temporal max pooling.

use candle_core::Tensor;

use super::{mask_as, resample_mask};
use crate::{Error, Result};

/// Max pooling over the last axis of `[B, C, T]`.
///
/// Edge padding replicates the border value. Since `padding < kernel_size`,
/// every padded window also covers that border element, which matches
/// padding with `-inf`.
pub fn max_pool1d(x: &Tensor, kernel_size: usize, stride: usize, padding: usize) -> Result<Tensor> {
    if padding >= kernel_size {
        return Err(Error::Config(format!(
            "pool padding {padding} must be smaller than kernel {kernel_size}"
        )));
    }
    let x = if padding > 0 {
        x.pad_with_same(2, padding, padding)?
    } else {
        x.clone()
    };
    let pooled = x
        .unsqueeze(2)?
        .max_pool2d_with_stride((1, kernel_size), (1, stride))?
        .squeeze(2)?;
    Ok(pooled)
}

/// Parameter-free downsampling: max pooling with a co-resampled mask.
#[derive(Debug, Clone, Copy)]
pub struct TemporalMaxer {
    kernel_size: usize,
    stride: usize,
    padding: usize,
}

impl TemporalMaxer {
    pub fn new(kernel_size: usize, stride: usize, padding: usize) -> Result<Self> {
        if stride == 0 || kernel_size == 0 || padding >= kernel_size {
            return Err(Error::Config(format!(
                "invalid temporal maxer: kernel {kernel_size}, stride {stride}, padding {padding}"
            )));
        }
        Ok(Self {
            kernel_size,
            stride,
            padding,
        })
    }

    /// Forward pass. The output has `ceil(T / stride)` steps when
    /// `padding == kernel_size / 2`.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let out = max_pool1d(x, self.kernel_size, self.stride, self.padding)?;
        let out_mask = resample_mask(mask, out.dim(2)?)?;
        let out = out.broadcast_mul(&mask_as(&out_mask, &out)?)?;
        Ok((out, out_mask))
    }
}
