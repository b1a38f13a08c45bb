//! Absolute sinusoidal position tables.
//!
//! ```text
//! angle(p, j) = p / 10000^(2 * (j / 2) / d)
//! table[j, p] = sin(angle) for even j, cos(angle) for odd j
//! ```

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Sinusoidal table of shape `[1, d_hid, n_position]`.
pub fn sinusoid_table(n_position: usize, d_hid: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; d_hid * n_position];
    for j in 0..d_hid {
        let exponent = 2.0 * (j / 2) as f64 / d_hid as f64;
        let denom = 10000f64.powf(exponent);
        for p in 0..n_position {
            let angle = p as f64 / denom;
            data[j * n_position + p] = if j % 2 == 0 { angle.sin() } else { angle.cos() } as f32;
        }
    }
    Ok(Tensor::from_vec(data, (1, d_hid, n_position), device)?)
}

/// Linearly resample the last axis of `x` to `len` steps.
///
/// Half-pixel sampling (`align_corners = false`): output step `i` reads
/// source position `(i + 0.5) * in / len - 0.5`, clamped at the borders.
pub fn interpolate_linear(x: &Tensor, len: usize) -> Result<Tensor> {
    let rank = x.rank();
    if rank == 0 || len == 0 {
        return Err(Error::Shape(format!(
            "cannot resample a rank-{rank} tensor to length {len}"
        )));
    }
    let axis = rank - 1;
    let src_len = x.dim(axis)?;
    if src_len == len {
        return Ok(x.clone());
    }
    let scale = src_len as f64 / len as f64;
    let mut lo = Vec::with_capacity(len);
    let mut hi = Vec::with_capacity(len);
    let mut frac = Vec::with_capacity(len);
    for i in 0..len {
        let src = ((i as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(src_len - 1);
        let i1 = (i0 + 1).min(src_len - 1);
        lo.push(i0 as u32);
        hi.push(i1 as u32);
        frac.push((src - i0 as f64) as f32);
    }
    let device = x.device();
    let lo = Tensor::from_vec(lo, len, device)?;
    let hi = Tensor::from_vec(hi, len, device)?;
    let frac = Tensor::from_vec(frac, len, device)?.to_dtype(x.dtype())?;
    let left = x.index_select(&lo, axis)?;
    let right = x.index_select(&hi, axis)?;
    // left + (right - left) * frac
    let delta = (right - &left)?.broadcast_mul(&frac)?;
    Ok((left + delta)?)
}

/// Fixed absolute position embedding added under the validity mask.
#[derive(Debug, Clone)]
pub struct AbsolutePositionEmbedding {
    /// `[1, C, max_len]`, scaled by `1 / sqrt(C)`.
    table: Tensor,
    max_len: usize,
}

impl AbsolutePositionEmbedding {
    pub fn new(max_len: usize, channels: usize, dtype: DType, device: &Device) -> Result<Self> {
        let table = (sinusoid_table(max_len, channels, device)? / (channels as f64).sqrt())?;
        Ok(Self {
            table: table.to_dtype(dtype)?,
            max_len,
        })
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Table for a sequence of length `len`: `[1, C, len]`.
    ///
    /// Training never stretches the table and rejects `len > max_len`.
    /// Inference resamples it when `len >= max_len`.
    pub fn table_for(&self, len: usize, train: bool) -> Result<Tensor> {
        if train {
            if len > self.max_len {
                return Err(Error::SequenceTooLong {
                    len,
                    max_len: self.max_len,
                });
            }
            return Ok(self.table.narrow(2, 0, len)?);
        }
        if len >= self.max_len {
            tracing::debug!(len, max_len = self.max_len, "resampling position table");
            interpolate_linear(&self.table, len)
        } else {
            Ok(self.table.narrow(2, 0, len)?)
        }
    }

    /// `x + table[.., ..T] * mask`
    pub fn add_to(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let len = x.dim(2)?;
        let pe = self.table_for(len, train)?;
        let pe = pe.broadcast_mul(&mask.to_dtype(x.dtype())?)?;
        Ok(x.broadcast_add(&pe)?)
    }
}
