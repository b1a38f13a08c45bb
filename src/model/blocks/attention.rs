//! Masked multi-head attention over `[B, C, T]` sequences.
//!
//! Two types:
//! - [`MaskedSelfAttention`] — self-attention whose query/key/value paths are
//!   depthwise masked convs, so the block can downsample (`stride > 1`).
//!   Optionally local (`|i - j| <= window / 2`) with a learned relative bias.
//! - [`MaskedCrossAttention`] — queries from one stream, keys/values from another.
//!
//! Keys at padded positions never receive weight. Padded queries are zeroed
//! on the way out.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Init, VarBuilder};

use super::masked_conv::{MaskedConv1d, MaskedConvConfig};
use super::norm::ChannelLayerNorm;
use super::{mask_as, BiasParams};
use crate::Result;

/// Most negative finite value of `dtype`, used for masked scores.
///
/// A finite fill keeps fully masked rows at a uniform softmax instead of NaN.
fn masked_fill_value(dtype: DType) -> f64 {
    match dtype {
        DType::F32 => f64::from(f32::MIN),
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Pointwise (kernel 1) convolution with bias.
pub(crate) fn pointwise(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<candle_nn::Conv1d> {
    Ok(candle_nn::conv1d(
        in_channels,
        out_channels,
        1,
        candle_nn::Conv1dConfig::default(),
        vb,
    )?)
}

/// `[B, C, T]` → `[B, H, T, C / H]`
fn split_heads(x: &Tensor, n_head: usize) -> Result<Tensor> {
    let (b, c, t) = x.dims3()?;
    Ok(x
        .reshape((b, n_head, c / n_head, t))?
        .transpose(2, 3)?
        .contiguous()?)
}

/// `[B, H, T, D]` → `[B, H * D, T]`
fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (b, h, t, d) = x.dims4()?;
    Ok(x.transpose(2, 3)?.contiguous()?.reshape((b, h * d, t))?)
}

/// Band of allowed `(query, key)` pairs: `[1, 1, Tq, Tk]`, 1 where `|i - j| <= window / 2`.
pub(crate) fn band_mask(tq: usize, tk: usize, window: usize, device: &Device) -> Result<Tensor> {
    let half = window / 2;
    let data: Vec<u8> = (0..tq)
        .flat_map(|i| (0..tk).map(move |j| u8::from(i.abs_diff(j) <= half)))
        .collect();
    Ok(Tensor::from_vec(data, (1, 1, tq, tk), device)?)
}

/// Gather a learned `[H, window]` relative bias into `[1, H, Tq, Tk]`.
///
/// Offsets outside the window are clamped; the band mask hides them.
fn relative_bias(rel_pe: &Tensor, tq: usize, tk: usize) -> Result<Tensor> {
    let (h, window) = rel_pe.dims2()?;
    let half = (window / 2) as i64;
    let last = window as i64 - 1;
    let index: Vec<u32> = (0..tq as i64)
        .flat_map(|i| (0..tk as i64).map(move |j| (j - i + half).clamp(0, last) as u32))
        .collect();
    let index = Tensor::from_vec(index, tq * tk, rel_pe.device())?;
    Ok(rel_pe
        .index_select(&index, 1)?
        .reshape((1, h, tq, tk))?)
}

/// Scaled dot-product attention with a `u8` visibility mask.
///
/// - `q`: `[B, H, Tq, D]`, `k`/`v`: `[B, H, Tk, D]`
/// - `visible`: broadcastable to `[B, H, Tq, Tk]`
fn attend(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    visible: &Tensor,
    bias: Option<&Tensor>,
    dropout: &candle_nn::Dropout,
    train: bool,
) -> Result<Tensor> {
    let head_dim = q.dim(3)?;
    let scale = 1.0 / (head_dim as f64).sqrt();
    let scores = (q * scale)?.matmul(&k.t()?)?;
    let scores = match bias {
        Some(bias) => scores.broadcast_add(bias)?,
        None => scores,
    };
    let fill = Tensor::new(masked_fill_value(scores.dtype()), scores.device())?
        .to_dtype(scores.dtype())?
        .broadcast_as(scores.shape())?;
    let scores = visible
        .broadcast_as(scores.shape())?
        .where_cond(&scores, &fill)?;
    let weights = candle_nn::ops::softmax_last_dim(&scores)?;
    let weights = dropout.forward(&weights, train)?;
    Ok(weights.matmul(v)?)
}

/// Key mask `[B, 1, Tk]` → `[B, 1, 1, Tk]`.
fn key_visibility(kv_mask: &Tensor) -> Result<Tensor> {
    Ok(kv_mask.unsqueeze(1)?)
}

/// Zero values at padded key positions: `v [B, H, Tk, D]`, `kv_mask [B, 1, Tk]`.
fn mask_values(v: &Tensor, kv_mask: &Tensor) -> Result<Tensor> {
    let m = mask_as(kv_mask, v)?.unsqueeze(3)?;
    Ok(v.broadcast_mul(&m)?)
}

/// Hyper-parameters shared by the attention layers.
#[derive(Debug, Clone, Copy)]
pub struct AttentionConfig {
    pub n_head: usize,
    /// Temporal stride of the query path.
    pub q_stride: usize,
    /// Temporal stride of the key/value path.
    pub kv_stride: usize,
    /// Local window; `None` attends globally.
    pub window: Option<usize>,
    /// Learn a relative position bias (local attention only).
    pub use_rel_pe: bool,
    pub attn_pdrop: f64,
    pub proj_pdrop: f64,
}

impl AttentionConfig {
    pub fn global(n_head: usize) -> Self {
        Self {
            n_head,
            q_stride: 1,
            kv_stride: 1,
            window: None,
            use_rel_pe: false,
            attn_pdrop: 0.0,
            proj_pdrop: 0.0,
        }
    }
}

/// Odd kernel covering at least `stride + 1` steps, so a conv with padding
/// `kernel / 2` maps `T` to exactly `T / stride`.
pub(crate) fn downsample_kernel(stride: usize) -> usize {
    (stride + 1) | 1
}

/// Depthwise masked conv + LayerNorm on one of the q/k/v paths.
#[derive(Debug, Clone)]
struct ConvPath {
    conv: MaskedConv1d,
    norm: ChannelLayerNorm,
}

impl ConvPath {
    fn new(channels: usize, stride: usize, vb: VarBuilder, conv_name: &str, norm_name: &str) -> Result<Self> {
        let kernel = downsample_kernel(stride);
        let cfg = MaskedConvConfig {
            stride,
            padding: kernel / 2,
            groups: channels,
            bias: false,
        };
        Ok(Self {
            conv: MaskedConv1d::new(channels, channels, kernel, cfg, vb.pp(conv_name))?,
            norm: ChannelLayerNorm::new(channels, vb.pp(norm_name))?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (x, mask) = self.conv.forward(x, mask)?;
        Ok((self.norm.forward(&x)?, mask))
    }
}

/// Multi-head self-attention with convolutional downsampling of q/k/v.
#[derive(Debug, Clone)]
pub struct MaskedSelfAttention {
    query_path: ConvPath,
    key_path: ConvPath,
    value_path: ConvPath,
    query: candle_nn::Conv1d,
    key: candle_nn::Conv1d,
    value: candle_nn::Conv1d,
    proj: candle_nn::Conv1d,
    attn_drop: candle_nn::Dropout,
    proj_drop: candle_nn::Dropout,
    /// `[H, window]` learned relative bias, local attention only.
    rel_pe: Option<Tensor>,
    n_head: usize,
    window: Option<usize>,
}

impl MaskedSelfAttention {
    pub fn new(channels: usize, cfg: AttentionConfig, vb: VarBuilder) -> Result<Self> {
        let rel_pe = match (cfg.window, cfg.use_rel_pe) {
            (Some(window), true) => Some(vb.get_with_hints(
                (cfg.n_head, window),
                "rel_pe",
                Init::Randn {
                    mean: 0.0,
                    stdev: (2.0 / channels as f64).sqrt(),
                },
            )?),
            (None, true) => {
                tracing::warn!("relative position bias requested without a local window; ignored");
                None
            }
            _ => None,
        };
        Ok(Self {
            query_path: ConvPath::new(channels, cfg.q_stride, vb.clone(), "query_conv", "query_norm")?,
            key_path: ConvPath::new(channels, cfg.kv_stride, vb.clone(), "key_conv", "key_norm")?,
            value_path: ConvPath::new(channels, cfg.kv_stride, vb.clone(), "value_conv", "value_norm")?,
            query: pointwise(channels, channels, vb.pp("query"))?,
            key: pointwise(channels, channels, vb.pp("key"))?,
            value: pointwise(channels, channels, vb.pp("value"))?,
            proj: pointwise(channels, channels, vb.pp("proj"))?,
            attn_drop: candle_nn::Dropout::new(cfg.attn_pdrop as f32),
            proj_drop: candle_nn::Dropout::new(cfg.proj_pdrop as f32),
            rel_pe,
            n_head: cfg.n_head,
            window: cfg.window,
        })
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, C, T]`, `mask`: `[B, 1, T]`
    ///
    /// Returns `([B, C, T / q_stride], [B, 1, T / q_stride])`.
    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (q, q_mask) = self.query_path.forward(x, mask)?;
        let (k, kv_mask) = self.key_path.forward(x, mask)?;
        let (v, _) = self.value_path.forward(x, mask)?;

        let q = split_heads(&self.query.forward(&q)?, self.n_head)?;
        let k = split_heads(&self.key.forward(&k)?, self.n_head)?;
        let v = mask_values(&split_heads(&self.value.forward(&v)?, self.n_head)?, &kv_mask)?;

        let tq = q.dim(2)?;
        let tk = k.dim(2)?;
        let mut visible = key_visibility(&kv_mask)?;
        let mut bias = None;
        if let Some(window) = self.window {
            visible = visible.broadcast_mul(&band_mask(tq, tk, window, x.device())?)?;
            if let Some(rel_pe) = &self.rel_pe {
                bias = Some(relative_bias(rel_pe, tq, tk)?);
            }
        }

        let out = attend(&q, &k, &v, &visible, bias.as_ref(), &self.attn_drop, train)?;
        let q_mask_f = mask_as(&q_mask, x)?;
        let out = merge_heads(&out)?.broadcast_mul(&q_mask_f)?;
        let out = self.proj_drop.forward(&self.proj.forward(&out)?, train)?;
        Ok((out.broadcast_mul(&q_mask_f)?, q_mask))
    }
}

impl BiasParams for MaskedSelfAttention {
    fn bias_params(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        for path in [&self.query_path, &self.key_path, &self.value_path] {
            params.extend(path.conv.bias_params());
        }
        for conv in [&self.query, &self.key, &self.value, &self.proj] {
            params.extend(conv.bias());
        }
        params
    }
}

/// Multi-head cross-attention: queries from `x`, keys/values from `context`.
#[derive(Debug, Clone)]
pub struct MaskedCrossAttention {
    query: candle_nn::Conv1d,
    key: candle_nn::Conv1d,
    value: candle_nn::Conv1d,
    proj: candle_nn::Conv1d,
    attn_drop: candle_nn::Dropout,
    proj_drop: candle_nn::Dropout,
    n_head: usize,
}

impl MaskedCrossAttention {
    pub fn new(channels: usize, context_channels: usize, cfg: AttentionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            query: pointwise(channels, channels, vb.pp("query"))?,
            key: pointwise(context_channels, channels, vb.pp("key"))?,
            value: pointwise(context_channels, channels, vb.pp("value"))?,
            proj: pointwise(channels, channels, vb.pp("proj"))?,
            attn_drop: candle_nn::Dropout::new(cfg.attn_pdrop as f32),
            proj_drop: candle_nn::Dropout::new(cfg.proj_pdrop as f32),
            n_head: cfg.n_head,
        })
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, C, Tq]`, `x_mask`: `[B, 1, Tq]`
    /// - `context`: `[B, C_ctx, Tk]`, `context_mask`: `[B, 1, Tk]`
    ///
    /// Returns `[B, C, Tq]`, zero at padded query positions.
    pub fn forward(
        &self,
        x: &Tensor,
        x_mask: &Tensor,
        context: &Tensor,
        context_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let q = split_heads(&self.query.forward(&x.contiguous()?)?, self.n_head)?;
        let k = split_heads(&self.key.forward(&context.contiguous()?)?, self.n_head)?;
        let v = split_heads(&self.value.forward(&context.contiguous()?)?, self.n_head)?;
        let v = mask_values(&v, context_mask)?;

        let visible = key_visibility(context_mask)?;
        let out = attend(&q, &k, &v, &visible, None, &self.attn_drop, train)?;
        let x_mask_f = mask_as(x_mask, x)?;
        let out = merge_heads(&out)?.broadcast_mul(&x_mask_f)?;
        let out = self.proj_drop.forward(&self.proj.forward(&out)?, train)?;
        Ok(out.broadcast_mul(&x_mask_f)?)
    }
}

impl BiasParams for MaskedCrossAttention {
    fn bias_params(&self) -> Vec<&Tensor> {
        [&self.query, &self.key, &self.value, &self.proj]
            .into_iter()
            .filter_map(|conv| conv.bias())
            .collect()
    }
}
