//! Cross-attention fusion of a query stream with a context stream.
//!
//! ```text
//! x [B, C, Tq], ctx [B, C, Tk]
//!   → x + CrossAttn(LN_q(x), LN_kv(ctx))
//!   → + MLP(LN(·)): Conv1x1(C → 4C) → GELU → Conv1x1(4C → C)
//! ```
//!
//! The output keeps the query length and mask, so the block can pull global
//! context into a sequence, or distill a sequence into a fixed set of slots.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::attention::{AttentionConfig, MaskedCrossAttention};
use super::norm::ChannelLayerNorm;
use super::transformer_block::PointwiseMlp;
use super::{mask_as, BiasParams};
use crate::Result;

#[derive(Debug, Clone)]
pub struct AggregationBlock {
    ln_query: ChannelLayerNorm,
    ln_context: ChannelLayerNorm,
    attn: MaskedCrossAttention,
    ln_mlp: ChannelLayerNorm,
    mlp: PointwiseMlp,
}

impl AggregationBlock {
    pub fn new(channels: usize, n_head: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_query: ChannelLayerNorm::new(channels, vb.pp("ln_query"))?,
            ln_context: ChannelLayerNorm::new(channels, vb.pp("ln_context"))?,
            attn: MaskedCrossAttention::new(
                channels,
                channels,
                AttentionConfig::global(n_head),
                vb.pp("attn"),
            )?,
            ln_mlp: ChannelLayerNorm::new(channels, vb.pp("ln_mlp"))?,
            mlp: PointwiseMlp::new(channels, 4 * channels, 0.0, vb.pp("mlp"))?,
        })
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, C, Tq]`, `x_mask`: `[B, 1, Tq]`
    /// - `context`: `[B, C, Tk]`, `context_mask`: `[B, 1, Tk]`
    ///
    /// Returns `([B, C, Tq], x_mask)`.
    pub fn forward(
        &self,
        x: &Tensor,
        x_mask: &Tensor,
        context: &Tensor,
        context_mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let mask_f = mask_as(x_mask, x)?;
        let attended = self.attn.forward(
            &self.ln_query.forward(x)?,
            x_mask,
            &self.ln_context.forward(context)?,
            context_mask,
            train,
        )?;
        let out = (x.broadcast_mul(&mask_f)? + attended)?;
        let mlp = self.mlp.forward(&self.ln_mlp.forward(&out)?, train)?;
        let out = (&out + mlp.broadcast_mul(&mask_f)?)?;
        Ok((out, x_mask.clone()))
    }
}

impl BiasParams for AggregationBlock {
    fn bias_params(&self) -> Vec<&Tensor> {
        let mut params = self.attn.bias_params();
        params.extend(self.mlp.biases());
        params
    }
}
