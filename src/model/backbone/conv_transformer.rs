//! Conv + transformer backbone with a learned long-memory summary.
//!
//! ## Architecture
//!
//! ```text
//! x [B, C_in, T] ─→ (per-stream 1x1 projection)
//!   ├─→ learn_embd  → LN → ReLU = f   ──→ long_attn[0]: 192 memory slots ⟵ f
//!   │                                      long_attn[1]:  96 query slots  ⟵ memory
//!   │                                      = summary [B, C, 96]
//!   ├─→ learn_embd2 → LN → ReLU = f2
//!   └─→ embd        → LN → ReLU (+ PE) = level 0 [B, C, T]
//!
//! per branch stage i (T → T / s):
//!   TransformerBlock(stride s)
//!   → 4 contiguous segments, each stem[i](segment ⟵ f2), re-concatenated
//!   → ConvBlock
//!   → aggr[i](· ⟵ summary)                         = level i + 1
//! ```
//!
//! ## Weight key paths
//!
//! ```text
//! proj.{i}.weight, proj.{i}.bias               — multi-stream only
//! embd.weight, embd_norm.{weight,bias}
//! learn_embd.weight, learn_embd_norm.{weight,bias}
//! learn_embd2.weight, learn_embd_norm2.{weight,bias}
//! long_mem.weight   (C, 192)
//! long_query.weight (C, 96)
//! long_attn.{0,1}.*, branch.{i}.*, stem.{i}.*, convblock.{i}.*, aggr.{i}.*
//! ```

use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};

use super::{check_input, Backbone, ConvEmbedding, FeatureProjection, Pyramid};
use crate::config::{ConvTransformerConfig, LONG_MEMORY_SLOTS, LONG_QUERY_SLOTS};
use crate::model::blocks::position::AbsolutePositionEmbedding;
use crate::model::blocks::transformer_block::TransformerBlockConfig;
use crate::model::blocks::{
    zero_biases, AggregationBlock, BiasParams, ConvBlock, TransformerBlock,
};
use crate::{Error, Result};

/// Number of contiguous segments each branch stage is split into.
pub const SEGMENTS: usize = 4;

/// `(start, len)` of each segment of a length-`t` sequence.
///
/// The first three segments get `t / 4` steps; the last one takes the rest.
pub fn segment_bounds(t: usize) -> [(usize, usize); SEGMENTS] {
    let base = t / SEGMENTS;
    let mut bounds = [(0, base); SEGMENTS];
    for (i, bound) in bounds.iter_mut().enumerate() {
        bound.0 = i * base;
    }
    bounds[SEGMENTS - 1].1 = t - (SEGMENTS - 1) * base;
    bounds
}

/// Split `(x, mask)` along time into [`SEGMENTS`] contiguous pieces.
pub fn split_segments(x: &Tensor, mask: &Tensor) -> Result<Vec<(Tensor, Tensor)>> {
    let t = x.dim(2)?;
    segment_bounds(t)
        .iter()
        .map(|&(start, len)| Ok((x.narrow(2, start, len)?, mask.narrow(2, start, len)?)))
        .collect()
}

/// Concatenate segments back along time, in order. Empty segments are skipped.
pub fn concat_segments(parts: &[(Tensor, Tensor)]) -> Result<(Tensor, Tensor)> {
    let mut feats = Vec::with_capacity(parts.len());
    let mut masks = Vec::with_capacity(parts.len());
    for (x, mask) in parts {
        if x.dim(2)? > 0 {
            feats.push(x);
            masks.push(mask);
        }
    }
    if feats.is_empty() {
        return Err(Error::Shape("all segments are empty".to_string()));
    }
    Ok((Tensor::cat(&feats, 2)?, Tensor::cat(&masks, 2)?))
}

/// Cross-attend every segment of `(x, mask)` against `context` with one
/// shared block, then stitch the segments back together.
pub fn cross_attend_segments(
    block: &AggregationBlock,
    x: &Tensor,
    mask: &Tensor,
    context: &Tensor,
    context_mask: &Tensor,
    train: bool,
) -> Result<(Tensor, Tensor)> {
    let mut processed = Vec::with_capacity(SEGMENTS);
    for (segment, segment_mask) in split_segments(x, mask)? {
        if segment.dim(2)? == 0 {
            processed.push((segment, segment_mask));
            continue;
        }
        processed.push(block.forward(
            &segment.contiguous()?,
            &segment_mask.contiguous()?,
            context,
            context_mask,
            train,
        )?);
    }
    concat_segments(&processed)
}

/// One downsampling stage of the branch.
#[derive(Debug, Clone)]
struct BranchStage {
    transformer: TransformerBlock,
    /// Shared across the stage's segments.
    segment_attn: AggregationBlock,
    mixer: ConvBlock,
    memory_attn: AggregationBlock,
}

impl BranchStage {
    fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        side: (&Tensor, &Tensor),
        summary: (&Tensor, &Tensor),
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (x, mask) = self.transformer.forward(x, mask, train)?;
        let (x, mask) =
            cross_attend_segments(&self.segment_attn, &x, &mask, side.0, side.1, train)?;
        let (x, mask) = self.mixer.forward(&x, &mask)?;
        self.memory_attn
            .forward(&x, &mask, summary.0, summary.1, train)
    }
}

impl BiasParams for BranchStage {
    fn bias_params(&self) -> Vec<&Tensor> {
        let mut params = self.transformer.bias_params();
        params.extend(self.segment_attn.bias_params());
        params.extend(self.mixer.bias_params());
        params.extend(self.memory_attn.bias_params());
        params
    }
}

/// Backbone combining masked convolutions with transformer stages.
#[derive(Debug, Clone)]
pub struct ConvTransformerBackbone {
    projection: FeatureProjection,
    learn_embd: ConvEmbedding,
    learn_embd2: ConvEmbedding,
    embd: ConvEmbedding,
    pos_embd: Option<AbsolutePositionEmbedding>,
    /// `[C, 192]`
    long_mem: Tensor,
    /// `[C, 96]`
    long_query: Tensor,
    /// Memory ⟵ input, then query ⟵ memory.
    long_attn: [AggregationBlock; 2],
    stages: Vec<BranchStage>,
    n_embd: usize,
}

impl ConvTransformerBackbone {
    /// Build a freshly initialized backbone (linear/conv biases zeroed).
    pub fn new(cfg: &ConvTransformerConfig, vb: VarBuilder) -> Result<Self> {
        let backbone = Self::load(cfg, vb)?;
        zero_biases(&backbone.bias_params())?;
        tracing::info!(
            levels = backbone.num_levels(),
            n_embd = backbone.n_embd,
            abs_pe = backbone.pos_embd.is_some(),
            "built convTransformer backbone"
        );
        Ok(backbone)
    }

    /// Build from existing weights without re-initializing anything.
    pub fn load(cfg: &ConvTransformerConfig, vb: VarBuilder) -> Result<Self> {
        let widths = cfg.validate()?;
        let n_embd = widths.n_embd;
        let ks = cfg.n_embd_ks;
        let conv_bias = !cfg.with_ln;

        let projection = FeatureProjection::new(&widths.layout, widths.input_channels, vb.pp("proj"))?;
        let embedding = |conv: &str, norm: &str| {
            ConvEmbedding::new(widths.embed_in, n_embd, ks, conv_bias, true, vb.pp(conv), vb.pp(norm))
        };
        let learn_embd = embedding("learn_embd", "learn_embd_norm")?;
        let learn_embd2 = embedding("learn_embd2", "learn_embd_norm2")?;
        let embd = embedding("embd", "embd_norm")?;

        let pos_embd = if cfg.use_abs_pe {
            Some(AbsolutePositionEmbedding::new(
                cfg.max_len,
                n_embd,
                vb.dtype(),
                vb.device(),
            )?)
        } else {
            None
        };

        let embedding_init = Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };
        let long_mem =
            vb.get_with_hints((n_embd, LONG_MEMORY_SLOTS), "long_mem.weight", embedding_init)?;
        let long_query =
            vb.get_with_hints((n_embd, LONG_QUERY_SLOTS), "long_query.weight", embedding_init)?;
        if cfg.arch[1] > 2 {
            tracing::warn!(
                stages = cfg.arch[1],
                "long-memory path uses two aggregation stages; the rest are not built"
            );
        }
        let long_attn = [
            AggregationBlock::new(n_embd, cfg.n_head, vb.pp("long_attn.0"))?,
            AggregationBlock::new(n_embd, cfg.n_head, vb.pp("long_attn.1"))?,
        ];

        let mut stages = Vec::with_capacity(cfg.branch_stages());
        for idx in 0..cfg.branch_stages() {
            let block_cfg = TransformerBlockConfig {
                n_head: cfg.n_head,
                ds_strides: (cfg.scale_factor, cfg.scale_factor),
                window: cfg.window(1 + idx),
                use_rel_pe: cfg.use_rel_pe,
                attn_pdrop: cfg.attn_pdrop,
                proj_pdrop: cfg.proj_pdrop,
                path_pdrop: cfg.path_pdrop,
            };
            stages.push(BranchStage {
                transformer: TransformerBlock::new(n_embd, block_cfg, vb.pp(format!("branch.{idx}")))?,
                segment_attn: AggregationBlock::new(n_embd, cfg.n_head, vb.pp(format!("stem.{idx}")))?,
                mixer: ConvBlock::new(n_embd, 3, 1, vb.pp(format!("convblock.{idx}")))?,
                memory_attn: AggregationBlock::new(n_embd, cfg.n_head, vb.pp(format!("aggr.{idx}")))?,
            });
        }

        Ok(Self {
            projection,
            learn_embd,
            learn_embd2,
            embd,
            pos_embd,
            long_mem,
            long_query,
            long_attn,
            stages,
            n_embd,
        })
    }

    /// Broadcast a `[C, S]` slot table over the batch, with an all-valid mask.
    fn seed_slots(table: &Tensor, batch: usize) -> Result<(Tensor, Tensor)> {
        let (c, slots) = table.dims2()?;
        let seeded = table
            .unsqueeze(0)?
            .broadcast_as((batch, c, slots))?
            .contiguous()?;
        let mask = Tensor::ones((batch, 1, slots), DType::U8, table.device())?;
        Ok((seeded, mask))
    }

    /// Distill `(f, f_mask)` into the 96-slot long-memory summary.
    fn long_memory(&self, f: &Tensor, f_mask: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let batch = f.dim(0)?;
        let (memory, memory_mask) = Self::seed_slots(&self.long_mem, batch)?;
        let (memory, memory_mask) =
            self.long_attn[0].forward(&memory, &memory_mask, f, f_mask, train)?;
        let (query, query_mask) = Self::seed_slots(&self.long_query, batch)?;
        self.long_attn[1].forward(&query, &query_mask, &memory, &memory_mask, train)
    }
}

impl BiasParams for ConvTransformerBackbone {
    fn bias_params(&self) -> Vec<&Tensor> {
        let mut params = self.projection.bias_params();
        params.extend(self.learn_embd.bias_params());
        params.extend(self.learn_embd2.bias_params());
        params.extend(self.embd.bias_params());
        for block in &self.long_attn {
            params.extend(block.bias_params());
        }
        for stage in &self.stages {
            params.extend(stage.bias_params());
        }
        params
    }
}

impl Backbone for ConvTransformerBackbone {
    fn name(&self) -> &'static str {
        "convTransformer"
    }

    fn num_levels(&self) -> usize {
        self.stages.len() + 1
    }

    fn forward_t(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Pyramid> {
        let mask = check_input(x, mask, self.projection.input_channels())?;
        let x = self.projection.forward(x, &mask)?;

        let (f, f_mask) = self.learn_embd.forward(&x, &mask)?;
        let (summary, summary_mask) = self.long_memory(&f, &f_mask, train)?;
        let (f2, f2_mask) = self.learn_embd2.forward(&x, &mask)?;

        let (mut x, mut mask) = self.embd.forward(&x, &mask)?;
        if let Some(pos_embd) = &self.pos_embd {
            x = pos_embd.add_to(&x, &mask, train)?;
        }

        let mut pyramid = Pyramid::with_capacity(self.num_levels());
        pyramid.push(x.clone(), mask.clone())?;
        for (idx, stage) in self.stages.iter().enumerate() {
            let (next_x, next_mask) =
                stage.forward(&x, &mask, (&f2, &f2_mask), (&summary, &summary_mask), train)?;
            tracing::debug!(level = idx + 1, len = next_x.dim(2)?, "branch stage done");
            pyramid.push(next_x.clone(), next_mask.clone())?;
            x = next_x;
            mask = next_mask;
        }
        Ok(pyramid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn small_cfg() -> ConvTransformerConfig {
        ConvTransformerConfig {
            n_in: 6.into(),
            n_embd: 16.into(),
            n_head: 4,
            n_embd_ks: 3,
            max_len: 32,
            arch: vec![2, 2, 2],
            mha_win_size: vec![-1, -1, 5],
            ..ConvTransformerConfig::default()
        }
    }

    fn build(cfg: &ConvTransformerConfig) -> (VarMap, ConvTransformerBackbone) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let backbone = ConvTransformerBackbone::new(cfg, vb).unwrap();
        (varmap, backbone)
    }

    fn inputs(batch: usize, channels: usize, t: usize) -> (Tensor, Tensor) {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (batch, channels, t), &dev).unwrap();
        let mask = Tensor::ones((batch, 1, t), DType::U8, &dev).unwrap();
        (x, mask)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn segment_bounds_give_remainder_to_last() {
        assert_eq!(segment_bounds(16), [(0, 4), (4, 4), (8, 4), (12, 4)]);
        assert_eq!(segment_bounds(10), [(0, 2), (2, 2), (4, 2), (6, 4)]);
        assert_eq!(segment_bounds(3), [(0, 0), (0, 0), (0, 0), (0, 3)]);
    }

    #[test]
    fn split_then_concat_restores_sequence() {
        let dev = Device::Cpu;
        let x = Tensor::arange(0f32, 22., &dev)
            .unwrap()
            .reshape((1, 2, 11))
            .unwrap();
        let mask = Tensor::ones((1, 1, 11), DType::U8, &dev).unwrap();
        let parts = split_segments(&x, &mask).unwrap();
        let lens: Vec<usize> = parts.iter().map(|(p, _)| p.dim(2).unwrap()).collect();
        assert_eq!(lens, vec![2, 2, 2, 5]);
        let (joined, joined_mask) = concat_segments(&parts).unwrap();
        assert_eq!(joined.to_vec3::<f32>().unwrap(), x.to_vec3::<f32>().unwrap());
        assert_eq!(joined_mask.dims(), &[1, 1, 11]);
    }

    #[test]
    fn shared_segment_block_matches_per_segment_calls() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let block = AggregationBlock::new(8, 2, vb).unwrap();

        let (x, mask) = inputs(2, 8, 10);
        let (ctx, ctx_mask) = inputs(2, 8, 13);
        let (out, out_mask) = cross_attend_segments(&block, &x, &mask, &ctx, &ctx_mask, false).unwrap();
        assert_eq!(out.dims(), &[2, 8, 10]);
        assert_eq!(out_mask.dims(), &[2, 1, 10]);

        // Same weights, regardless of which segment they are applied to.
        for (start, len) in segment_bounds(10) {
            let seg = x.narrow(2, start, len).unwrap().contiguous().unwrap();
            let seg_mask = mask.narrow(2, start, len).unwrap().contiguous().unwrap();
            let (alone, _) = block.forward(&seg, &seg_mask, &ctx, &ctx_mask, false).unwrap();
            let joined = out.narrow(2, start, len).unwrap();
            assert!(max_abs_diff(&alone, &joined) < 1e-5);
        }
    }

    #[test]
    fn pyramid_halves_per_stage() {
        let cfg = small_cfg();
        let (_varmap, backbone) = build(&cfg);
        let (x, mask) = inputs(2, 6, 32);
        let pyramid = backbone.forward(&x, &mask).unwrap();
        assert_eq!(pyramid.len(), 3);
        assert_eq!(pyramid.lengths().unwrap(), vec![32, 16, 8]);
        for (feat, mask) in pyramid.iter() {
            assert_eq!(feat.dim(1).unwrap(), 16);
            assert_eq!(mask.dim(2).unwrap(), feat.dim(2).unwrap());
        }
    }

    #[test]
    fn short_stage_sequences_still_work() {
        // Stage lengths 4 → 2 → 1: segments of length zero pass through.
        let cfg = ConvTransformerConfig {
            arch: vec![2, 2, 3],
            mha_win_size: vec![-1; 4],
            ..small_cfg()
        };
        let (_varmap, backbone) = build(&cfg);
        let (x, mask) = inputs(1, 6, 8);
        let pyramid = backbone.forward(&x, &mask).unwrap();
        assert_eq!(pyramid.lengths().unwrap(), vec![8, 4, 2, 1]);
    }

    #[test]
    fn multi_stream_input() {
        let cfg = ConvTransformerConfig {
            n_in: vec![2, 4].into(),
            n_embd: vec![8, 8].into(),
            ..small_cfg()
        };
        let (_varmap, backbone) = build(&cfg);
        let (x, mask) = inputs(1, 6, 16);
        let pyramid = backbone.forward(&x, &mask).unwrap();
        assert_eq!(pyramid.features()[0].dims(), &[1, 16, 16]);

        let (wrong, wrong_mask) = inputs(1, 7, 16);
        assert!(matches!(
            backbone.forward(&wrong, &wrong_mask),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn training_length_limit() {
        let cfg = ConvTransformerConfig {
            use_abs_pe: true,
            ..small_cfg()
        };
        let (_varmap, backbone) = build(&cfg);

        let (x, mask) = inputs(1, 6, 32);
        assert!(backbone.forward_t(&x, &mask, true).is_ok());

        let (x, mask) = inputs(1, 6, 33);
        assert!(matches!(
            backbone.forward_t(&x, &mask, true),
            Err(Error::SequenceTooLong { len: 33, max_len: 32 })
        ));
    }

    #[test]
    fn inference_accepts_longer_sequences() {
        let cfg = ConvTransformerConfig {
            use_abs_pe: true,
            ..small_cfg()
        };
        let (_varmap, backbone) = build(&cfg);
        let (x, mask) = inputs(1, 6, 64);
        let pyramid = backbone.forward(&x, &mask).unwrap();
        assert_eq!(pyramid.lengths().unwrap(), vec![64, 32, 16]);
    }

    #[test]
    fn biases_start_at_zero() {
        let cfg = ConvTransformerConfig {
            n_in: vec![2, 4].into(),
            n_embd: vec![8, 8].into(),
            ..small_cfg()
        };
        let (varmap, backbone) = build(&cfg);
        assert!(!backbone.bias_params().is_empty());
        for bias in backbone.bias_params() {
            let sum: f32 = bias.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
            assert_eq!(sum, 0.0);
        }
        // The variables behind them were updated too.
        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            if name.ends_with(".bias") {
                let sum: f32 = var.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
                assert_eq!(sum, 0.0, "{name}");
            }
        }
    }

    #[test]
    fn inference_is_deterministic() {
        let cfg = ConvTransformerConfig {
            attn_pdrop: 0.1,
            proj_pdrop: 0.1,
            path_pdrop: 0.1,
            ..small_cfg()
        };
        let (_varmap, backbone) = build(&cfg);
        let (x, mask) = inputs(2, 6, 16);
        let a = backbone.forward(&x, &mask).unwrap();
        let b = backbone.forward(&x, &mask).unwrap();
        for ((fa, ma), (fb, mb)) in a.iter().zip(b.iter()) {
            assert_eq!(fa.to_vec3::<f32>().unwrap(), fb.to_vec3::<f32>().unwrap());
            assert_eq!(ma.to_vec3::<u8>().unwrap(), mb.to_vec3::<u8>().unwrap());
        }
    }

    #[test]
    fn invalid_configs_fail_construction() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = ConvTransformerConfig {
            mha_win_size: vec![-1; 2],
            ..small_cfg()
        };
        assert!(matches!(
            ConvTransformerBackbone::new(&cfg, vb.clone()),
            Err(Error::Config(_))
        ));
        let cfg = ConvTransformerConfig {
            arch: vec![2, 2],
            ..small_cfg()
        };
        assert!(matches!(
            ConvTransformerBackbone::new(&cfg, vb),
            Err(Error::Config(_))
        ));
    }
}
