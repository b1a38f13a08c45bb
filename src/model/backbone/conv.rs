//! Convolution-only backbone.
//!
//! ```text
//! x → (projection) → arch[0] × [MaskedConv → (LN) → ReLU]
//!   → arch[1] × ConvBlock(stride 1)                 = level 0
//!   → arch[2] × ConvBlock(stride s), one level each
//! ```

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::{check_input, Backbone, ConvEmbedding, FeatureProjection, Pyramid};
use crate::config::ConvConfig;
use crate::model::blocks::{zero_biases, BiasParams, ConvBlock};
use crate::Result;

#[derive(Debug, Clone)]
pub struct ConvBackbone {
    projection: FeatureProjection,
    embd: Vec<ConvEmbedding>,
    stem: Vec<ConvBlock>,
    branch: Vec<ConvBlock>,
}

impl ConvBackbone {
    /// Build a freshly initialized backbone (linear/conv biases zeroed).
    pub fn new(cfg: &ConvConfig, vb: VarBuilder) -> Result<Self> {
        let backbone = Self::load(cfg, vb)?;
        zero_biases(&backbone.bias_params())?;
        tracing::info!(
            levels = backbone.num_levels(),
            embedding_convs = backbone.embd.len(),
            stem_convs = backbone.stem.len(),
            "built conv backbone"
        );
        Ok(backbone)
    }

    /// Build from existing weights without re-initializing anything.
    pub fn load(cfg: &ConvConfig, vb: VarBuilder) -> Result<Self> {
        let widths = cfg.validate()?;
        let n_embd = widths.n_embd;
        let projection =
            FeatureProjection::new(&widths.layout, widths.input_channels, vb.pp("proj"))?;

        let embd = (0..cfg.arch[0])
            .map(|idx| {
                let c_in = if idx > 0 { n_embd } else { widths.embed_in };
                ConvEmbedding::new(
                    c_in,
                    n_embd,
                    cfg.n_embd_ks,
                    !cfg.with_ln,
                    cfg.with_ln,
                    vb.pp(format!("embd.{idx}")),
                    vb.pp(format!("embd_norm.{idx}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let stem = (0..cfg.arch[1])
            .map(|idx| ConvBlock::new(n_embd, 3, 1, vb.pp(format!("stem.{idx}"))))
            .collect::<Result<Vec<_>>>()?;
        let branch = (0..cfg.arch[2])
            .map(|idx| ConvBlock::new(n_embd, 3, cfg.scale_factor, vb.pp(format!("branch.{idx}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            projection,
            embd,
            stem,
            branch,
        })
    }
}

impl BiasParams for ConvBackbone {
    fn bias_params(&self) -> Vec<&Tensor> {
        let mut params = self.projection.bias_params();
        for layer in &self.embd {
            params.extend(layer.bias_params());
        }
        for block in self.stem.iter().chain(&self.branch) {
            params.extend(block.bias_params());
        }
        params
    }
}

impl Backbone for ConvBackbone {
    fn name(&self) -> &'static str {
        "conv"
    }

    fn num_levels(&self) -> usize {
        self.branch.len() + 1
    }

    fn forward_t(&self, x: &Tensor, mask: &Tensor, _train: bool) -> Result<Pyramid> {
        let mask = check_input(x, mask, self.projection.input_channels())?;
        let mut x = self.projection.forward(x, &mask)?;
        let mut mask = mask;

        for layer in &self.embd {
            (x, mask) = layer.forward(&x, &mask)?;
        }
        for block in &self.stem {
            (x, mask) = block.forward(&x, &mask)?;
        }

        let mut pyramid = Pyramid::with_capacity(self.num_levels());
        pyramid.push(x.clone(), mask.clone())?;
        for (idx, block) in self.branch.iter().enumerate() {
            (x, mask) = block.forward(&x, &mask)?;
            tracing::debug!(level = idx + 1, len = x.dim(2)?, "branch conv done");
            pyramid.push(x.clone(), mask.clone())?;
        }
        Ok(pyramid)
    }
}
