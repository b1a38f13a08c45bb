//! Temporal backbones producing multi-scale feature pyramids.
//!
//! Two variants:
//! - [`conv_transformer`] — conv embeddings + downsampling transformer stages,
//!   segment cross-attention and a learned long-memory summary
//! - [`conv`] — embeddings, stem and branch built from conv blocks only
//!
//! Both take `x: [B, C_in, T]` with `mask: [B, 1, T]` and return a
//! [`Pyramid`] of `arch[2] + 1` levels, finest first.

pub mod conv;
pub mod conv_transformer;

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use super::blocks::masked_conv::MaskedConv1d;
use super::blocks::norm::MaybeNorm;
use super::blocks::BiasParams;
use crate::config::StreamLayout;
use crate::{Error, Result};

pub use conv::ConvBackbone;
pub use conv_transformer::ConvTransformerBackbone;

/// A backbone selectable by name through [`crate::registry::BackboneRegistry`].
pub trait Backbone: Send + Sync {
    /// Registry key of this architecture.
    fn name(&self) -> &'static str;

    /// Number of pyramid levels produced per forward pass.
    fn num_levels(&self) -> usize;

    /// Forward pass. `train` enables dropout, stochastic depth and the
    /// training-time positional length check.
    fn forward_t(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Pyramid>;

    /// Inference forward pass.
    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Pyramid> {
        self.forward_t(x, mask, false)
    }
}

/// Feature maps and masks at decreasing temporal resolution, finest first.
#[derive(Debug, Clone, Default)]
pub struct Pyramid {
    features: Vec<Tensor>,
    masks: Vec<Tensor>,
}

impl Pyramid {
    pub fn with_capacity(levels: usize) -> Self {
        Self {
            features: Vec::with_capacity(levels),
            masks: Vec::with_capacity(levels),
        }
    }

    /// Append a level. The mask must cover exactly the feature's time axis.
    pub fn push(&mut self, features: Tensor, mask: Tensor) -> Result<()> {
        let t = features.dim(2)?;
        if mask.dim(2)? != t {
            return Err(Error::Shape(format!(
                "level {} mask length {} does not match feature length {t}",
                self.features.len(),
                mask.dim(2)?
            )));
        }
        self.features.push(features);
        self.masks.push(mask);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn features(&self) -> &[Tensor] {
        &self.features
    }

    pub fn masks(&self) -> &[Tensor] {
        &self.masks
    }

    pub fn level(&self, index: usize) -> Option<(&Tensor, &Tensor)> {
        Some((self.features.get(index)?, self.masks.get(index)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tensor, &Tensor)> {
        self.features.iter().zip(self.masks.iter())
    }

    /// Time length of every level.
    pub fn lengths(&self) -> Result<Vec<usize>> {
        self.features
            .iter()
            .map(|f| f.dim(2).map_err(Error::from))
            .collect()
    }

    pub fn into_parts(self) -> (Vec<Tensor>, Vec<Tensor>) {
        (self.features, self.masks)
    }
}

/// Validate `(x, mask)` and return the mask as `u8`.
pub(crate) fn check_input(x: &Tensor, mask: &Tensor, channels: usize) -> Result<Tensor> {
    let &[b, c, t] = x.dims() else {
        return Err(Error::Shape(format!(
            "expected input [B, C, T], got {:?}",
            x.dims()
        )));
    };
    if c != channels {
        return Err(Error::Shape(format!(
            "expected {channels} input channels, got {c}"
        )));
    }
    if t == 0 {
        return Err(Error::Shape("input sequence is empty".to_string()));
    }
    if mask.dims() != [b, 1, t] {
        return Err(Error::Shape(format!(
            "mask must be [{b}, 1, {t}], got {:?}",
            mask.dims()
        )));
    }
    if mask.dtype() == DType::U8 {
        Ok(mask.clone())
    } else {
        Ok(mask.ne(0f64)?)
    }
}

/// Optional per-stream 1x1 projection ahead of the embedding network.
#[derive(Debug, Clone)]
pub struct FeatureProjection {
    input_channels: usize,
    streams: Vec<(usize, MaskedConv1d)>,
}

impl FeatureProjection {
    pub fn new(layout: &StreamLayout, input_channels: usize, vb: VarBuilder) -> Result<Self> {
        let streams = match layout {
            StreamLayout::Single => Vec::new(),
            StreamLayout::Multi {
                in_widths,
                out_widths,
            } => in_widths
                .iter()
                .zip(out_widths)
                .enumerate()
                .map(|(i, (&c_in, &c_out))| {
                    Ok((c_in, MaskedConv1d::same(c_in, c_out, 1, true, vb.pp(i))?))
                })
                .collect::<Result<Vec<_>>>()?,
        };
        Ok(Self {
            input_channels,
            streams,
        })
    }

    /// Channels expected on the raw input.
    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Split `x` by stream width, project each group, concatenate.
    /// Single-stream input is returned unchanged.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        if self.streams.is_empty() {
            return Ok(x.clone());
        }
        let mut offset = 0;
        let mut projected = Vec::with_capacity(self.streams.len());
        for (width, proj) in &self.streams {
            let group = x.narrow(1, offset, *width)?;
            projected.push(proj.forward(&group, mask)?.0);
            offset += width;
        }
        Ok(Tensor::cat(&projected, 1)?)
    }
}

impl BiasParams for FeatureProjection {
    fn bias_params(&self) -> Vec<&Tensor> {
        self.streams
            .iter()
            .flat_map(|(_, proj)| proj.bias_params())
            .collect()
    }
}

/// Same-length masked conv → (LayerNorm | identity) → ReLU.
#[derive(Debug, Clone)]
pub struct ConvEmbedding {
    conv: MaskedConv1d,
    norm: MaybeNorm,
}

impl ConvEmbedding {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        conv_bias: bool,
        with_norm: bool,
        vb_conv: VarBuilder,
        vb_norm: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            conv: MaskedConv1d::same(in_channels, out_channels, kernel_size, conv_bias, vb_conv)?,
            norm: MaybeNorm::new(with_norm, out_channels, vb_norm)?,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (x, mask) = self.conv.forward(x, mask)?;
        Ok((self.norm.forward(&x)?.relu()?, mask))
    }
}

impl BiasParams for ConvEmbedding {
    fn bias_params(&self) -> Vec<&Tensor> {
        self.conv.bias_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn projection_splits_by_stream_width() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layout = StreamLayout::Multi {
            in_widths: vec![3, 5],
            out_widths: vec![4, 6],
        };
        let proj = FeatureProjection::new(&layout, 8, vb).unwrap();
        assert_eq!(proj.input_channels(), 8);
        assert_eq!(proj.bias_params().len(), 2);

        let x = Tensor::randn(0f32, 1.0, (2, 8, 7), &dev).unwrap();
        let mask = Tensor::ones((2, 1, 7), DType::U8, &dev).unwrap();
        let out = proj.forward(&x, &mask).unwrap();
        assert_eq!(out.dims(), &[2, 10, 7]);
    }

    #[test]
    fn single_stream_projection_is_identity() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let proj = FeatureProjection::new(&StreamLayout::Single, 4, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, 3), &dev).unwrap();
        let mask = Tensor::ones((1, 1, 3), DType::U8, &dev).unwrap();
        let out = proj.forward(&x, &mask).unwrap();
        assert_eq!(out.to_vec3::<f32>().unwrap(), x.to_vec3::<f32>().unwrap());
    }

    #[test]
    fn check_input_rejects_bad_shapes() {
        let dev = Device::Cpu;
        let x = Tensor::zeros((2, 4, 8), DType::F32, &dev).unwrap();
        let mask = Tensor::ones((2, 1, 8), DType::U8, &dev).unwrap();
        assert!(check_input(&x, &mask, 4).is_ok());
        assert!(matches!(check_input(&x, &mask, 5), Err(Error::Shape(_))));
        let short = Tensor::ones((2, 1, 7), DType::U8, &dev).unwrap();
        assert!(matches!(check_input(&x, &short, 4), Err(Error::Shape(_))));
        let flat = Tensor::zeros((2, 8), DType::F32, &dev).unwrap();
        assert!(matches!(check_input(&flat, &mask, 4), Err(Error::Shape(_))));
    }

    #[test]
    fn check_input_converts_float_masks() {
        let dev = Device::Cpu;
        let x = Tensor::zeros((1, 2, 3), DType::F32, &dev).unwrap();
        let mask = Tensor::new(&[[[1f32, 0., 1.]]], &dev).unwrap();
        let mask = check_input(&x, &mask, 2).unwrap();
        assert_eq!(mask.dtype(), DType::U8);
        assert_eq!(mask.flatten_all().unwrap().to_vec1::<u8>().unwrap(), vec![1, 0, 1]);
    }

    #[test]
    fn pyramid_rejects_mismatched_mask() {
        let dev = Device::Cpu;
        let mut pyramid = Pyramid::with_capacity(1);
        let x = Tensor::zeros((1, 2, 4), DType::F32, &dev).unwrap();
        let mask = Tensor::ones((1, 1, 3), DType::U8, &dev).unwrap();
        assert!(pyramid.push(x, mask).is_err());
        assert!(pyramid.is_empty());
    }
}
