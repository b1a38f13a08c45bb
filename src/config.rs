//! Backbone configuration.
//!
//! Field names and defaults follow the reference training configs, so a
//! `backbone` section of an experiment JSON deserializes directly.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of learned long-memory slots attended into the input sequence.
pub const LONG_MEMORY_SLOTS: usize = 192;

/// Number of learned query slots distilled from the long memory.
pub const LONG_QUERY_SLOTS: usize = LONG_MEMORY_SLOTS / 2;

/// A feature width: either one stream or several streams of different widths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureWidths {
    Single(usize),
    Multi(Vec<usize>),
}

impl From<usize> for FeatureWidths {
    fn from(width: usize) -> Self {
        Self::Single(width)
    }
}

impl From<Vec<usize>> for FeatureWidths {
    fn from(widths: Vec<usize>) -> Self {
        Self::Multi(widths)
    }
}

/// How the input channels are laid out, decided once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLayout {
    /// Input is used as-is.
    Single,
    /// Input is split into `in_widths` groups, each projected to the matching
    /// `out_widths` entry, then concatenated.
    Multi {
        in_widths: Vec<usize>,
        out_widths: Vec<usize>,
    },
}

/// Resolved input/embedding widths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWidths {
    pub layout: StreamLayout,
    /// Channel count expected on the raw input tensor.
    pub input_channels: usize,
    /// Channel count fed to the embedding network.
    pub embed_in: usize,
    /// Working embedding width.
    pub n_embd: usize,
}

/// Resolve `(n_in, n_embd)` into a [`StreamLayout`] and concrete widths.
pub fn resolve_widths(n_in: &FeatureWidths, n_embd: &FeatureWidths) -> Result<ResolvedWidths> {
    match (n_in, n_embd) {
        (FeatureWidths::Single(n_in), FeatureWidths::Single(n_embd)) => Ok(ResolvedWidths {
            layout: StreamLayout::Single,
            input_channels: *n_in,
            embed_in: *n_in,
            n_embd: *n_embd,
        }),
        (FeatureWidths::Multi(in_widths), FeatureWidths::Multi(out_widths)) => {
            if in_widths.is_empty() || in_widths.len() != out_widths.len() {
                return Err(Error::Config(format!(
                    "n_in has {} streams but n_embd has {}",
                    in_widths.len(),
                    out_widths.len()
                )));
            }
            let total: usize = out_widths.iter().sum();
            Ok(ResolvedWidths {
                layout: StreamLayout::Multi {
                    in_widths: in_widths.clone(),
                    out_widths: out_widths.clone(),
                },
                input_channels: in_widths.iter().sum(),
                embed_in: total,
                n_embd: total,
            })
        }
        (FeatureWidths::Multi(_), FeatureWidths::Single(_)) => Err(Error::Config(
            "n_in is a list of stream widths, so n_embd must be a list too".to_string(),
        )),
        (FeatureWidths::Single(_), FeatureWidths::Multi(_)) => Err(Error::Config(
            "n_embd is a list but n_in is a single width".to_string(),
        )),
    }
}

/// Read a JSON config document from disk.
///
/// The result is passed to [`crate::BackboneRegistry::build`], which picks the
/// concrete config type from the backbone name.
pub fn read_json(path: impl AsRef<Path>) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&text)?)
}

fn check_arch(arch: &[usize]) -> Result<()> {
    if arch.len() != 3 {
        return Err(Error::Config(format!(
            "arch must have exactly 3 entries, got {}",
            arch.len()
        )));
    }
    Ok(())
}

fn check_kernel(n_embd_ks: usize) -> Result<()> {
    if n_embd_ks % 2 == 0 {
        return Err(Error::Config(format!(
            "n_embd_ks must be odd, got {n_embd_ks}"
        )));
    }
    Ok(())
}

fn check_scale_factor(scale_factor: usize) -> Result<()> {
    if scale_factor == 0 {
        return Err(Error::Config("scale_factor must be >= 1".to_string()));
    }
    Ok(())
}

/// Configuration of the conv + transformer backbone (`"convTransformer"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvTransformerConfig {
    /// Input feature width (or per-stream widths).
    pub n_in: FeatureWidths,
    /// Embedding width (or per-stream projected widths).
    pub n_embd: FeatureWidths,
    /// Attention heads.
    pub n_head: usize,
    /// Kernel size of the embedding convolutions.
    pub n_embd_ks: usize,
    /// Length of the absolute positional table.
    pub max_len: usize,
    /// `(#convs, #long-memory stages, #branch stages)`.
    pub arch: Vec<usize>,
    /// Local attention window per pyramid level; `<= 1` means global.
    pub mha_win_size: Vec<i64>,
    /// Temporal downsampling per branch stage.
    pub scale_factor: usize,
    /// Drop the embedding conv bias (a LayerNorm follows anyway).
    pub with_ln: bool,
    pub attn_pdrop: f64,
    pub proj_pdrop: f64,
    pub path_pdrop: f64,
    pub use_abs_pe: bool,
    pub use_rel_pe: bool,
}

impl Default for ConvTransformerConfig {
    fn default() -> Self {
        Self {
            n_in: FeatureWidths::Single(2048),
            n_embd: FeatureWidths::Single(512),
            n_head: 4,
            n_embd_ks: 3,
            max_len: 2304,
            arch: vec![2, 2, 5],
            mha_win_size: vec![-1; 6],
            scale_factor: 2,
            with_ln: false,
            attn_pdrop: 0.0,
            proj_pdrop: 0.0,
            path_pdrop: 0.0,
            use_abs_pe: false,
            use_rel_pe: false,
        }
    }
}

impl ConvTransformerConfig {
    /// Check structural constraints and resolve the stream layout.
    pub fn validate(&self) -> Result<ResolvedWidths> {
        check_arch(&self.arch)?;
        if self.mha_win_size.len() != 1 + self.arch[2] {
            return Err(Error::Config(format!(
                "mha_win_size must have {} entries (1 + branch stages), got {}",
                1 + self.arch[2],
                self.mha_win_size.len()
            )));
        }
        if self.arch[1] < 2 {
            return Err(Error::Config(format!(
                "arch[1] must be >= 2 for the long-memory path, got {}",
                self.arch[1]
            )));
        }
        check_kernel(self.n_embd_ks)?;
        check_scale_factor(self.scale_factor)?;
        let widths = resolve_widths(&self.n_in, &self.n_embd)?;
        if self.n_head == 0 || widths.n_embd % self.n_head != 0 {
            return Err(Error::Config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                widths.n_embd, self.n_head
            )));
        }
        if self.use_abs_pe && self.max_len == 0 {
            return Err(Error::Config(
                "max_len must be > 0 with absolute position embedding".to_string(),
            ));
        }
        Ok(widths)
    }

    /// Number of branch (downsampling) stages.
    pub fn branch_stages(&self) -> usize {
        self.arch.get(2).copied().unwrap_or_default()
    }

    /// Attention window for pyramid level `level`, if local.
    pub fn window(&self, level: usize) -> Option<usize> {
        match self.mha_win_size.get(level) {
            Some(&w) if w > 1 => Some(w as usize),
            _ => None,
        }
    }
}

/// Configuration of the conv-only backbone (`"conv"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvConfig {
    pub n_in: FeatureWidths,
    pub n_embd: FeatureWidths,
    pub n_embd_ks: usize,
    /// `(#embedding convs, #stem convs, #branch convs)`.
    pub arch: Vec<usize>,
    pub scale_factor: usize,
    /// Real LayerNorm after each embedding conv instead of identity.
    pub with_ln: bool,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            n_in: FeatureWidths::Single(2048),
            n_embd: FeatureWidths::Single(512),
            n_embd_ks: 3,
            arch: vec![2, 2, 5],
            scale_factor: 2,
            with_ln: false,
        }
    }
}

impl ConvConfig {
    pub fn validate(&self) -> Result<ResolvedWidths> {
        check_arch(&self.arch)?;
        check_kernel(self.n_embd_ks)?;
        check_scale_factor(self.scale_factor)?;
        resolve_widths(&self.n_in, &self.n_embd)
    }
}
