//! Backbone lookup by name.
//!
//! Constructors are registered explicitly; nothing is added as a side effect
//! of loading a module. [`BackboneRegistry::with_builtin`] registers the two
//! architectures this crate ships.

use std::collections::BTreeMap;
use std::fmt;

use candle_nn::VarBuilder;

use crate::config::{ConvConfig, ConvTransformerConfig};
use crate::model::backbone::{Backbone, ConvBackbone, ConvTransformerBackbone};
use crate::{Error, Result};

/// Whether constructed weights are freshly initialized or already trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightInit {
    /// Run the initialization pass (zero linear/conv biases).
    #[default]
    Fresh,
    /// Keep the values provided by the `VarBuilder` untouched.
    Pretrained,
}

/// Constructor: JSON config + variables → backbone.
pub type BuildFn = fn(&serde_json::Value, VarBuilder<'_>, WeightInit) -> Result<Box<dyn Backbone>>;

/// Name → constructor map.
#[derive(Clone, Default)]
pub struct BackboneRegistry {
    builders: BTreeMap<&'static str, BuildFn>,
}

impl fmt::Debug for BackboneRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.builders.keys()).finish()
    }
}

impl BackboneRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `"convTransformer"` and `"conv"`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.builders.insert("convTransformer", build_conv_transformer);
        registry.builders.insert("conv", build_conv);
        registry
    }

    /// Register `builder` under `name`. Names are unique.
    pub fn register(&mut self, name: &'static str, builder: BuildFn) -> Result<()> {
        if self.builders.contains_key(name) {
            return Err(Error::Config(format!(
                "backbone {name:?} is already registered"
            )));
        }
        self.builders.insert(name, builder);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.builders.keys().copied()
    }

    /// Construct the backbone registered as `name`.
    pub fn build(
        &self,
        name: &str,
        config: &serde_json::Value,
        vb: VarBuilder,
        init: WeightInit,
    ) -> Result<Box<dyn Backbone>> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| Error::UnknownBackbone(name.to_string()))?;
        tracing::debug!(name, ?init, "building backbone");
        builder(config, vb, init)
    }
}

fn build_conv_transformer(
    config: &serde_json::Value,
    vb: VarBuilder,
    init: WeightInit,
) -> Result<Box<dyn Backbone>> {
    let cfg: ConvTransformerConfig = serde_json::from_value(config.clone())?;
    let backbone = match init {
        WeightInit::Fresh => ConvTransformerBackbone::new(&cfg, vb)?,
        WeightInit::Pretrained => ConvTransformerBackbone::load(&cfg, vb)?,
    };
    Ok(Box::new(backbone))
}

fn build_conv(
    config: &serde_json::Value,
    vb: VarBuilder,
    init: WeightInit,
) -> Result<Box<dyn Backbone>> {
    let cfg: ConvConfig = serde_json::from_value(config.clone())?;
    let backbone = match init {
        WeightInit::Fresh => ConvBackbone::new(&cfg, vb)?,
        WeightInit::Pretrained => ConvBackbone::load(&cfg, vb)?,
    };
    Ok(Box::new(backbone))
}
