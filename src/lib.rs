//! Temporal feature-pyramid backbones in pure Rust.
//!
//! A candle-based implementation of the masked 1-D backbones used by
//! temporal action localization heads. Inputs are `[B, C, T]` feature
//! sequences with a `[B, 1, T]` validity mask; outputs are multi-scale
//! pyramids of `(features, mask)` pairs.
//!
//! ## Architecture
//!
//! ```text
//! features ──→ (per-stream projection) ──→ conv embedding
//!                                               ↓
//!                          stem / long-memory summary
//!                                               ↓
//!              branch stages, each halving T → pyramid level
//! ```
//!
//! ## Modules
//!
//! - [`config`] — serde configs and validation
//! - [`model`] — building blocks and the two backbones
//! - [`registry`] — name → constructor map (`"convTransformer"`, `"conv"`)

pub mod config;
pub mod model;
pub mod registry;

mod error;

pub use error::{Error, Result};
pub use model::backbone::{Backbone, ConvBackbone, ConvTransformerBackbone, Pyramid};
pub use registry::BackboneRegistry;
