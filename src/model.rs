//! Model components.
//!
//! ## Components
//!
//! - [`blocks`] — masked conv, attention, transformer, conv and aggregation blocks
//! - [`backbone`] — the `convTransformer` and `conv` pyramid backbones

pub mod backbone;
pub mod blocks;
