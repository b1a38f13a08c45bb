//! Error types for temporal-backbones.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration, caught while constructing a module.
    #[error("config: {0}")]
    Config(String),

    /// Input tensor does not have the shape the module was built for.
    #[error("shape: {0}")]
    Shape(String),

    /// Training-time input longer than the positional table.
    #[error("sequence length {len} exceeds max_len {max_len} in training")]
    SequenceTooLong { len: usize, max_len: usize },

    /// No backbone registered under this name.
    #[error("unknown backbone: {0}")]
    UnknownBackbone(String),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
