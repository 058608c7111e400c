// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-infer.

/// Errors that can occur during inference state management.
#[derive(Debug, thiserror::Error)]
pub enum InferError {
    /// Tensor operation or resource-allocation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Invalid model configuration (unsupported family, malformed fields).
    #[error("config error: {0}")]
    Config(String),

    /// Cache misuse, such as a layer index out of range.
    ///
    /// A cache *miss* is never an error; misses are reported as `None`.
    #[error("cache error: {0}")]
    Cache(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-infer operations.
pub type Result<T> = std::result::Result<T, InferError>;
