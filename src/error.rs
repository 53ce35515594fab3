// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-daam.

/// Errors that can occur while building or rendering attention heatmaps.
#[derive(Debug, thiserror::Error)]
pub enum DaamError {
    /// Tensor construction or reduction error (wraps candle).
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Image decode, encode, or buffer error (wraps the image crate).
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Invalid user-facing configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// Text encoder or tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Trace lifecycle violation or tracer failure.
    #[error("trace error: {0}")]
    Trace(String),

    /// An attention word has no aligned token span in the prompt.
    #[error("no token span for word `{word}`")]
    WordNotFound {
        /// The word as the user requested it.
        word: String,
    },

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DaamError {
    /// True when the error is a recoverable per-word lookup miss.
    #[must_use]
    pub const fn is_word_not_found(&self) -> bool {
        matches!(self, Self::WordNotFound { .. })
    }
}

/// Result type alias for candle-daam operations.
pub type Result<T> = std::result::Result<T, DaamError>;
