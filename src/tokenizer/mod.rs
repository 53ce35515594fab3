// SPDX-License-Identifier: MIT OR Apache-2.0

//! Text encoder abstraction: the seam between prompt analysis and a host's
//! conditioning stack.
//!
//! Diffusion hosts tokenize prompts into fixed-width chunks (75 content
//! tokens for CLIP-style encoders) with per-token emphasis multipliers.
//! [`TextEncoder`] exposes exactly that surface so [`crate::PromptAnalyzer`]
//! can reconstruct the padded context the UNet actually attended to. A
//! bundled [`clip::ClipTextEncoder`] implementation is available behind the
//! `clip` feature; hosts with their own conditioning code implement the
//! trait directly.

pub mod emphasis;

#[cfg(feature = "clip")]
pub mod clip;

use crate::error::Result;

/// One fixed-width chunk of encoded prompt, before start/end markers.
///
/// `tokens` holds content ids only; the analyzer wraps each chunk with the
/// encoder's start and end markers when assembling the full context.
/// `tokens` and `multipliers` are always the same length, at most
/// [`TextEncoder::chunk_length`].
#[derive(Debug, Clone, PartialEq)]
pub struct PromptChunk {
    /// Content token ids, no specials.
    pub tokens: Vec<u32>,
    /// Emphasis multiplier per token, 1.0 when unweighted.
    pub multipliers: Vec<f32>,
    /// Textual-inversion embeddings occupying slots in this chunk.
    pub fixes: Vec<EmbeddingFix>,
}

impl PromptChunk {
    /// An empty chunk.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tokens: Vec::new(),
            multipliers: Vec::new(),
            fixes: Vec::new(),
        }
    }
}

impl Default for PromptChunk {
    fn default() -> Self {
        Self::new()
    }
}

/// A textual-inversion embedding placed at a chunk-relative offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingFix {
    /// Slot offset inside the owning chunk.
    pub offset: usize,
    /// Embedding name as registered with the encoder.
    pub name: String,
}

/// Diagnostic record of a custom term the prompt used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingUse {
    /// Embedding name.
    pub name: String,
    /// Stable digest of the embedding, for infotext reporting.
    pub checksum: String,
}

/// Result of encoding one prompt line.
#[derive(Debug, Clone, Default)]
pub struct TokenizedLine {
    /// Fixed-width chunks in prompt order.
    pub chunks: Vec<PromptChunk>,
    /// Content token count as hosts report it: full chunks count
    /// `chunk_length` each, the final chunk counts its pre-padding length.
    pub token_count: usize,
    /// Custom terms the prompt resolved to embeddings.
    pub used_custom_terms: Vec<EmbeddingUse>,
    /// Human-readable notes the encoder wants surfaced (embedding usage,
    /// truncation warnings).
    pub comments: Vec<String>,
}

/// A host text encoder as seen by prompt analysis.
///
/// Implementations must tokenize the way the host's conditioning stack
/// does, or word lookups will land on the wrong context slots. The trait
/// is object-safe; analyzers hold `Arc<dyn TextEncoder>`.
pub trait TextEncoder: Send + Sync {
    /// Tokenize a prompt line into emphasis-weighted chunks.
    ///
    /// # Errors
    ///
    /// Returns [`crate::DaamError::Tokenizer`] when the underlying
    /// tokenizer fails.
    fn tokenize_line(&self, line: &str) -> Result<TokenizedLine>;

    /// Encode a bare word or phrase into content ids, no special tokens.
    ///
    /// Used for attention-word needles; must agree with the ids
    /// [`Self::tokenize_line`] produces for the same text.
    ///
    /// # Errors
    ///
    /// Returns [`crate::DaamError::Tokenizer`] when encoding fails.
    fn encode_word(&self, text: &str) -> Result<Vec<u32>>;

    /// Id of the start-of-context marker.
    fn id_start(&self) -> u32;

    /// Id of the end-of-context marker.
    fn id_end(&self) -> u32;

    /// Id used to pad short chunks. Defaults to the end marker, which is
    /// what CLIP-style hosts use; open-CLIP hosts pad with 0.
    fn id_pad(&self) -> u32 {
        self.id_end()
    }

    /// Content tokens per chunk. 75 for CLIP-style encoders.
    fn chunk_length(&self) -> usize {
        75
    }

    /// Whether the encoder implements the legacy emphasis scheme.
    ///
    /// Legacy emphasis re-weights by repeating tokens, which destroys the
    /// positional alignment heatmap attribution depends on; analyzers
    /// refuse such encoders.
    fn uses_legacy_emphasis(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
