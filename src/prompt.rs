// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prompt analysis: rebuilding the padded attention context and locating
//! words inside it.
//!
//! Cross-attention heat tensors are indexed by context slot, not by word,
//! so attributing heat to a word means reconstructing the exact token
//! stream the UNet conditioned on: fixed-width chunks wrapped in
//! start/end markers, emphasis multipliers in parallel, padding included.
//! [`PromptAnalyzer`] does that reconstruction once per prompt;
//! [`PromptAnalyzer::calc_word_indices`] then maps a user's word to the
//! flat context slots its tokens occupy.

use std::sync::Arc;

use crate::error::{DaamError, Result};
use crate::tokenizer::{EmbeddingFix, EmbeddingUse, TextEncoder};

/// Content tokens per context block for CLIP-style encoders.
const CHUNK_LENGTH: usize = 75;

/// Context width of one block: chunk plus start and end markers.
const BLOCK_WIDTH: usize = CHUNK_LENGTH + 2;

/// Padded context size for a prompt of `token_length` content tokens.
///
/// Always a positive multiple of 77: one 77-slot block per started chunk
/// of 75 content tokens, and at least one block even for an empty prompt.
///
/// # Example
///
/// ```
/// use candle_daam::calc_context_size;
///
/// assert_eq!(calc_context_size(0), 77);
/// assert_eq!(calc_context_size(75), 77);
/// assert_eq!(calc_context_size(76), 154);
/// ```
#[must_use]
pub const fn calc_context_size(token_length: usize) -> usize {
    (token_length.saturating_sub(1) / CHUNK_LENGTH + 1) * BLOCK_WIDTH
}

/// Fill policy for trailing context slots when the final chunk runs short.
///
/// Hosts disagree on the filler: CLIP-lineage encoders repeat the end
/// marker, open-CLIP pads with 0. The policy only matters for encoders
/// that hand back unpadded chunks; pre-padded chunks never leave a gap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPadding {
    /// Repeat the end-of-context marker.
    #[default]
    EndMarker,
    /// Use the encoder's declared pad id.
    PadId,
    /// Fill with id 0.
    Zero,
}

/// Reconstruction of the padded, emphasis-weighted context for one prompt.
///
/// Cheap to clone; the encoder is shared behind an [`Arc`] so heatmap
/// objects can carry their analyzer around.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use candle_daam::tokenizer::{PromptChunk, TextEncoder, TokenizedLine};
/// use candle_daam::{ChunkPadding, PromptAnalyzer};
///
/// /// Encodes every word to its first byte; good enough for a demo.
/// struct Words;
///
/// impl TextEncoder for Words {
///     fn tokenize_line(&self, line: &str) -> candle_daam::Result<TokenizedLine> {
///         let tokens = self.encode_word(line)?;
///         let token_count = tokens.len();
///         let multipliers = vec![1.0; token_count];
///         Ok(TokenizedLine {
///             chunks: vec![PromptChunk { tokens, multipliers, fixes: vec![] }],
///             token_count,
///             ..TokenizedLine::default()
///         })
///     }
///     fn encode_word(&self, text: &str) -> candle_daam::Result<Vec<u32>> {
///         Ok(text
///             .split_whitespace()
///             .map(|w| w.bytes().next().map_or(0, u32::from))
///             .collect())
///     }
///     fn id_start(&self) -> u32 { 500 }
///     fn id_end(&self) -> u32 { 501 }
/// }
///
/// # fn main() -> candle_daam::Result<()> {
/// let analyzer = PromptAnalyzer::new(Arc::new(Words), "a cat on a mat", ChunkPadding::default())?;
/// assert_eq!(analyzer.context_size(), 77);
///
/// // slot 0 is the start marker, so "cat" sits at flat index 2
/// let (indices, _) = analyzer.calc_word_indices("cat", -1, 0)?;
/// assert_eq!(indices, vec![2]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PromptAnalyzer {
    encoder: Arc<dyn TextEncoder>,
    padding: ChunkPadding,
    text: String,
    tokens: Vec<u32>,
    multipliers: Vec<f32>,
    token_count: usize,
    used_custom_terms: Vec<EmbeddingUse>,
    comments: Vec<String>,
    fixes: Vec<EmbeddingFix>,
}

impl PromptAnalyzer {
    /// Tokenize `text` and assemble the full padded context.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Config`] for encoders using the legacy
    /// emphasis implementation (it repeats tokens and breaks positional
    /// alignment), and [`DaamError::Tokenizer`] when encoding fails.
    pub fn new(
        encoder: Arc<dyn TextEncoder>,
        text: impl Into<String>,
        padding: ChunkPadding,
    ) -> Result<Self> {
        if encoder.uses_legacy_emphasis() {
            return Err(DaamError::Config(
                "the legacy emphasis implementation repeats tokens and cannot be \
                 aligned to context slots; disable it to trace attention"
                    .to_string(),
            ));
        }
        let text = text.into();
        let line = encoder.tokenize_line(&text)?;
        let chunk_length = encoder.chunk_length();

        let mut content: Vec<u32> = Vec::new();
        let mut content_multipliers: Vec<f32> = Vec::new();
        let mut fixes: Vec<EmbeddingFix> = Vec::new();
        for (chunk_idx, chunk) in line.chunks.iter().enumerate() {
            content.extend_from_slice(&chunk.tokens);
            content_multipliers.extend_from_slice(&chunk.multipliers);
            // remap chunk-relative offsets onto the flat content stream
            fixes.extend(chunk.fixes.iter().map(|f| EmbeddingFix {
                offset: chunk_idx * chunk_length + f.offset,
                name: f.name.clone(),
            }));
        }

        let fill_id = match padding {
            ChunkPadding::EndMarker => encoder.id_end(),
            ChunkPadding::PadId => encoder.id_pad(),
            ChunkPadding::Zero => 0,
        };
        let blocks = line.token_count.saturating_sub(1) / chunk_length + 1;
        let mut tokens = Vec::with_capacity(blocks * (chunk_length + 2));
        let mut multipliers = Vec::with_capacity(blocks * (chunk_length + 2));
        for i in 0..blocks {
            tokens.push(encoder.id_start());
            multipliers.push(1.0);
            let start = i * chunk_length;
            let end = usize::min(start + chunk_length, content.len());
            let taken = end.saturating_sub(start);
            if taken > 0 {
                tokens.extend_from_slice(&content[start..end]);
                multipliers.extend_from_slice(&content_multipliers[start..end]);
            }
            for _ in taken..chunk_length {
                tokens.push(fill_id);
                multipliers.push(1.0);
            }
            tokens.push(encoder.id_end());
            multipliers.push(1.0);
        }

        Ok(Self {
            encoder,
            padding,
            text,
            tokens,
            multipliers,
            token_count: line.token_count,
            used_custom_terms: line.used_custom_terms,
            comments: line.comments,
            fixes,
        })
    }

    /// Build a sibling analyzer for another prompt with the same encoder
    /// and padding policy.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`PromptAnalyzer::new`].
    pub fn for_text(&self, text: impl Into<String>) -> Result<Self> {
        Self::new(Arc::clone(&self.encoder), text, self.padding)
    }

    /// Map a word to the flat context slots its tokens occupy.
    ///
    /// The word is lowercased and encoded with the analyzer's own encoder.
    /// A single-token needle matches every equal context token; a
    /// multi-token needle only matches where all its tokens appear
    /// contiguously, which also means a word split across two context
    /// blocks never matches (the end/start markers interrupt it).
    ///
    /// `limit > 0` stops after that many matches; any other value scans
    /// the whole context. `start_pos` skips slots below it, so repeated
    /// calls can walk through occurrences.
    ///
    /// Returns the matched slot indices (empty when the word does not
    /// appear; that is a normal outcome) and the last scanned position.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Tokenizer`] when the needle fails to encode.
    pub fn calc_word_indices(
        &self,
        word: &str,
        limit: isize,
        start_pos: usize,
    ) -> Result<(Vec<usize>, usize)> {
        let needle = self.encoder.encode_word(&word.to_lowercase())?;
        if needle.is_empty() {
            return Ok((Vec::new(), start_pos));
        }

        let mut indices = Vec::new();
        let mut matched: isize = 0;
        let mut current_pos = 0;
        for (i, &token) in self.tokens.iter().enumerate() {
            current_pos = i;
            if i < start_pos {
                continue;
            }
            if needle[0] == token && needle.len() > 1 {
                let mut next = i + 1;
                let mut success = true;
                for expected in &needle[1..] {
                    if self.tokens.get(next) != Some(expected) {
                        success = false;
                        break;
                    }
                    next += 1;
                }
                if success {
                    indices.extend(i..next);
                    matched += 1;
                    if limit > 0 && matched >= limit {
                        break;
                    }
                }
            } else if needle[0] == token {
                indices.push(i);
                matched += 1;
                if limit > 0 && matched >= limit {
                    break;
                }
            }
        }
        Ok((indices, current_pos))
    }

    /// True when the word names a custom term the prompt resolved to an
    /// embedding. Embeddings occupy reserved slots with no stable ids, so
    /// word lookups cannot land on them.
    #[must_use]
    pub fn has_custom_term(&self, word: &str) -> bool {
        self.used_custom_terms
            .iter()
            .any(|u| u.name.eq_ignore_ascii_case(word))
    }

    /// The prompt this analyzer was built from.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Padded context width; `tokens().len()` and `multipliers().len()`
    /// are always exactly this.
    #[must_use]
    pub fn context_size(&self) -> usize {
        self.tokens.len()
    }

    /// Content token count as the encoder reported it.
    #[must_use]
    pub const fn token_count(&self) -> usize {
        self.token_count
    }

    /// The assembled context token stream, markers and padding included.
    #[must_use]
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Emphasis multiplier per context slot, 1.0 on markers and padding.
    #[must_use]
    pub fn multipliers(&self) -> &[f32] {
        &self.multipliers
    }

    /// Custom terms the prompt used, for diagnostics.
    #[must_use]
    pub fn used_custom_terms(&self) -> &[EmbeddingUse] {
        &self.used_custom_terms
    }

    /// Encoder notes collected during tokenization.
    #[must_use]
    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    /// Embedding placements as flat content offsets.
    #[must_use]
    pub fn fixes(&self) -> &[EmbeddingFix] {
        &self.fixes
    }
}

impl std::fmt::Debug for PromptAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptAnalyzer")
            .field("text", &self.text)
            .field("context_size", &self.tokens.len())
            .field("token_count", &self.token_count)
            .field("padding", &self.padding)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
