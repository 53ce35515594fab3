// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bundled CLIP-style text encoder backed by the `tokenizers` crate.
//!
//! Reproduces the chunking behavior of mainstream diffusion hosts: prompts
//! are emphasis-parsed, encoded without special tokens, and streamed into
//! 75-slot chunks with comma-aware backtracking so clauses are not split
//! mid-phrase. Textual-inversion embeddings can be registered by name and
//! reserve their vector width inside the chunk they land in.

use std::path::Path;

use crate::error::{DaamError, Result};
use crate::tokenizer::emphasis::{parse_prompt_attention, BREAK_WEIGHT};
use crate::tokenizer::{EmbeddingFix, EmbeddingUse, PromptChunk, TextEncoder, TokenizedLine};

/// Marker token ids a CLIP-style encoder wraps and pads context with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialIds {
    /// Start-of-context marker.
    pub start: u32,
    /// End-of-context marker.
    pub end: u32,
    /// Padding id for short chunks.
    pub pad: u32,
}

impl SpecialIds {
    /// Ids used by the original CLIP vocabulary (SD 1.x lineage), which
    /// pads with the end marker.
    #[must_use]
    pub const fn clip() -> Self {
        Self {
            start: 49406,
            end: 49407,
            pad: 49407,
        }
    }

    /// Ids used by open-CLIP checkpoints (SD 2.x lineage), which pad
    /// with 0.
    #[must_use]
    pub const fn open_clip() -> Self {
        Self {
            start: 49406,
            end: 49407,
            pad: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct RegisteredEmbedding {
    name: String,
    ids: Vec<u32>,
    vectors: usize,
    checksum: String,
}

/// [`TextEncoder`] implementation over a `tokenizers::Tokenizer`.
pub struct ClipTextEncoder {
    tokenizer: Box<tokenizers::Tokenizer>,
    ids: SpecialIds,
    chunk_length: usize,
    comma_token: Option<u32>,
    comma_padding_backtrack: usize,
    embeddings: Vec<RegisteredEmbedding>,
}

impl ClipTextEncoder {
    /// Wrap an already-loaded tokenizer.
    ///
    /// The comma token is looked up in the vocabulary (`,</w>` for CLIP
    /// BPE, plain `,` otherwise) to drive comma backtracking; absence
    /// simply disables that behavior.
    #[must_use]
    pub fn new(tokenizer: tokenizers::Tokenizer, ids: SpecialIds) -> Self {
        let vocab = tokenizer.get_vocab(true);
        let comma_token = vocab.get(",</w>").or_else(|| vocab.get(",")).copied();
        Self {
            tokenizer: Box::new(tokenizer),
            ids,
            chunk_length: 75,
            comma_token,
            comma_padding_backtrack: 20,
            embeddings: Vec::new(),
        }
    }

    /// Load a tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Tokenizer`] if the file cannot be loaded or
    /// parsed.
    pub fn from_file(path: impl AsRef<Path>, ids: SpecialIds) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            DaamError::Tokenizer(format!(
                "failed to load tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::new(tokenizer, ids))
    }

    /// Set how far back a chunk break may move to land after a comma.
    /// 0 disables comma backtracking.
    #[must_use]
    pub const fn with_comma_backtrack(mut self, slots: usize) -> Self {
        self.comma_padding_backtrack = slots;
        self
    }

    /// Register a textual-inversion embedding.
    ///
    /// `vectors` is the number of context slots the embedding occupies.
    /// When the prompt contains the name, those slots are reserved and
    /// reported through [`TokenizedLine::used_custom_terms`].
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Tokenizer`] if the name does not encode or the
    /// vector count does not fit in one chunk.
    pub fn register_embedding(&mut self, name: &str, vectors: usize) -> Result<()> {
        if vectors == 0 || vectors > self.chunk_length {
            return Err(DaamError::Tokenizer(format!(
                "embedding `{name}` must occupy between 1 and {} slots, got {vectors}",
                self.chunk_length
            )));
        }
        let ids = self.encode_word(name)?;
        if ids.is_empty() {
            return Err(DaamError::Tokenizer(format!(
                "embedding `{name}` encodes to no tokens"
            )));
        }
        self.embeddings.push(RegisteredEmbedding {
            name: name.to_string(),
            checksum: format!("{:08x}", fnv1a(name.as_bytes())),
            ids,
            vectors,
        });
        Ok(())
    }

    /// Longest registered embedding whose id sequence starts at `stream`.
    fn find_embedding(&self, stream: &[u32]) -> Option<&RegisteredEmbedding> {
        self.embeddings
            .iter()
            .filter(|e| stream.starts_with(&e.ids))
            .max_by_key(|e| e.ids.len())
    }
}

impl TextEncoder for ClipTextEncoder {
    fn tokenize_line(&self, line: &str) -> Result<TokenizedLine> {
        let mut stream = ChunkStream::new(self.chunk_length, self.ids.pad);
        let mut used: Vec<EmbeddingUse> = Vec::new();

        for (text, weight) in parse_prompt_attention(line) {
            #[allow(clippy::float_cmp)]
            if text == "BREAK" && weight == BREAK_WEIGHT {
                stream.next_chunk(false);
                continue;
            }
            let ids = self.encode_word(&text)?;
            let mut j = 0;
            while j < ids.len() {
                let token = ids[j];
                if Some(token) == self.comma_token {
                    stream.mark_comma();
                } else if self.comma_padding_backtrack != 0 {
                    stream.backtrack_on_comma(self.comma_padding_backtrack);
                }
                stream.close_if_full();

                match self.find_embedding(&ids[j..]) {
                    None => {
                        stream.push(token, weight);
                        j += 1;
                    }
                    Some(embedding) => {
                        stream.push_embedding(embedding, weight);
                        if !used.iter().any(|u| u.name == embedding.name) {
                            used.push(EmbeddingUse {
                                name: embedding.name.clone(),
                                checksum: embedding.checksum.clone(),
                            });
                        }
                        j += embedding.ids.len();
                    }
                }
            }
        }

        let (chunks, token_count) = stream.finish();
        let comments = if used.is_empty() {
            Vec::new()
        } else {
            let listed: Vec<String> = used
                .iter()
                .map(|u| format!("{} ({})", u.name, u.checksum))
                .collect();
            vec![format!("Used embeddings: {}", listed.join(", "))]
        };
        Ok(TokenizedLine {
            chunks,
            token_count,
            used_custom_terms: used,
            comments,
        })
    }

    fn encode_word(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| DaamError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn id_start(&self) -> u32 {
        self.ids.start
    }

    fn id_end(&self) -> u32 {
        self.ids.end
    }

    fn id_pad(&self) -> u32 {
        self.ids.pad
    }

    fn chunk_length(&self) -> usize {
        self.chunk_length
    }
}

impl std::fmt::Debug for ClipTextEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipTextEncoder")
            .field("ids", &self.ids)
            .field("chunk_length", &self.chunk_length)
            .field("comma_token", &self.comma_token)
            .field("embeddings", &self.embeddings.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Chunk assembly
// ---------------------------------------------------------------------------

/// Builds fixed-width chunks the way host conditioning code does.
///
/// `token_count` follows the host convention: chunks closed mid-stream
/// count a full `chunk_length` even when comma backtracking shortened
/// them, the final chunk counts its real length.
struct ChunkStream {
    chunk_length: usize,
    pad: u32,
    chunks: Vec<PromptChunk>,
    chunk: PromptChunk,
    token_count: usize,
    last_comma: Option<usize>,
}

impl ChunkStream {
    fn new(chunk_length: usize, pad: u32) -> Self {
        Self {
            chunk_length,
            pad,
            chunks: Vec::new(),
            chunk: PromptChunk::new(),
            token_count: 0,
            last_comma: None,
        }
    }

    fn next_chunk(&mut self, is_last: bool) {
        self.token_count += if is_last {
            self.chunk.tokens.len()
        } else {
            self.chunk_length
        };
        while self.chunk.tokens.len() < self.chunk_length {
            self.chunk.tokens.push(self.pad);
            self.chunk.multipliers.push(1.0);
        }
        self.last_comma = None;
        self.chunks.push(std::mem::take(&mut self.chunk));
    }

    /// Record that the next pushed token is a comma.
    fn mark_comma(&mut self) {
        self.last_comma = Some(self.chunk.tokens.len());
    }

    /// When the chunk is full and a comma sits within `backtrack` slots of
    /// the end, move everything after the comma into a fresh chunk so the
    /// clause stays together.
    fn backtrack_on_comma(&mut self, backtrack: usize) {
        let Some(last_comma) = self.last_comma else {
            return;
        };
        if self.chunk.tokens.len() != self.chunk_length
            || self.chunk.tokens.len() - last_comma > backtrack
        {
            return;
        }
        let break_location = last_comma + 1;
        let reloc_tokens = self.chunk.tokens.split_off(break_location);
        let reloc_multipliers = self.chunk.multipliers.split_off(break_location);
        self.next_chunk(false);
        self.chunk.tokens = reloc_tokens;
        self.chunk.multipliers = reloc_multipliers;
    }

    fn close_if_full(&mut self) {
        if self.chunk.tokens.len() == self.chunk_length {
            self.next_chunk(false);
        }
    }

    fn push(&mut self, token: u32, multiplier: f32) {
        self.chunk.tokens.push(token);
        self.chunk.multipliers.push(multiplier);
    }

    fn push_embedding(&mut self, embedding: &RegisteredEmbedding, multiplier: f32) {
        if self.chunk.tokens.len() + embedding.vectors > self.chunk_length {
            self.next_chunk(false);
        }
        self.chunk.fixes.push(EmbeddingFix {
            offset: self.chunk.tokens.len(),
            name: embedding.name.clone(),
        });
        for _ in 0..embedding.vectors {
            self.push(0, multiplier);
        }
    }

    fn finish(mut self) -> (Vec<PromptChunk>, usize) {
        if !self.chunk.tokens.is_empty() || self.chunks.is_empty() {
            self.next_chunk(true);
        }
        (self.chunks, self.token_count)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ---------------------------------------------------------------------------
