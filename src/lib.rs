// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-daam
//!
//! Per-word cross-attention heatmaps for text-to-image diffusion
//! pipelines built on [candle](https://github.com/huggingface/candle).
//!
//! candle-daam implements diffusion attentive attribution maps (the
//! DAAM technique): while a pipeline denoises, its cross-attention
//! scores are captured per U-Net layer, aggregated over steps and heads,
//! and attributed back to the prompt words they attend to. The result is
//! one spatial heatmap per word, rendered as a captioned overlay on the
//! generated image.
//!
//! ## Workflow
//!
//! A [`DaamSession`] drives the whole pipeline through four host calls:
//!
//! 1. [`DaamSession::process`] at run start resets state and parses the
//!    attention word list from the [`DaamConfig`];
//! 2. [`DaamSession::process_batch`] analyzes the styled prompt into
//!    context-aligned token slots and hooks an attention trace through
//!    the host's [`TraceBackend`];
//! 3. [`DaamSession::on_image_saved`] computes the batch's
//!    [`GlobalHeatMap`]s once, then renders and records one overlay per
//!    word for each generated image;
//! 4. [`DaamSession::postprocess`] splices the recorded overlays and
//!    optional grids into the host's output list.
//!
//! The lower layers are usable on their own: [`PromptAnalyzer`] maps
//! words to context slots, [`GlobalHeatMap`] slices per-word heat out of
//! a captured attention tensor, and [`overlay_word_heat`] renders a
//! single overlay.
//!
//! ## Feature flags
//!
//! - **`clip`** (default) — bundled CLIP-style byte-pair text encoder
//!   backed by the `tokenizers` crate (`ClipTextEncoder`). Disable it to
//!   bring your own [`TextEncoder`].

#![deny(warnings)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod grid;
pub mod heatmap;
pub mod prompt;
pub mod render;
pub mod session;
pub mod tokenizer;
pub mod trace;

pub use config::DaamConfig;
pub use error::{DaamError, Result};
pub use grid::{compute_layout, make_grid, parse_color, resolve_layout, GridLayout, GridOpts};
pub use heatmap::{FilterMode, GlobalHeatMap, WordHeatMap};
pub use prompt::{calc_context_size, ChunkPadding, PromptAnalyzer};
pub use render::colormap::HeatColormap;
pub use render::{
    caption_band_height, overlay_word_heat, render_overlay, resize_to, OverlayOpts, CAPTION_HEIGHT,
};
pub use session::{
    BatchInfo, BatchOutput, DaamSession, HeatmapImageSet, ImageSaveParams, RunInfo,
};
pub use tokenizer::{EmbeddingFix, EmbeddingUse, PromptChunk, TextEncoder, TokenizedLine};
pub use trace::{
    AttentionTrace, TraceBackend, TraceController, TraceParams, UnetLayout,
    DEFAULT_VAE_SCALE_FACTOR,
};

#[cfg(feature = "clip")]
pub use tokenizer::clip::{ClipTextEncoder, SpecialIds};
