// SPDX-License-Identifier: MIT OR Apache-2.0

//! Heat tensors and their reduction to per-word spatial maps.
//!
//! A tracer hands back one aggregated cross-attention tensor per batch,
//! shaped `[batch, context_tokens, w, h]` in the latent grid's
//! column-major orientation. [`GlobalHeatMap`] pairs that tensor with the
//! [`PromptAnalyzer`] that knows where each word's tokens sit, and
//! [`GlobalHeatMap::compute_word_heat_map`] averages the matching token
//! channels into a single 2D [`WordHeatMap`].

use candle_core::{DType, Tensor};

use crate::error::{DaamError, Result};
use crate::prompt::PromptAnalyzer;

/// Interpolation used when expanding a latent-resolution map to pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Nearest neighbor; blocky but exact.
    Nearest,
    /// Bilinear, matching how hosts upsample latent maps for display.
    #[default]
    Bilinear,
}

/// Aggregated cross-attention heat for one prompt, all words.
///
/// Produced once per batch from the traced attention; per-word maps are
/// derived views. When per-layer tracing is on there is one of these per
/// UNet layer, tagged with [`GlobalHeatMap::layer`].
pub struct GlobalHeatMap {
    analyzer: PromptAnalyzer,
    layer: Option<usize>,
    heat: Tensor,
}

impl GlobalHeatMap {
    /// Wrap a traced heat tensor.
    ///
    /// `heat` must be `[batch, context_tokens, w, h]` with the token
    /// dimension equal to the analyzer's context size; any dtype is
    /// accepted and converted to f32.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Trace`] when the shape does not line up with
    /// the analyzer's context.
    pub fn new(analyzer: PromptAnalyzer, layer: Option<usize>, heat: Tensor) -> Result<Self> {
        let (_, tokens, _, _) = heat.dims4()?;
        if tokens != analyzer.context_size() {
            return Err(DaamError::Trace(format!(
                "heat tensor has {tokens} token channels but the prompt context is {}",
                analyzer.context_size()
            )));
        }
        let heat = heat.to_dtype(DType::F32)?;
        Ok(Self {
            analyzer,
            layer,
            heat,
        })
    }

    /// Average the context channels belonging to `word` for one image.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::WordNotFound`] when the word has no aligned
    /// token span: it does not occur in the prompt, encodes to nothing, or
    /// names a custom embedding term (those occupy reserved slots with no
    /// stable ids). Returns [`DaamError::Trace`] for a batch index outside
    /// the traced batch.
    pub fn compute_word_heat_map(&self, word: &str, batch_idx: usize) -> Result<WordHeatMap> {
        if self.analyzer.has_custom_term(word) {
            return Err(DaamError::WordNotFound {
                word: word.to_string(),
            });
        }
        let (indices, _) = self.analyzer.calc_word_indices(word, -1, 0)?;
        if indices.is_empty() {
            return Err(DaamError::WordNotFound {
                word: word.to_string(),
            });
        }

        let (batch, _, _, _) = self.heat.dims4()?;
        if batch_idx >= batch {
            return Err(DaamError::Trace(format!(
                "batch index {batch_idx} out of range for traced batch of {batch}"
            )));
        }
        let per_image = self.heat.narrow(0, batch_idx, 1)?.squeeze(0)?;

        let mut channels = Vec::with_capacity(indices.len());
        for &idx in &indices {
            channels.push(per_image.narrow(0, idx, 1)?);
        }
        let heat = Tensor::cat(&channels, 0)?.mean(0)?;
        Ok(WordHeatMap {
            word: word.to_string(),
            heat,
        })
    }

    /// The prompt the heat was traced for.
    #[must_use]
    pub fn prompt(&self) -> &str {
        self.analyzer.text()
    }

    /// UNet layer index when traced per-layer, `None` for the aggregate.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        self.layer
    }

    /// Number of images in the traced batch.
    ///
    /// # Errors
    ///
    /// Returns the underlying candle error if the tensor shape degraded,
    /// which cannot happen for values built through [`GlobalHeatMap::new`].
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.heat.dims4()?.0)
    }

    /// The analyzer this map was built with.
    #[must_use]
    pub const fn analyzer(&self) -> &PromptAnalyzer {
        &self.analyzer
    }
}

impl std::fmt::Debug for GlobalHeatMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalHeatMap")
            .field("prompt", &self.analyzer.text())
            .field("layer", &self.layer)
            .field("shape", &self.heat.dims())
            .finish_non_exhaustive()
    }
}

/// One word's spatial attention map at latent resolution.
///
/// The tensor keeps the tracer's column-major `[w, h]` orientation;
/// [`WordHeatMap::expand_to`] transposes to row-major while upscaling so
/// the result drops straight onto image memory.
#[derive(Debug, Clone)]
pub struct WordHeatMap {
    word: String,
    heat: Tensor,
}

impl WordHeatMap {
    /// Wrap a precomputed per-word map.
    ///
    /// `heat` keeps the tracer's column-major `[w, h]` orientation, as
    /// produced by [`GlobalHeatMap::compute_word_heat_map`].
    #[must_use]
    pub const fn new(word: String, heat: Tensor) -> Self {
        Self { word, heat }
    }

    /// The word this map belongs to.
    #[must_use]
    pub fn word(&self) -> &str {
        &self.word
    }

    /// Latent-grid width.
    ///
    /// # Errors
    ///
    /// Propagates candle shape errors; maps built by
    /// [`GlobalHeatMap::compute_word_heat_map`] are always rank 2.
    pub fn width(&self) -> Result<usize> {
        Ok(self.heat.dims2()?.0)
    }

    /// Latent-grid height.
    ///
    /// # Errors
    ///
    /// Propagates candle shape errors.
    pub fn height(&self) -> Result<usize> {
        Ok(self.heat.dims2()?.1)
    }

    /// Upscale to `target_w` x `target_h` pixels.
    ///
    /// Returns row-major values, `target_h` rows of `target_w`, matching
    /// image memory order.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Trace`] for zero target dimensions and
    /// propagates candle errors reading the tensor.
    pub fn expand_to(
        &self,
        target_w: usize,
        target_h: usize,
        filter: FilterMode,
    ) -> Result<Vec<f32>> {
        if target_w == 0 || target_h == 0 {
            return Err(DaamError::Trace(
                "cannot expand a heat map to zero pixels".to_string(),
            ));
        }
        // transpose once so the scaling loops run in image order
        let rows: Vec<Vec<f32>> = self.heat.t()?.contiguous()?.to_vec2()?;
        let src_h = rows.len();
        let src_w = rows.first().map_or(0, Vec::len);
        if src_h == 0 || src_w == 0 {
            return Err(DaamError::Trace("empty heat map".to_string()));
        }

        let mut out = Vec::with_capacity(target_w * target_h);
        match filter {
            FilterMode::Nearest => {
                for oy in 0..target_h {
                    let sy = (oy * src_h / target_h).min(src_h - 1);
                    for ox in 0..target_w {
                        let sx = (ox * src_w / target_w).min(src_w - 1);
                        out.push(rows[sy][sx]);
                    }
                }
            }
            FilterMode::Bilinear => {
                #[allow(clippy::cast_precision_loss)]
                for oy in 0..target_h {
                    let src_y = ((oy as f32 + 0.5) * src_h as f32 / target_h as f32 - 0.5)
                        .clamp(0.0, src_h as f32 - 1.0);
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let y0 = src_y.floor() as usize;
                    let y1 = (y0 + 1).min(src_h - 1);
                    let fy = src_y - y0 as f32;
                    for ox in 0..target_w {
                        let src_x = ((ox as f32 + 0.5) * src_w as f32 / target_w as f32 - 0.5)
                            .clamp(0.0, src_w as f32 - 1.0);
                        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                        let x0 = src_x.floor() as usize;
                        let x1 = (x0 + 1).min(src_w - 1);
                        let fx = src_x - x0 as f32;
                        let top = rows[y0][x0] * (1.0 - fx) + rows[y0][x1] * fx;
                        let bottom = rows[y1][x0] * (1.0 - fx) + rows[y1][x1] * fx;
                        out.push(top * (1.0 - fy) + bottom * fy);
                    }
                }
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
