// SPDX-License-Identifier: MIT OR Apache-2.0

//! User-facing configuration and loose settings ingestion.
//!
//! [`DaamConfig`] mirrors the host's heatmap settings panel: which words
//! to trace, what to render, and how to arrange the results. Every field
//! has a default, so hosts can hand over sparse settings blobs and only
//! override what the user touched.
//!
//! # Usage
//!
//! ```
//! use candle_daam::DaamConfig;
//!
//! let blob = r#"{"attention_words": "cat, red ball", "alpha": 0.35}"#;
//! let json: serde_json::Value = serde_json::from_str(blob).unwrap();
//! let config = DaamConfig::from_json(&json).unwrap();
//! assert_eq!(config.attention_words(), vec!["cat", "red ball"]);
//! assert!(config.enabled);
//! ```

use serde_json::Value;

use crate::error::{DaamError, Result};
use crate::grid::{parse_color, GridLayout, GridOpts};
use crate::prompt::ChunkPadding;
use crate::render::colormap::HeatColormap;
use crate::render::OverlayOpts;

// ---------------------------------------------------------------------------
// DaamConfig
// ---------------------------------------------------------------------------

/// Heatmap settings as the host presents them.
///
/// The struct is serde-friendly in both directions; missing fields take
/// their defaults, unknown fields are ignored. Call
/// [`validate`](Self::validate) (or construct through
/// [`from_json`](Self::from_json)) before use.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)] // Settings panels legitimately have many toggles
pub struct DaamConfig {
    /// Master switch; a disabled config makes the session inert.
    pub enabled: bool,
    /// Comma-separated words to trace, e.g. `"cat, red ball"`.
    pub attention_words: String,
    /// Insert overlays into the host's output list.
    pub show_images: bool,
    /// Write overlay files next to the originals.
    pub save_images: bool,
    /// Draw the word above each overlay.
    pub show_caption: bool,
    /// Insert a grid of all overlays per seed.
    pub use_grid: bool,
    /// Write grid files to the host's grid directory.
    pub save_grid: bool,
    /// Also insert a per-image grid of overlays plus the original.
    pub grid_per_image: bool,
    /// Grid arrangement strategy.
    pub grid_layout: GridLayout,
    /// Grid and caption background color (name or `#rrggbb`).
    pub grid_background: String,
    /// Caption text color (name or `#rrggbb`).
    pub grid_text_color: String,
    /// Heatmap blend strength, in [0, 1].
    pub alpha: f32,
    /// Final overlay resize factor, in [0.1, 1.0].
    pub heatmap_image_scale: f32,
    /// One heatmap per UNet layer instead of a single aggregate.
    pub trace_each_layers: bool,
    /// Grid rows follow the word list instead of the batch lanes.
    pub layers_as_row: bool,
    /// Normalize heat to its own range before colorizing.
    pub color_normalize: bool,
    /// Colormap for the overlays.
    pub colormap: HeatColormap,
    /// Fill policy for the tail of the final encoder block.
    pub padding: ChunkPadding,
}

impl Default for DaamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attention_words: String::new(),
            show_images: true,
            save_images: true,
            show_caption: true,
            use_grid: false,
            save_grid: true,
            grid_per_image: true,
            grid_layout: GridLayout::Auto,
            grid_background: "white".to_string(),
            grid_text_color: "black".to_string(),
            alpha: 0.5,
            heatmap_image_scale: 1.0,
            trace_each_layers: false,
            layers_as_row: false,
            color_normalize: true,
            colormap: HeatColormap::Jet,
            padding: ChunkPadding::EndMarker,
        }
    }
}

impl DaamConfig {
    /// Parse a config from a loosely-typed settings blob.
    ///
    /// Missing fields default, unknown fields are ignored, and the result
    /// is validated.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Config`] for fields of the wrong type or
    /// values outside their ranges.
    pub fn from_json(value: &Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| DaamError::Config(format!("invalid settings: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check numeric ranges and color strings.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(DaamError::Config(format!(
                "alpha {} outside [0, 1]",
                self.alpha
            )));
        }
        if !(0.1..=1.0).contains(&self.heatmap_image_scale) {
            return Err(DaamError::Config(format!(
                "heatmap_image_scale {} outside [0.1, 1.0]",
                self.heatmap_image_scale
            )));
        }
        parse_color(&self.grid_background)?;
        parse_color(&self.grid_text_color)?;
        Ok(())
    }

    /// The attention word list: comma-split, trimmed, empties dropped.
    #[must_use]
    pub fn attention_words(&self) -> Vec<String> {
        self.attention_words
            .split(',')
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Grid composition options derived from this config.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Config`] when a color string does not parse.
    pub fn grid_opts(&self) -> Result<GridOpts> {
        Ok(GridOpts {
            background: parse_color(&self.grid_background)?,
            text_color: parse_color(&self.grid_text_color)?,
            layout: self.grid_layout,
        })
    }

    /// Overlay rendering options derived from this config.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Config`] when a color string does not parse.
    pub fn overlay_opts(&self) -> Result<OverlayOpts> {
        Ok(OverlayOpts {
            alpha: self.alpha,
            show_caption: self.show_caption,
            color_normalize: self.color_normalize,
            colormap: self.colormap,
            image_scale: self.heatmap_image_scale,
            background: parse_color(&self.grid_background)?,
            text_color: parse_color(&self.grid_text_color)?,
            ..OverlayOpts::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
