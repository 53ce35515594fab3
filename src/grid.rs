// SPDX-License-Identifier: MIT OR Apache-2.0

//! Grid composition for heatmap overlay collections.
//!
//! Overlays for one image are combined into a single grid picture. The
//! layout is either roughly square ([`GridLayout::PreventEmpty`]) or one
//! row per batch lane ([`GridLayout::BatchLengthAsRow`]);
//! [`GridLayout::Auto`] picks between them from the batch shape.

use std::fmt;
use std::str::FromStr;

use image::RgbImage;

use crate::error::{DaamError, Result};

// ---------------------------------------------------------------------------
// Layout selection
// ---------------------------------------------------------------------------

/// Grid arrangement strategy.
///
/// The host exposes these as the setting strings `"Auto"`,
/// `"Prevent Empty Spot"` and `"Batch Length As Row"`; parsing any other
/// string is a configuration fault, so an invalid layout can never reach
/// composition time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GridLayout {
    /// [`GridLayout::PreventEmpty`] for single-image runs, otherwise
    /// [`GridLayout::BatchLengthAsRow`].
    #[default]
    #[serde(rename = "Auto")]
    Auto,
    /// Roughly square, with no fully empty trailing row.
    #[serde(rename = "Prevent Empty Spot")]
    PreventEmpty,
    /// One row per batch lane (or per word when layers run as rows).
    #[serde(rename = "Batch Length As Row")]
    BatchLengthAsRow,
}

impl fmt::Display for GridLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "Auto",
            Self::PreventEmpty => "Prevent Empty Spot",
            Self::BatchLengthAsRow => "Batch Length As Row",
        };
        f.write_str(name)
    }
}

impl FromStr for GridLayout {
    type Err = DaamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Auto" => Ok(Self::Auto),
            "Prevent Empty Spot" => Ok(Self::PreventEmpty),
            "Batch Length As Row" => Ok(Self::BatchLengthAsRow),
            other => Err(DaamError::Config(format!("unknown grid layout '{other}'"))),
        }
    }
}

/// Colors and layout for grid composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridOpts {
    /// Fill color for cells without an image.
    pub background: [u8; 3],
    /// Caption color carried through to overlay rendering.
    pub text_color: [u8; 3],
    /// Arrangement strategy.
    pub layout: GridLayout,
}

impl Default for GridOpts {
    fn default() -> Self {
        Self {
            background: [255, 255, 255],
            text_color: [0, 0, 0],
            layout: GridLayout::Auto,
        }
    }
}

/// Resolve [`GridLayout::Auto`] against the run's batch shape.
///
/// `images_per_batch` is `batch_size * n_iter`; a single-image run reads
/// best as a square grid, anything larger as one row per lane.
#[must_use]
pub const fn resolve_layout(layout: GridLayout, images_per_batch: usize) -> GridLayout {
    match layout {
        GridLayout::Auto => {
            if images_per_batch == 1 {
                GridLayout::PreventEmpty
            } else {
                GridLayout::BatchLengthAsRow
            }
        }
        other => other,
    }
}

/// Rows and columns for `n_images` under `layout`.
///
/// `row_length` is only consulted for [`GridLayout::BatchLengthAsRow`].
/// An unresolved [`GridLayout::Auto`] arranges like
/// [`GridLayout::PreventEmpty`]; callers normally go through
/// [`resolve_layout`] first.
#[must_use]
pub fn compute_layout(layout: GridLayout, n_images: usize, row_length: usize) -> (usize, usize) {
    if n_images == 0 {
        return (0, 0);
    }
    match layout {
        GridLayout::Auto | GridLayout::PreventEmpty => {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            #[allow(clippy::cast_sign_loss)]
            let rows = ((n_images as f64).sqrt().round() as usize).max(1);
            (rows, n_images.div_ceil(rows))
        }
        GridLayout::BatchLengthAsRow => {
            let cols = row_length.max(1);
            (n_images.div_ceil(cols), cols)
        }
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Paste `images` row-major into a `rows` x `cols` grid.
///
/// # Errors
///
/// Returns [`DaamError::Config`] when there are no images, the grid
/// cannot hold them all, or their dimensions differ.
pub fn make_grid(
    images: &[RgbImage],
    rows: usize,
    cols: usize,
    background: [u8; 3],
) -> Result<RgbImage> {
    let Some(first) = images.first() else {
        return Err(DaamError::Config("cannot grid zero images".to_string()));
    };
    if images.len() > rows * cols {
        return Err(DaamError::Config(format!(
            "{rows}x{cols} grid cannot hold {} images",
            images.len()
        )));
    }
    let (width, height) = first.dimensions();
    if let Some(odd) = images.iter().find(|img| img.dimensions() != (width, height)) {
        return Err(DaamError::Config(format!(
            "grid images must share dimensions, found {}x{} next to {width}x{height}",
            odd.width(),
            odd.height()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut canvas = RgbImage::from_pixel(
        cols as u32 * width,
        rows as u32 * height,
        image::Rgb(background),
    );
    for (idx, img) in images.iter().enumerate() {
        let x = (idx % cols) as i64 * i64::from(width);
        let y = (idx / cols) as i64 * i64::from(height);
        image::imageops::replace(&mut canvas, img, x, y);
    }
    Ok(canvas)
}

// ---------------------------------------------------------------------------
// Colors
// ---------------------------------------------------------------------------

/// Parse a color setting: a named color or `#rrggbb`.
///
/// # Errors
///
/// Returns [`DaamError::Config`] for names and hex strings it does not
/// recognize.
pub fn parse_color(name: &str) -> Result<[u8; 3]> {
    let trimmed = name.trim();
    if let Some(hex) = trimmed.strip_prefix('#') {
        if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            let parse = |s| u8::from_str_radix(s, 16);
            return Ok([
                parse(&hex[0..2]).map_err(|e| DaamError::Config(e.to_string()))?,
                parse(&hex[2..4]).map_err(|e| DaamError::Config(e.to_string()))?,
                parse(&hex[4..6]).map_err(|e| DaamError::Config(e.to_string()))?,
            ]);
        }
        return Err(DaamError::Config(format!("invalid hex color '{trimmed}'")));
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "white" => Ok([255, 255, 255]),
        "black" => Ok([0, 0, 0]),
        "red" => Ok([255, 0, 0]),
        "green" => Ok([0, 128, 0]),
        "lime" => Ok([0, 255, 0]),
        "blue" => Ok([0, 0, 255]),
        "yellow" => Ok([255, 255, 0]),
        "cyan" => Ok([0, 255, 255]),
        "magenta" => Ok([255, 0, 255]),
        "gray" | "grey" => Ok([128, 128, 128]),
        "orange" => Ok([255, 165, 0]),
        other => Err(DaamError::Config(format!("unknown color '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
