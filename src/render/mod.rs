// SPDX-License-Identifier: MIT OR Apache-2.0

//! Overlay rendering: heat values to colorized images.
//!
//! The pipeline expands a per-word heat map to image resolution, maps it
//! through a colormap, alpha-blends it over the generated image, and
//! optionally stacks a caption band on top. Every step is deterministic;
//! the same heat map and options always produce the same pixels.
//!
//! # Example
//!
//! ```no_run
//! use candle_daam::{render_overlay, GlobalHeatMap, OverlayOpts};
//! use image::RgbImage;
//!
//! # fn demo(heat_map: &GlobalHeatMap, image: &RgbImage) -> candle_daam::Result<()> {
//! let opts = OverlayOpts::default();
//! if let Some(overlay) = render_overlay(heat_map, "cat", 0, image, &opts)? {
//!     overlay.save("cat_heatmap.png")?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod colormap;
pub mod font;

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use tracing::warn;

use crate::error::{DaamError, Result};
use crate::heatmap::{FilterMode, GlobalHeatMap, WordHeatMap};
use self::colormap::HeatColormap;

/// Height of the caption band in pixels, before `caption_scale`.
pub const CAPTION_HEIGHT: u32 = 40;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Rendering options for a heatmap overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayOpts {
    /// Blend strength of the colorized heat over the base image, in [0, 1].
    pub alpha: f32,
    /// Draw the attention word in a band above the image.
    pub show_caption: bool,
    /// Pixels to shave from every edge of both heat and image. Zero
    /// disables cropping.
    pub crop: u32,
    /// Normalize heat to its own min/max before colorizing. When false
    /// the raw values are clamped to [0, 1] instead.
    pub color_normalize: bool,
    /// Colormap applied to the normalized heat.
    pub colormap: HeatColormap,
    /// Final uniform resize of the finished overlay, in [0.1, 1.0].
    pub image_scale: f32,
    /// Multiplier on [`CAPTION_HEIGHT`] for the caption band.
    pub caption_scale: f32,
    /// Caption band fill color.
    pub background: [u8; 3],
    /// Caption text color.
    pub text_color: [u8; 3],
}

impl Default for OverlayOpts {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            show_caption: true,
            crop: 0,
            color_normalize: true,
            colormap: HeatColormap::Jet,
            image_scale: 1.0,
            caption_scale: 1.1,
            background: [255, 255, 255],
            text_color: [0, 0, 0],
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Render the overlay for one attention word from a batch heat map.
///
/// A word without a token span in the prompt is skipped: the miss is
/// logged and `Ok(None)` returned so callers can continue with the
/// remaining words. Every other failure propagates.
///
/// # Errors
///
/// Returns an error when the batch index is out of range, a tensor
/// operation fails, or the options are invalid (see
/// [`overlay_word_heat`]).
pub fn render_overlay(
    heat_map: &GlobalHeatMap,
    word: &str,
    batch_idx: usize,
    image: &RgbImage,
    opts: &OverlayOpts,
) -> Result<Option<RgbImage>> {
    let word_map = match heat_map.compute_word_heat_map(word, batch_idx) {
        Ok(map) => map,
        Err(err) if err.is_word_not_found() => {
            warn!(word, prompt = heat_map.prompt(), "word has no token span, skipping overlay");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };
    overlay_word_heat(&word_map, image, opts).map(Some)
}

/// Blend a single word heat map over `image`.
///
/// # Errors
///
/// Returns [`DaamError::Config`] when `crop` would consume the whole
/// image or `image_scale` falls outside [0.1, 1.0], and
/// [`DaamError::Tensor`] when reading the heat values fails.
pub fn overlay_word_heat(
    map: &WordHeatMap,
    image: &RgbImage,
    opts: &OverlayOpts,
) -> Result<RgbImage> {
    if !(0.1..=1.0).contains(&opts.image_scale) {
        return Err(DaamError::Config(format!(
            "image scale {} outside [0.1, 1.0]",
            opts.image_scale
        )));
    }
    let (width, height) = image.dimensions();
    let mut heat = map.expand_to(width as usize, height as usize, FilterMode::Bilinear)?;
    let mut base = image.clone();

    if opts.crop > 0 {
        if 2 * opts.crop >= width || 2 * opts.crop >= height {
            return Err(DaamError::Config(format!(
                "crop {} consumes the whole {width}x{height} image",
                opts.crop
            )));
        }
        heat = crop_field(&heat, width as usize, height as usize, opts.crop as usize);
        base = image::imageops::crop_imm(
            &base,
            opts.crop,
            opts.crop,
            width - 2 * opts.crop,
            height - 2 * opts.crop,
        )
        .to_image();
    }

    if opts.color_normalize {
        normalize(&mut heat);
    } else {
        for v in &mut heat {
            *v = v.clamp(0.0, 1.0);
        }
    }

    let mut out = blend(&base, &heat, opts);

    if opts.show_caption {
        out = add_caption(&out, map.word(), opts);
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    if (opts.image_scale - 1.0).abs() > f32::EPSILON {
        let (w, h) = out.dimensions();
        let scaled_w = ((w as f32 * opts.image_scale).round() as u32).max(1);
        let scaled_h = ((h as f32 * opts.image_scale).round() as u32).max(1);
        out = image::imageops::resize(&out, scaled_w, scaled_h, FilterType::Lanczos3);
    }
    Ok(out)
}

/// Resize an image to exact dimensions. Used when grids mix overlays
/// with differently-sized originals.
#[must_use]
pub fn resize_to(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    image::imageops::resize(image, width, height, FilterType::Lanczos3)
}

// ---------------------------------------------------------------------------
// Pipeline steps
// ---------------------------------------------------------------------------

fn crop_field(values: &[f32], width: usize, height: usize, crop: usize) -> Vec<f32> {
    let out_w = width - 2 * crop;
    let out_h = height - 2 * crop;
    let mut out = Vec::with_capacity(out_w * out_h);
    for y in 0..out_h {
        let start = (y + crop) * width + crop;
        out.extend_from_slice(&values[start..start + out_w]);
    }
    out
}

/// Rescale to [0, 1] over the field's own range. A flat field carries no
/// contrast and maps to all zeros; bilinear resampling wobbles flat
/// fields by a few ulps, so the flatness check is not exact equality.
fn normalize(values: &mut [f32]) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in values.iter() {
        min = min.min(v);
        max = max.max(v);
    }
    let range = max - min;
    if !range.is_finite() || range <= 1e-6 {
        values.fill(0.0);
        return;
    }
    for v in values.iter_mut() {
        *v = (*v - min) / range;
    }
}

fn blend(base: &RgbImage, heat: &[f32], opts: &OverlayOpts) -> RgbImage {
    let (width, height) = base.dimensions();
    let mut out = RgbImage::new(width, height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let t = heat[y as usize * width as usize + x as usize];
        let cover = (t * opts.alpha).clamp(0.0, 1.0);
        let color = opts.colormap.color(t);
        let src = base.get_pixel(x, y);
        for c in 0..3 {
            let mixed = f32::from(src[c]).mul_add(1.0 - cover, f32::from(color[c]) * cover);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                pixel[c] = mixed.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

fn add_caption(image: &RgbImage, word: &str, opts: &OverlayOpts) -> RgbImage {
    let (width, height) = image.dimensions();
    let band = caption_band_height(opts.caption_scale);
    let mut canvas = RgbImage::from_pixel(width, height + band, Rgb(opts.background));
    image::imageops::replace(&mut canvas, image, 0, i64::from(band));

    let scale = ((band / 14).max(1)) as usize;
    let text_w = font::text_width(word, scale);
    let text_h = font::text_height(scale);
    #[allow(clippy::cast_possible_wrap)]
    let x = (i64::from(width) - text_w as i64) / 2;
    #[allow(clippy::cast_possible_wrap)]
    let y = (i64::from(band) - text_h as i64) / 2;
    font::draw_text(&mut canvas, word, x, y, scale, Rgb(opts.text_color));
    canvas
}

/// Caption band height after scaling.
#[must_use]
pub fn caption_band_height(caption_scale: f32) -> u32 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        ((CAPTION_HEIGHT as f32 * caption_scale).round() as u32).max(1)
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn heat_map(word: &str, values: &[f32], w: usize, h: usize) -> WordHeatMap {
        // heat tensors arrive column-major [w, h]
        let heat = Tensor::from_vec(values.to_vec(), (w, h), &Device::Cpu).unwrap();
        WordHeatMap::new(word.to_owned(), heat)
    }

    fn flat_opts() -> OverlayOpts {
        OverlayOpts {
            show_caption: false,
            color_normalize: false,
            ..OverlayOpts::default()
        }
    }

    #[test]
    fn zero_heat_leaves_the_base_untouched() {
        let map = heat_map("cat", &[0.0; 4], 2, 2);
        let base = RgbImage::from_pixel(8, 8, image::Rgb([10, 200, 30]));
        let out = overlay_word_heat(&map, &base, &flat_opts()).unwrap();
        assert_eq!(out.dimensions(), (8, 8));
        assert!(out.pixels().all(|p| p.0 == [10, 200, 30]));
    }

    #[test]
    fn full_heat_paints_the_colormap() {
        let map = heat_map("cat", &[1.0; 4], 2, 2);
        let base = RgbImage::from_pixel(8, 8, image::Rgb([10, 200, 30]));
        let out = overlay_word_heat(&map, &base, &flat_opts()).unwrap();
        // jet at 1.0 is dark red
        assert!(out.pixels().all(|p| p.0 == [128, 0, 0]));
    }

    #[test]
    fn normalization_zeroes_a_flat_field() {
        let map = heat_map("cat", &[0.7; 4], 2, 2);
        let base = RgbImage::from_pixel(4, 4, image::Rgb([50, 50, 50]));
        let opts = OverlayOpts {
            show_caption: false,
            ..OverlayOpts::default()
        };
        let out = overlay_word_heat(&map, &base, &opts).unwrap();
        assert!(out.pixels().all(|p| p.0 == [50, 50, 50]));
    }

    #[test]
    fn caption_band_extends_the_canvas() {
        let map = heat_map("cat", &[0.0; 4], 2, 2);
        let base = RgbImage::from_pixel(64, 32, image::Rgb([0, 0, 0]));
        let opts = OverlayOpts {
            color_normalize: false,
            caption_scale: 1.0,
            ..OverlayOpts::default()
        };
        let out = overlay_word_heat(&map, &base, &opts).unwrap();
        assert_eq!(out.dimensions(), (64, 32 + CAPTION_HEIGHT));
        // band is filled with the background color
        assert_eq!(out.get_pixel(0, 0), &image::Rgb([255, 255, 255]));
        // image region is untouched below the band
        assert_eq!(out.get_pixel(0, CAPTION_HEIGHT), &image::Rgb([0, 0, 0]));
    }

    #[test]
    fn caption_scale_grows_the_band() {
        assert_eq!(caption_band_height(1.0), 40);
        assert_eq!(caption_band_height(1.1), 44);
        assert_eq!(caption_band_height(2.0), 80);
    }

    #[test]
    fn crop_shaves_every_edge() {
        let map = heat_map("cat", &[0.0; 4], 2, 2);
        let base = RgbImage::from_pixel(16, 12, image::Rgb([5, 5, 5]));
        let opts = OverlayOpts {
            crop: 2,
            show_caption: false,
            color_normalize: false,
            ..OverlayOpts::default()
        };
        let out = overlay_word_heat(&map, &base, &opts).unwrap();
        assert_eq!(out.dimensions(), (12, 8));
    }

    #[test]
    fn crop_consuming_the_image_is_rejected() {
        let map = heat_map("cat", &[0.0; 4], 2, 2);
        let base = RgbImage::from_pixel(8, 8, image::Rgb([0, 0, 0]));
        let opts = OverlayOpts {
            crop: 4,
            ..OverlayOpts::default()
        };
        let err = overlay_word_heat(&map, &base, &opts).unwrap_err();
        assert!(matches!(err, crate::DaamError::Config(_)));
    }

    #[test]
    fn image_scale_shrinks_the_output() {
        let map = heat_map("cat", &[0.0; 4], 2, 2);
        let base = RgbImage::from_pixel(40, 20, image::Rgb([0, 0, 0]));
        let opts = OverlayOpts {
            image_scale: 0.5,
            show_caption: false,
            color_normalize: false,
            ..OverlayOpts::default()
        };
        let out = overlay_word_heat(&map, &base, &opts).unwrap();
        assert_eq!(out.dimensions(), (20, 10));
    }

    #[test]
    fn out_of_range_scale_is_rejected() {
        let map = heat_map("cat", &[0.0; 4], 2, 2);
        let base = RgbImage::from_pixel(8, 8, image::Rgb([0, 0, 0]));
        let opts = OverlayOpts {
            image_scale: 0.05,
            ..OverlayOpts::default()
        };
        assert!(overlay_word_heat(&map, &base, &opts).is_err());
    }

    #[test]
    fn rendering_is_deterministic() {
        let values = [0.1, 0.9, 0.4, 0.6];
        let base = RgbImage::from_pixel(10, 10, image::Rgb([60, 90, 120]));
        let opts = OverlayOpts::default();
        let a = overlay_word_heat(&heat_map("cat", &values, 2, 2), &base, &opts).unwrap();
        let b = overlay_word_heat(&heat_map("cat", &values, 2, 2), &base, &opts).unwrap();
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn alpha_halves_the_blend() {
        let map = heat_map("cat", &[1.0; 4], 2, 2);
        let base = RgbImage::from_pixel(4, 4, image::Rgb([0, 0, 0]));
        let opts = OverlayOpts {
            alpha: 0.5,
            show_caption: false,
            color_normalize: false,
            ..OverlayOpts::default()
        };
        let out = overlay_word_heat(&map, &base, &opts).unwrap();
        // half of jet dark red over black
        assert!(out.pixels().all(|p| p.0 == [64, 0, 0]));
    }

    #[test]
    fn resize_helper_is_exact() {
        let img = RgbImage::from_pixel(10, 6, image::Rgb([1, 2, 3]));
        assert_eq!(resize_to(&img, 5, 3).dimensions(), (5, 3));
        assert_eq!(resize_to(&img, 10, 6).as_raw(), img.as_raw());
    }
}
