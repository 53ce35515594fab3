// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session orchestration: wiring prompt analysis, tracing, rendering and
//! grid composition into the host's generation lifecycle.
//!
//! A [`DaamSession`] lives as long as the host keeps the feature loaded
//! and is driven by four calls per generation run:
//!
//! 1. [`process`](DaamSession::process) at run start, resetting state and
//!    parsing the attention word list;
//! 2. [`process_batch`](DaamSession::process_batch) per batch, analyzing
//!    the styled prompt and hooking the attention trace;
//! 3. [`on_image_saved`](DaamSession::on_image_saved) per generated
//!    image, computing heat maps once per batch and rendering overlays;
//! 4. [`postprocess`](DaamSession::postprocess) at run end, splicing
//!    overlays and grids into the host's output list.
//!
//! Per-word misses and tracer failures degrade to skipped overlays; only
//! configuration faults abort a run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::config::DaamConfig;
use crate::error::{DaamError, Result};
use crate::grid::{compute_layout, make_grid, resolve_layout};
use crate::heatmap::GlobalHeatMap;
use crate::prompt::PromptAnalyzer;
use crate::render::{render_overlay, resize_to};
use crate::tokenizer::TextEncoder;
use crate::trace::{TraceBackend, TraceController, TraceParams};

/// Host filename tags marking grid composites we must not overlay.
const HOST_GRID_TAGS: [&str; 2] = ["txt2img-grid", "img2img-grid"];

// ---------------------------------------------------------------------------
// Host-facing data types
// ---------------------------------------------------------------------------

/// Host capability snapshot for one generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunInfo {
    /// Whether the host writes every generated sample to disk. Overlay
    /// files sit next to the originals, so saving overlays without saved
    /// originals is a configuration fault.
    pub samples_save: bool,
}

impl Default for RunInfo {
    fn default() -> Self {
        Self { samples_save: true }
    }
}

/// One generation batch as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInfo {
    /// Prompt with the host's styles already applied.
    pub styled_prompt: String,
    /// Output width in pixels.
    pub width: usize,
    /// Output height in pixels.
    pub height: usize,
    /// Images per batch.
    pub batch_size: usize,
    /// Number of batches in the run.
    pub n_iter: usize,
    /// Generation seed per batch lane.
    pub seeds: Vec<i64>,
    /// Directory the host saves samples into.
    pub output_dir: PathBuf,
    /// Directory the host saves grids into.
    pub grid_dir: PathBuf,
}

/// One image-saved event from the host.
#[derive(Clone)]
pub struct ImageSaveParams {
    /// The image about to be saved.
    pub image: RgbImage,
    /// Where the host is saving it.
    pub filename: PathBuf,
    /// Index of the image within its batch.
    pub batch_index: usize,
}

impl std::fmt::Debug for ImageSaveParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSaveParams")
            .field("filename", &self.filename)
            .field("batch_index", &self.batch_index)
            .field("dimensions", &self.image.dimensions())
            .finish()
    }
}

/// The host's mutable output list that [`DaamSession::postprocess`]
/// splices into.
#[derive(Clone, Default)]
pub struct BatchOutput {
    /// All output images, originals last.
    pub images: Vec<RgbImage>,
    /// Info strings parallel to `images`.
    pub infotexts: Vec<String>,
    /// Index of the first original image in `images`.
    pub index_of_first_image: usize,
}

impl std::fmt::Debug for BatchOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOutput")
            .field("images", &self.images.len())
            .field("infotexts", &self.infotexts.len())
            .field("index_of_first_image", &self.index_of_first_image)
            .finish()
    }
}

/// Recorded overlays per generation seed, in insertion order.
pub type HeatmapImageSet = IndexMap<i64, Vec<RgbImage>>;

// ---------------------------------------------------------------------------
// DaamSession
// ---------------------------------------------------------------------------

/// Drives heatmap generation across a host's generation lifecycle.
pub struct DaamSession<B: TraceBackend> {
    backend: B,
    encoder: Arc<dyn TextEncoder>,
    config: DaamConfig,
    controller: TraceController,
    words: Vec<String>,
    active: bool,
    analyzer: Option<PromptAnalyzer>,
    batch: Option<BatchInfo>,
    global_maps: Vec<GlobalHeatMap>,
    heatmap_images: HeatmapImageSet,
    grid_seq: usize,
}

impl<B: TraceBackend> DaamSession<B> {
    /// Build a session around a trace backend and a text encoder.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Config`] when the config fails validation.
    pub fn new(backend: B, encoder: Arc<dyn TextEncoder>, config: DaamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            encoder,
            config,
            controller: TraceController::new(),
            words: Vec::new(),
            active: false,
            analyzer: None,
            batch: None,
            global_maps: Vec::new(),
            heatmap_images: HeatmapImageSet::new(),
            grid_seq: 0,
        })
    }

    /// Whether the current run produces heatmaps.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// The attention words parsed for the current run.
    #[must_use]
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Overlays recorded so far, keyed by seed.
    #[must_use]
    pub const fn heatmap_images(&self) -> &HeatmapImageSet {
        &self.heatmap_images
    }

    /// The session's configuration.
    #[must_use]
    pub const fn config(&self) -> &DaamConfig {
        &self.config
    }

    /// Start a generation run: reset per-run state and parse the word
    /// list. A disabled config or an empty word list leaves the session
    /// inert for the whole run.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Config`] when overlay saving is requested but
    /// the host does not save samples.
    pub fn process(&mut self, run: &RunInfo) -> Result<()> {
        // an interrupted run can leave a trace hooked
        if let Err(e) = self.controller.unhook() {
            warn!(error = %e, "failed to release a stale attention trace");
        }
        debug!("resetting heatmap session state");
        self.words = self.config.attention_words();
        self.analyzer = None;
        self.batch = None;
        self.global_maps.clear();
        self.heatmap_images.clear();

        self.active = self.config.enabled && !self.words.is_empty();
        if !self.active {
            debug!(
                enabled = self.config.enabled,
                words = self.words.len(),
                "heatmap session inert for this run"
            );
            return Ok(());
        }
        if self.config.save_images && !run.samples_save {
            self.active = false;
            return Err(DaamError::Config(
                "cannot save heatmap overlays while the host discards samples; \
                 enable sample saving or disable overlay saving"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Analyze the batch prompt and hook the attention trace.
    ///
    /// Failures here are recoverable per prompt: the session logs and
    /// stays inert for the batch instead of aborting the run.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; the signature leaves room for hosts
    /// that want analysis faults to abort.
    pub fn process_batch(&mut self, batch: &BatchInfo) -> Result<()> {
        if !self.active {
            debug!("skipping batch, session inert");
            return Ok(());
        }
        self.analyzer = None;
        self.batch = None;

        let analyzer = match PromptAnalyzer::new(
            Arc::clone(&self.encoder),
            &batch.styled_prompt,
            self.config.padding,
        ) {
            Ok(analyzer) => analyzer,
            Err(e) => {
                warn!(
                    error = %e,
                    prompt = %batch.styled_prompt,
                    "prompt analysis failed, skipping heatmaps for this batch"
                );
                return Ok(());
            }
        };
        debug!(
            context_size = analyzer.context_size(),
            token_count = analyzer.token_count(),
            "prompt analyzed"
        );
        if self.words.iter().any(|w| analyzer.has_custom_term(w)) {
            warn!("an attention word names an embedding; its heatmap cannot be shown");
        }

        let params = TraceParams::new(
            batch.width,
            batch.height,
            analyzer.context_size(),
            batch.batch_size,
        );
        if let Err(e) = self.controller.hook(&self.backend, &params) {
            warn!(
                error = %e,
                prompt = %batch.styled_prompt,
                "failed to hook the attention trace, skipping heatmaps for this batch"
            );
            return Ok(());
        }
        info!(
            words = ?self.words,
            prompt = %batch.styled_prompt,
            "tracing attention heatmaps"
        );
        self.analyzer = Some(analyzer);
        self.batch = Some(batch.clone());
        Ok(())
    }

    /// Handle one image-saved event: compute heat maps at the first
    /// batch-index-0 event, render one overlay per word (and per layer
    /// when layer tracing is on), record and optionally save them.
    ///
    /// # Errors
    ///
    /// Propagates rendering and file-writing failures; per-word lookup
    /// misses are skipped, not raised.
    pub fn on_image_saved(&mut self, params: &ImageSaveParams) -> Result<()> {
        if !self.active {
            debug!("image event ignored, session inert");
            return Ok(());
        }
        if is_host_grid(&params.filename) {
            debug!(filename = %params.filename.display(), "ignoring host grid file");
            return Ok(());
        }
        let (Some(analyzer), Some(batch)) = (self.analyzer.clone(), self.batch.clone()) else {
            debug!("image event for an untraced batch, nothing to render");
            return Ok(());
        };

        if params.batch_index == 0 {
            self.global_maps = self
                .controller
                .compute_global_heat_maps(&analyzer, self.config.trace_each_layers);
        }

        let Some(&seed) = batch.seeds.get(params.batch_index) else {
            warn!(
                batch_index = params.batch_index,
                seeds = batch.seeds.len(),
                "image event outside the batch seed list, skipping"
            );
            return Ok(());
        };

        let opts = self.config.overlay_opts()?;
        let mut collected = Vec::new();
        for map in &self.global_maps {
            for word in &self.words {
                let Some(overlay) =
                    render_overlay(map, word, params.batch_index, &params.image, &opts)?
                else {
                    continue;
                };
                if self.config.save_images {
                    let path = overlay_filename(&params.filename, word, map.layer());
                    overlay.save(&path)?;
                    info!(path = %path.display(), "wrote heatmap overlay");
                }
                collected.push(overlay);
            }
        }
        if collected.is_empty() {
            info!(seed, "no heatmap images created for this image");
        }
        self.heatmap_images.insert(seed, collected);

        // heat maps are cached now; the trace itself is no longer needed
        self.controller.unhook()
    }

    /// Finish the run: splice recorded overlays and grids into the host's
    /// output list and release the trace if anything left it hooked.
    ///
    /// For every recorded seed, the inserted prefix is: one grid of all
    /// overlays (`use_grid`), the overlays themselves (`show_images`),
    /// then one grid of overlays plus the resized original
    /// (`grid_per_image`). Seeds pair with the originals starting at
    /// `index_of_first_image`, so images the host prepended (its own
    /// grids) are left alone. `index_of_first_image` grows by the number
    /// of inserted images and the batch infotext is duplicated to match.
    ///
    /// # Errors
    ///
    /// Propagates trace release, grid composition, and grid saving
    /// failures.
    pub fn postprocess(&mut self, output: &mut BatchOutput) -> Result<()> {
        self.controller.unhook()?;
        if !self.active {
            debug!("postprocess skipped, session inert");
            return Ok(());
        }
        let recorded = std::mem::take(&mut self.heatmap_images);
        if recorded.is_empty() {
            debug!("no heatmaps recorded for this run");
            return Ok(());
        }
        let Some(batch) = self.batch.take() else {
            debug!("no batch context, leaving output untouched");
            return Ok(());
        };
        let originals = output
            .images
            .len()
            .saturating_sub(output.index_of_first_image);
        if recorded.len() != originals {
            warn!(
                seeds = recorded.len(),
                images = originals,
                "recorded seeds and output images disagree, pairing what matches"
            );
        }

        let grid_opts = self.config.grid_opts()?;
        let layout = resolve_layout(grid_opts.layout, batch.batch_size * batch.n_iter);
        let row_length = if self.config.layers_as_row {
            self.words.len()
        } else {
            batch.batch_size
        };

        let mut prefix: Vec<RgbImage> = Vec::new();
        // pair seeds with the originals, skipping images the host prepended
        for ((seed, overlays), original) in recorded
            .into_iter()
            .zip(output.images.iter().skip(output.index_of_first_image))
        {
            let Some(first_overlay) = overlays.first() else {
                debug!(seed, "no overlays recorded for this seed");
                continue;
            };
            let (cell_w, cell_h) = first_overlay.dimensions();
            if self.config.use_grid {
                let (rows, cols) = compute_layout(layout, overlays.len(), row_length);
                let grid = make_grid(&overlays, rows, cols, grid_opts.background)?;
                if self.config.save_grid {
                    self.save_grid_image(&grid, &batch.grid_dir)?;
                }
                prefix.push(grid);
            }
            if self.config.show_images {
                prefix.extend(overlays.iter().cloned());
            }
            if self.config.grid_per_image {
                let mut cells = overlays;
                cells.push(resize_to(original, cell_w, cell_h));
                let (rows, cols) = compute_layout(layout, cells.len(), batch.batch_size);
                let grid = make_grid(&cells, rows, cols, grid_opts.background)?;
                if self.config.save_grid {
                    self.save_grid_image(&grid, &batch.grid_dir)?;
                }
                prefix.push(grid);
            }
        }

        if prefix.is_empty() {
            debug!("nothing to insert into the output");
            return Ok(());
        }
        let inserted = prefix.len();
        let infotext = output.infotexts.first().cloned().unwrap_or_default();
        output.images.splice(0..0, prefix);
        output.infotexts.splice(0..0, vec![infotext; inserted]);
        output.index_of_first_image += inserted;
        info!(inserted, "inserted heatmap images into the output list");
        Ok(())
    }

    fn save_grid_image(&mut self, grid: &RgbImage, grid_dir: &Path) -> Result<()> {
        let path = grid_dir.join(format!("grid_daam-{:04}.png", self.grid_seq));
        self.grid_seq += 1;
        grid.save(&path)?;
        info!(path = %path.display(), "wrote heatmap grid");
        Ok(())
    }
}

impl<B: TraceBackend> std::fmt::Debug for DaamSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaamSession")
            .field("active", &self.active)
            .field("words", &self.words)
            .field("recorded_seeds", &self.heatmap_images.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_host_grid(filename: &Path) -> bool {
    let name = filename.to_string_lossy();
    HOST_GRID_TAGS.iter().any(|tag| name.contains(tag))
}

/// `img_00012.png` + `cat` becomes `img_00012_cat.png` in the same
/// directory; per-layer renders append the layer index.
fn overlay_filename(filename: &Path, word: &str, layer: Option<usize>) -> PathBuf {
    let stem = filename
        .file_stem()
        .map_or_else(|| "image".to_string(), |s| s.to_string_lossy().into_owned());
    let ext = filename
        .extension()
        .map_or_else(|| "png".to_string(), |s| s.to_string_lossy().into_owned());
    let name = match layer {
        Some(layer) => format!("{stem}_{word}_{layer}.{ext}"),
        None => format!("{stem}_{word}.{ext}"),
    };
    filename.with_file_name(name)
}

// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use candle_core::{Device, Tensor};

    use super::*;
    use crate::render::caption_band_height;
    use crate::tokenizer::testing::MockEncoder;
    use crate::trace::{AttentionTrace, UnetLayout};

    struct MockTrace {
        releases: Arc<AtomicUsize>,
        layers: UnetLayout,
    }

    impl AttentionTrace for MockTrace {
        fn heat_tensor(&self, _prompt: &str, _layer_idx: Option<usize>) -> Result<Tensor> {
            let data = vec![0.5f32; 77 * 4];
            Ok(Tensor::from_vec(data, (1, 77, 2, 2), &Device::Cpu)?)
        }

        fn unet_layout(&self) -> UnetLayout {
            self.layers
        }

        fn release(&mut self) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockBackend {
        releases: Arc<AtomicUsize>,
        layers: UnetLayout,
        fail_open: bool,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                releases: Arc::new(AtomicUsize::new(0)),
                layers: UnetLayout {
                    input_blocks: 1,
                    output_blocks: 1,
                },
                fail_open: false,
            }
        }
    }

    impl TraceBackend for MockBackend {
        fn open_trace(&self, _params: &TraceParams) -> Result<Box<dyn AttentionTrace>> {
            if self.fail_open {
                return Err(DaamError::Trace("pipeline refused hooks".to_string()));
            }
            Ok(Box::new(MockTrace {
                releases: Arc::clone(&self.releases),
                layers: self.layers,
            }))
        }
    }

    fn test_config(words: &str) -> DaamConfig {
        DaamConfig {
            attention_words: words.to_string(),
            save_images: false,
            save_grid: false,
            use_grid: false,
            grid_per_image: false,
            ..DaamConfig::default()
        }
    }

    fn session(config: DaamConfig) -> DaamSession<MockBackend> {
        DaamSession::new(MockBackend::new(), Arc::new(MockEncoder::new()), config).unwrap()
    }

    fn batch_info(prompt: &str) -> BatchInfo {
        BatchInfo {
            styled_prompt: prompt.to_string(),
            width: 16,
            height: 16,
            batch_size: 1,
            n_iter: 1,
            seeds: vec![42],
            output_dir: PathBuf::new(),
            grid_dir: PathBuf::new(),
        }
    }

    fn save_params(filename: &str, batch_index: usize) -> ImageSaveParams {
        ImageSaveParams {
            image: RgbImage::from_pixel(16, 16, image::Rgb([30, 30, 30])),
            filename: PathBuf::from(filename),
            batch_index,
        }
    }

    fn output_with(n: usize) -> BatchOutput {
        BatchOutput {
            images: vec![RgbImage::from_pixel(16, 16, image::Rgb([30, 30, 30])); n],
            infotexts: vec!["seed 42".to_string(); n],
            index_of_first_image: 0,
        }
    }

    #[test]
    fn disabled_config_is_inert() {
        let mut s = session(DaamConfig {
            enabled: false,
            ..test_config("cat")
        });
        s.process(&RunInfo::default()).unwrap();
        assert!(!s.is_active());
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();
        assert!(s.heatmap_images().is_empty());
    }

    #[test]
    fn empty_word_list_is_inert() {
        let mut s = session(test_config("  ,, "));
        s.process(&RunInfo::default()).unwrap();
        assert!(!s.is_active());
    }

    #[test]
    fn saving_overlays_requires_saved_samples() {
        let mut s = session(DaamConfig {
            save_images: true,
            ..test_config("cat")
        });
        let err = s
            .process(&RunInfo {
                samples_save: false,
            })
            .unwrap_err();
        assert!(matches!(err, DaamError::Config(_)));
        assert!(!s.is_active());
    }

    #[test]
    fn one_overlay_per_word_is_recorded_under_the_seed() {
        let mut s = session(test_config("cat"));
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();

        assert_eq!(s.heatmap_images().len(), 1);
        assert_eq!(s.heatmap_images()[&42].len(), 1);
    }

    #[test]
    fn trace_releases_after_the_image_event() {
        let mut s = session(test_config("cat"));
        let releases = Arc::clone(&s.backend.releases);
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        // postprocess must not release twice
        s.postprocess(&mut output_with(1)).unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn overlays_splice_before_the_originals() {
        let mut s = session(test_config("cat"));
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();

        let mut output = output_with(1);
        s.postprocess(&mut output).unwrap();

        assert_eq!(output.images.len(), 2);
        assert_eq!(output.index_of_first_image, 1);
        assert_eq!(output.infotexts.len(), 2);
        // the overlay carries a caption band, the original does not
        let band = caption_band_height(1.1);
        assert_eq!(output.images[0].dimensions(), (16, 16 + band));
        assert_eq!(output.images[1].dimensions(), (16, 16));
    }

    #[test]
    fn grid_then_overlays_then_original() {
        let mut s = session(DaamConfig {
            use_grid: true,
            ..test_config("cat, ball")
        });
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat, red ball")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();
        assert_eq!(s.heatmap_images()[&42].len(), 2);

        let mut output = output_with(1);
        s.postprocess(&mut output).unwrap();

        // [word grid, cat overlay, ball overlay, original]
        assert_eq!(output.images.len(), 4);
        assert_eq!(output.index_of_first_image, 3);
        assert_eq!(output.infotexts.len(), 4);
        let band = caption_band_height(1.1);
        // single-image run resolves to the square layout: 1 row x 2 cols
        assert_eq!(output.images[0].dimensions(), (32, 16 + band));
        assert_eq!(output.images[3].dimensions(), (16, 16));
    }

    #[test]
    fn per_image_grid_includes_the_resized_original() {
        let mut s = session(DaamConfig {
            grid_per_image: true,
            show_images: false,
            ..test_config("cat")
        });
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();

        let mut output = output_with(1);
        s.postprocess(&mut output).unwrap();

        // only the per-image grid was inserted: overlay + resized original
        assert_eq!(output.images.len(), 2);
        assert_eq!(output.index_of_first_image, 1);
        let band = caption_band_height(1.1);
        assert_eq!(output.images[0].dimensions(), (32, 16 + band));
    }

    #[test]
    fn host_grid_files_are_ignored() {
        let mut s = session(test_config("cat"));
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("txt2img-grid-0001.png", 0))
            .unwrap();
        assert!(s.heatmap_images().is_empty());
    }

    #[test]
    fn hook_failure_skips_the_batch_without_aborting() {
        let mut backend = MockBackend::new();
        backend.fail_open = true;
        let mut s =
            DaamSession::new(backend, Arc::new(MockEncoder::new()), test_config("cat")).unwrap();
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();
        assert!(s.heatmap_images().is_empty());

        let mut output = output_with(1);
        s.postprocess(&mut output).unwrap();
        assert_eq!(output.images.len(), 1);
        assert_eq!(output.index_of_first_image, 0);
    }

    #[test]
    fn absent_words_record_an_empty_set() {
        let mut s = session(test_config("dog"));
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();
        assert_eq!(s.heatmap_images()[&42].len(), 0);

        let mut output = output_with(1);
        s.postprocess(&mut output).unwrap();
        assert_eq!(output.images.len(), 1);
    }

    #[test]
    fn seed_and_image_mismatch_pairs_the_shorter() {
        let mut s = session(test_config("cat"));
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();

        // host reports two images even though one seed was recorded
        let mut output = output_with(2);
        s.postprocess(&mut output).unwrap();
        assert_eq!(output.images.len(), 3);
        assert_eq!(output.index_of_first_image, 1);
    }

    #[test]
    fn pairing_skips_host_prepended_images() {
        let mut s = session(DaamConfig {
            grid_per_image: true,
            show_images: false,
            ..test_config("cat")
        });
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();

        // the host already placed its own grid ahead of the original
        let host_grid = RgbImage::from_pixel(16, 16, image::Rgb([0, 200, 0]));
        let original = RgbImage::from_pixel(16, 16, image::Rgb([200, 0, 0]));
        let mut output = BatchOutput {
            images: vec![host_grid, original],
            infotexts: vec!["grid".to_string(), "seed 42".to_string()],
            index_of_first_image: 1,
        };
        s.postprocess(&mut output).unwrap();

        assert_eq!(output.images.len(), 3);
        assert_eq!(output.index_of_first_image, 2);
        // the per-image grid's second cell holds the original, not the
        // host grid
        let band = caption_band_height(1.1);
        let grid = &output.images[0];
        assert_eq!(grid.dimensions(), (32, 16 + band));
        let cell = grid.get_pixel(24, band + 8);
        assert!(
            cell[0] > cell[1],
            "expected the original's red in the grid, got {:?}",
            cell
        );
    }

    #[test]
    fn image_event_outside_the_seed_list_is_skipped() {
        let mut s = session(test_config("cat"));
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 5)).unwrap();
        assert!(s.heatmap_images().is_empty());
    }

    #[test]
    fn layer_tracing_renders_one_overlay_per_layer() {
        let mut s = session(DaamConfig {
            trace_each_layers: true,
            ..test_config("cat")
        });
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();
        // 1 input + middle + 1 output = 3 layers
        assert_eq!(s.heatmap_images()[&42].len(), 3);
    }

    #[test]
    fn a_new_run_resets_the_recordings() {
        let mut s = session(test_config("cat"));
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();
        assert_eq!(s.heatmap_images().len(), 1);

        s.process(&RunInfo::default()).unwrap();
        assert!(s.heatmap_images().is_empty());
    }

    #[test]
    fn overlay_filenames_sit_next_to_the_original() {
        assert_eq!(
            overlay_filename(Path::new("/out/img_00012.png"), "cat", None),
            PathBuf::from("/out/img_00012_cat.png")
        );
        assert_eq!(
            overlay_filename(Path::new("/out/img_00012.png"), "cat", Some(3)),
            PathBuf::from("/out/img_00012_cat_3.png")
        );
    }

    #[test]
    fn custom_term_words_yield_no_overlay() {
        let encoder = MockEncoder::new().with_custom_term("hero");
        let mut s = DaamSession::new(
            MockBackend::new(),
            Arc::new(encoder),
            test_config("hero, cat"),
        )
        .unwrap();
        s.process(&RunInfo::default()).unwrap();
        s.process_batch(&batch_info("a cat")).unwrap();
        s.on_image_saved(&save_params("img_00001.png", 0)).unwrap();
        // "hero" is an embedding, only "cat" rendered
        assert_eq!(s.heatmap_images()[&42].len(), 1);
    }
}
