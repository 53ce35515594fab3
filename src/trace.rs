// SPDX-License-Identifier: MIT OR Apache-2.0

//! Trace lifecycle: hooking a diffusion run, collecting heat, releasing.
//!
//! Attention capture itself lives in the host; this crate only drives it
//! through two seams. [`TraceBackend`] opens an [`AttentionTrace`] for a
//! batch, the trace hands back aggregated heat tensors on request, and
//! [`TraceController`] enforces the lifecycle: hooked at most once per
//! batch, released exactly once, released no matter how the batch ends.

use candle_core::Tensor;
use tracing::{debug, info, warn};

use crate::error::{DaamError, Result};
use crate::heatmap::GlobalHeatMap;
use crate::prompt::PromptAnalyzer;

/// Default latent-to-pixel scale of Stable Diffusion VAEs.
pub const DEFAULT_VAE_SCALE_FACTOR: usize = 8;

/// Everything a tracer needs to size its capture buffers for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceParams {
    /// Output image width in pixels.
    pub width: usize,
    /// Output image height in pixels.
    pub height: usize,
    /// Padded context width, always a multiple of 77.
    pub context_size: usize,
    /// Latent sample size the UNet runs at.
    pub sample_size: usize,
    /// Images generated per batch.
    pub batch_size: usize,
    /// Latent-to-pixel scale of the VAE.
    pub vae_scale_factor: usize,
}

impl TraceParams {
    /// Build params with the standard VAE scale and a sample size derived
    /// from the output width.
    #[must_use]
    pub const fn new(width: usize, height: usize, context_size: usize, batch_size: usize) -> Self {
        Self {
            width,
            height,
            context_size,
            sample_size: width / DEFAULT_VAE_SCALE_FACTOR,
            batch_size,
            vae_scale_factor: DEFAULT_VAE_SCALE_FACTOR,
        }
    }

    /// Override the latent sample size.
    #[must_use]
    pub const fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    /// Override the VAE scale factor, rederiving the sample size.
    #[must_use]
    pub const fn with_vae_scale_factor(mut self, factor: usize) -> Self {
        self.vae_scale_factor = factor;
        self.sample_size = self.width / factor;
        self
    }
}

/// Cross-attention block counts of the traced UNet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnetLayout {
    /// Down-path blocks.
    pub input_blocks: usize,
    /// Up-path blocks.
    pub output_blocks: usize,
}

impl UnetLayout {
    /// Traceable layer count: down path, middle block, up path.
    #[must_use]
    pub const fn layer_count(&self) -> usize {
        self.input_blocks + 1 + self.output_blocks
    }
}

/// An open attention trace for one generation batch.
///
/// Implementations capture cross-attention during the host's denoising
/// loop and aggregate it on demand.
pub trait AttentionTrace: Send {
    /// Aggregated heat for the whole batch, `[batch, context_tokens, w, h]`
    /// in the latent grid's column-major orientation.
    ///
    /// `layer_idx` selects a single UNet layer (see [`UnetLayout`]);
    /// `None` aggregates across all of them.
    ///
    /// # Errors
    ///
    /// Implementations report capture or aggregation failures as
    /// [`DaamError::Trace`]; callers treat those as recoverable and skip
    /// rendering for the batch.
    fn heat_tensor(&self, prompt: &str, layer_idx: Option<usize>) -> Result<Tensor>;

    /// Block counts, for per-layer tracing.
    fn unet_layout(&self) -> UnetLayout;

    /// Detach from the host pipeline. Called exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Trace`] when detaching fails; the trace is
    /// considered gone either way.
    fn release(&mut self) -> Result<()>;
}

/// Opens traces; implemented by the host against its own pipeline.
pub trait TraceBackend: Send {
    /// Attach capture hooks for one batch.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Trace`] when the pipeline cannot be hooked.
    fn open_trace(&self, params: &TraceParams) -> Result<Box<dyn AttentionTrace>>;
}

/// Owns the open trace and polices the `Idle <-> Hooked` transitions.
#[derive(Default)]
pub struct TraceController {
    active: Option<Box<dyn AttentionTrace>>,
}

impl TraceController {
    /// An idle controller.
    #[must_use]
    pub const fn new() -> Self {
        Self { active: None }
    }

    /// Whether a trace is currently hooked.
    #[must_use]
    pub const fn is_hooked(&self) -> bool {
        self.active.is_some()
    }

    /// Open and hold a trace for the coming batch.
    ///
    /// # Errors
    ///
    /// Returns [`DaamError::Trace`] when a trace is already hooked (a
    /// caller bug: the previous batch was not released) or when the
    /// backend fails to open one.
    pub fn hook(&mut self, backend: &dyn TraceBackend, params: &TraceParams) -> Result<()> {
        if self.active.is_some() {
            return Err(DaamError::Trace(
                "attention trace is already hooked; release the previous batch first".to_string(),
            ));
        }
        let trace = backend.open_trace(params)?;
        info!(
            width = params.width,
            height = params.height,
            context_size = params.context_size,
            batch_size = params.batch_size,
            "attention trace hooked"
        );
        self.active = Some(trace);
        Ok(())
    }

    /// Collect the batch's global heat maps: one aggregate map, or one per
    /// UNet layer when `trace_each_layers` is set.
    ///
    /// Tracer failures are recoverable by contract: they are logged and an
    /// empty vec comes back, so the batch keeps going without overlays.
    pub fn compute_global_heat_maps(
        &self,
        analyzer: &PromptAnalyzer,
        trace_each_layers: bool,
    ) -> Vec<GlobalHeatMap> {
        let Some(trace) = self.active.as_deref() else {
            warn!("global heat maps requested while idle");
            return Vec::new();
        };
        match Self::collect(trace, analyzer, trace_each_layers) {
            Ok(maps) => maps,
            Err(e) => {
                warn!(
                    error = %e,
                    prompt = analyzer.text(),
                    "heat map aggregation failed; skipping overlays for this batch"
                );
                Vec::new()
            }
        }
    }

    fn collect(
        trace: &dyn AttentionTrace,
        analyzer: &PromptAnalyzer,
        trace_each_layers: bool,
    ) -> Result<Vec<GlobalHeatMap>> {
        if trace_each_layers {
            (0..trace.unet_layout().layer_count())
                .map(|layer| {
                    let heat = trace.heat_tensor(analyzer.text(), Some(layer))?;
                    GlobalHeatMap::new(analyzer.clone(), Some(layer), heat)
                })
                .collect()
        } else {
            let heat = trace.heat_tensor(analyzer.text(), None)?;
            Ok(vec![GlobalHeatMap::new(analyzer.clone(), None, heat)?])
        }
    }

    /// Release the hooked trace. Idempotent: releasing while idle is a
    /// recoverable fault that only logs.
    ///
    /// # Errors
    ///
    /// Propagates [`DaamError::Trace`] from the tracer's release; the
    /// controller returns to idle regardless.
    pub fn unhook(&mut self) -> Result<()> {
        match self.active.take() {
            Some(mut trace) => {
                trace.release()?;
                info!("attention trace released");
                Ok(())
            }
            None => {
                debug!("release requested while idle; nothing to do");
                Ok(())
            }
        }
    }
}

impl Drop for TraceController {
    fn drop(&mut self) {
        if let Some(mut trace) = self.active.take() {
            if let Err(e) = trace.release() {
                warn!(error = %e, "failed to release attention trace on drop");
            }
        }
    }
}

impl std::fmt::Debug for TraceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceController")
            .field("hooked", &self.is_hooked())
            .finish()
    }
}

// ---------------------------------------------------------------------------
