// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: trace hook lifecycle across generation runs. A
//! trace must be released exactly once per hook, whether the batch
//! completes, the run is interrupted, or the session is dropped.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::missing_docs_in_private_items,
    missing_docs
)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use candle_daam::{
    AttentionTrace, BatchInfo, BatchOutput, DaamConfig, DaamError, DaamSession, ImageSaveParams,
    PromptChunk, Result, RunInfo, TextEncoder, TokenizedLine, TraceBackend, TraceParams,
    UnetLayout,
};
use image::RgbImage;

// ---------------------------------------------------------------------------
// Word-level encoder
// ---------------------------------------------------------------------------

fn word_id(word: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in word.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    1000 + hash % 40000
}

struct WordEncoder;

impl TextEncoder for WordEncoder {
    fn tokenize_line(&self, line: &str) -> Result<TokenizedLine> {
        let content = self.encode_word(line)?;
        let token_count = content.len();
        let chunks = if content.is_empty() {
            vec![PromptChunk::new()]
        } else {
            content
                .chunks(self.chunk_length())
                .map(|tokens| PromptChunk {
                    tokens: tokens.to_vec(),
                    multipliers: vec![1.0; tokens.len()],
                    fixes: Vec::new(),
                })
                .collect()
        };
        Ok(TokenizedLine {
            chunks,
            token_count,
            ..TokenizedLine::default()
        })
    }

    fn encode_word(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| c.is_ascii_punctuation()))
            .filter(|w| !w.is_empty())
            .map(word_id)
            .collect())
    }

    fn id_start(&self) -> u32 {
        49406
    }

    fn id_end(&self) -> u32 {
        49407
    }
}

// ---------------------------------------------------------------------------
// Release-counting tracer
// ---------------------------------------------------------------------------

struct CountingTrace {
    params: TraceParams,
    releases: Arc<AtomicUsize>,
    fail_heat: bool,
}

impl AttentionTrace for CountingTrace {
    fn heat_tensor(&self, _prompt: &str, _layer_idx: Option<usize>) -> Result<Tensor> {
        if self.fail_heat {
            return Err(DaamError::Trace("capture buffer is empty".to_string()));
        }
        let side = self.params.sample_size;
        let data = vec![0.5f32; self.params.batch_size * self.params.context_size * side * side];
        Ok(Tensor::from_vec(
            data,
            (self.params.batch_size, self.params.context_size, side, side),
            &Device::Cpu,
        )?)
    }

    fn unet_layout(&self) -> UnetLayout {
        UnetLayout {
            input_blocks: 1,
            output_blocks: 1,
        }
    }

    fn release(&mut self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct CountingBackend {
    releases: Arc<AtomicUsize>,
    fail_heat: bool,
}

impl CountingBackend {
    fn new() -> Self {
        Self {
            releases: Arc::new(AtomicUsize::new(0)),
            fail_heat: false,
        }
    }
}

impl TraceBackend for CountingBackend {
    fn open_trace(&self, params: &TraceParams) -> Result<Box<dyn AttentionTrace>> {
        Ok(Box::new(CountingTrace {
            params: *params,
            releases: Arc::clone(&self.releases),
            fail_heat: self.fail_heat,
        }))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn config(words: &str) -> DaamConfig {
    DaamConfig {
        attention_words: words.to_string(),
        save_images: false,
        save_grid: false,
        use_grid: false,
        grid_per_image: false,
        ..DaamConfig::default()
    }
}

fn session(words: &str) -> (DaamSession<CountingBackend>, Arc<AtomicUsize>) {
    let backend = CountingBackend::new();
    let releases = Arc::clone(&backend.releases);
    let session = DaamSession::new(backend, Arc::new(WordEncoder), config(words)).unwrap();
    (session, releases)
}

fn batch_with_seed(prompt: &str, seed: i64) -> BatchInfo {
    BatchInfo {
        styled_prompt: prompt.to_string(),
        width: 16,
        height: 16,
        batch_size: 1,
        n_iter: 2,
        seeds: vec![seed],
        output_dir: PathBuf::new(),
        grid_dir: PathBuf::new(),
    }
}

fn save_event(batch_index: usize) -> ImageSaveParams {
    ImageSaveParams {
        image: RgbImage::new(16, 16),
        filename: PathBuf::from("img_00001.png"),
        batch_index,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn a_completed_batch_releases_exactly_once() {
    let (mut s, releases) = session("cat");
    s.process(&RunInfo::default()).unwrap();
    s.process_batch(&batch_with_seed("a cat", 7)).unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 0);

    s.on_image_saved(&save_event(0)).unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 1);

    s.postprocess(&mut BatchOutput::default()).unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[test]
fn sequential_batches_accumulate_seeds_in_order() {
    let (mut s, releases) = session("cat");
    s.process(&RunInfo::default()).unwrap();

    s.process_batch(&batch_with_seed("a cat", 7)).unwrap();
    s.on_image_saved(&save_event(0)).unwrap();
    s.process_batch(&batch_with_seed("a cat", 8)).unwrap();
    s.on_image_saved(&save_event(0)).unwrap();

    assert_eq!(releases.load(Ordering::SeqCst), 2);
    let seeds: Vec<i64> = s.heatmap_images().keys().copied().collect();
    assert_eq!(seeds, vec![7, 8]);

    let mut output = BatchOutput {
        images: vec![RgbImage::new(16, 16); 2],
        infotexts: vec!["Seed: 7".to_string(), "Seed: 8".to_string()],
        index_of_first_image: 0,
    };
    s.postprocess(&mut output).unwrap();
    // one overlay per seed, spliced ahead of both originals
    assert_eq!(output.images.len(), 4);
    assert_eq!(output.index_of_first_image, 2);
}

#[test]
fn an_interrupted_run_is_released_by_the_next_one() {
    let (mut s, releases) = session("cat");
    s.process(&RunInfo::default()).unwrap();
    s.process_batch(&batch_with_seed("a cat", 7)).unwrap();
    // no image event arrives: the host was interrupted

    s.process(&RunInfo::default()).unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 1);

    // and the fresh run can hook again
    s.process_batch(&batch_with_seed("a cat", 9)).unwrap();
    s.on_image_saved(&save_event(0)).unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 2);
    assert_eq!(s.heatmap_images()[&9].len(), 1);
}

#[test]
fn dropping_a_hooked_session_releases_the_trace() {
    let (mut s, releases) = session("cat");
    s.process(&RunInfo::default()).unwrap();
    s.process_batch(&batch_with_seed("a cat", 7)).unwrap();
    drop(s);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[test]
fn a_failing_tracer_degrades_to_no_overlays() {
    let mut backend = CountingBackend::new();
    backend.fail_heat = true;
    let mut s = DaamSession::new(backend, Arc::new(WordEncoder), config("cat")).unwrap();
    s.process(&RunInfo::default()).unwrap();
    s.process_batch(&batch_with_seed("a cat", 7)).unwrap();
    s.on_image_saved(&save_event(0)).unwrap();
    assert!(s.heatmap_images()[&7].is_empty());

    let mut output = BatchOutput {
        images: vec![RgbImage::new(16, 16)],
        infotexts: vec!["Seed: 7".to_string()],
        index_of_first_image: 0,
    };
    s.postprocess(&mut output).unwrap();
    assert_eq!(output.images.len(), 1);
    assert_eq!(output.index_of_first_image, 0);
}

#[test]
fn image_events_beyond_the_batch_are_skipped() {
    let (mut s, _releases) = session("cat");
    s.process(&RunInfo::default()).unwrap();
    s.process_batch(&batch_with_seed("a cat", 7)).unwrap();
    s.on_image_saved(&save_event(3)).unwrap();
    assert!(s.heatmap_images().is_empty());
}
