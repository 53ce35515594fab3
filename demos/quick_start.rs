// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quick start: drive a [`DaamSession`] against a synthetic pipeline and
//! write per-word heatmap overlays into the current directory.
//!
//! ```bash
//! cargo run --example quick_start
//! ```
//!
//! Real hosts implement [`TraceBackend`] over their denoising loop so the
//! captured cross-attention is real; this demo fabricates plausible heat
//! per context slot so it runs anywhere, without model weights.

use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use candle_daam::{
    AttentionTrace, BatchInfo, BatchOutput, DaamConfig, DaamSession, ImageSaveParams, PromptChunk,
    Result, RunInfo, TextEncoder, TokenizedLine, TraceBackend, TraceParams, UnetLayout,
};
use image::RgbImage;

/// Word-level stand-in for a host's CLIP stack: every word maps to one
/// stable id.
struct DemoEncoder;

fn word_id(word: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in word.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    1000 + hash % 40000
}

impl TextEncoder for DemoEncoder {
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

/// Fabricates one smooth attention blob per context slot.
struct DemoTrace {
    params: TraceParams,
}

impl AttentionTrace for DemoTrace {
    fn heat_tensor(&self, _prompt: &str, _layer_idx: Option<usize>) -> Result<Tensor> {
        let side = self.params.sample_size;
        let tokens = self.params.context_size;
        let mut data = Vec::with_capacity(self.params.batch_size * tokens * side * side);
        for _ in 0..self.params.batch_size {
            for slot in 0..tokens {
                // park each slot's blob at a slot-dependent spot
                let cx = ((slot * 7) % side) as f32;
                let cy = ((slot * 13) % side) as f32;
                let sigma = side as f32 / 6.0;
                for x in 0..side {
                    for y in 0..side {
                        let dx = x as f32 - cx;
                        let dy = y as f32 - cy;
                        data.push((-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp());
                    }
                }
            }
        }
        Ok(Tensor::from_vec(
            data,
            (self.params.batch_size, tokens, side, side),
            &Device::Cpu,
        )?)
    }

    fn unet_layout(&self) -> UnetLayout {
        UnetLayout {
            input_blocks: 6,
            output_blocks: 9,
        }
    }

    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

struct DemoBackend;

impl TraceBackend for DemoBackend {
    fn open_trace(&self, params: &TraceParams) -> Result<Box<dyn AttentionTrace>> {
        Ok(Box::new(DemoTrace { params: *params }))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // 1. Configure: which words to attribute, and where results go
    let config = DaamConfig {
        attention_words: "cat, ball".to_string(),
        use_grid: true,
        grid_per_image: false,
        ..DaamConfig::default()
    };

    // 2. Build the session around the host seams
    let mut session = DaamSession::new(DemoBackend, Arc::new(DemoEncoder), config)?;

    // 3. Run start: parse the word list, reset state
    session.process(&RunInfo::default())?;

    // 4. Per batch: analyze the prompt and hook the trace
    let batch = BatchInfo {
        styled_prompt: "a cat playing with a red ball".to_string(),
        width: 256,
        height: 256,
        batch_size: 1,
        n_iter: 1,
        seeds: vec![1234],
        output_dir: PathBuf::from("."),
        grid_dir: PathBuf::from("."),
    };
    session.process_batch(&batch)?;

    // 5. Per generated image: render and save one overlay per word
    let base = RgbImage::from_fn(256, 256, |x, y| {
        image::Rgb([(x / 2) as u8, (y / 2) as u8, 96])
    });
    session.on_image_saved(&ImageSaveParams {
        image: base.clone(),
        filename: PathBuf::from("./daam_demo.png"),
        batch_index: 0,
    })?;

    // 6. Run end: splice overlays and the grid into the host output
    let mut output = BatchOutput {
        images: vec![base],
        infotexts: vec!["a cat playing with a red ball, Seed: 1234".to_string()],
        index_of_first_image: 0,
    };
    session.postprocess(&mut output)?;

    println!("output list now holds {} images", output.images.len());
    println!("originals start at index {}", output.index_of_first_image);
    println!("wrote daam_demo_cat.png, daam_demo_ball.png and grid_daam-0000.png");
    Ok(())
}
