//! Offline stand-ins for the tokenizer and the generation engine.
//!
//! Used by the `rollout` demo command and the state-machine tests. The
//! tokenizer maps bytes to ids `0..=255` and chat special tokens to their
//! configured ids, so token counts are predictable.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::{Array2, Array3, Axis};

use crate::config::SpecialTokens;

use super::engine::{EnginePrompt, GenerationEngine};
use super::processor::{ImageProcessor, PatchGridProcessor, Tokenizer};
use super::types::{FinishReason, GenerationOutput, PositionIds, PromptBatch, PromptSample, SamplingParams};

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

/// Byte-level tokenizer with chat special tokens.
#[derive(Debug, Clone)]
pub struct ByteTokenizer {
    specials: Vec<(String, u32)>,
}

impl ByteTokenizer {
    pub fn new(tokens: &SpecialTokens) -> Self {
        let specials = vec![
            ("<|endoftext|>".to_string(), tokens.pad_token_id),
            ("<|im_start|>".to_string(), 151_644),
            ("<|im_end|>".to_string(), tokens.eos_token_id),
            ("<|vision_start|>".to_string(), 151_652),
            ("<|vision_end|>".to_string(), 151_653),
            ("<|image_pad|>".to_string(), tokens.image_pad_token_id),
        ];
        Self { specials }
    }

    fn special_id(&self, text: &str) -> Option<(usize, u32)> {
        self.specials
            .iter()
            .find(|(s, _)| text.starts_with(s.as_str()))
            .map(|(s, id)| (s.len(), *id))
    }
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self::new(&SpecialTokens::default())
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len());
        let mut rest = text;
        while !rest.is_empty() {
            if let Some((len, id)) = self.special_id(rest) {
                ids.push(id);
                rest = &rest[len..];
                continue;
            }
            let ch = rest.chars().next().ok_or_else(|| anyhow!("empty remainder"))?;
            let mut buf = [0u8; 4];
            ids.extend(ch.encode_utf8(&mut buf).bytes().map(u32::from));
            rest = &rest[ch.len_utf8()..];
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Ok(b) = u8::try_from(id) {
                bytes.push(b);
                continue;
            }
            let (text, _) = self
                .specials
                .iter()
                .find(|(_, sid)| *sid == id)
                .ok_or_else(|| anyhow!("token id {id} is not in the vocabulary"))?;
            if !skip_special_tokens {
                bytes.extend_from_slice(text.as_bytes());
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One scripted engine reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedTurn {
    pub text: String,
    pub finish_reason: Option<FinishReason>,
}

impl ScriptedTurn {
    pub fn stop(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: Some(FinishReason::Stop),
        }
    }

    pub fn length(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: Some(FinishReason::Length),
        }
    }
}

type Script = Box<dyn Fn(usize, &str) -> ScriptedTurn + Send + Sync>;

/// Replies from a script keyed by `(round, request_id)`.
///
/// The round is read from the `-<round>` suffix the state machine appends to
/// request ids.
pub struct ScriptedEngine {
    tokenizer: Arc<dyn Tokenizer>,
    script: Script,
    calls: AtomicUsize,
    awake: AtomicBool,
}

impl ScriptedEngine {
    pub fn new<F>(tokenizer: Arc<dyn Tokenizer>, script: F) -> Self
    where
        F: Fn(usize, &str) -> ScriptedTurn + Send + Sync + 'static,
    {
        Self {
            tokenizer,
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            awake: AtomicBool::new(false),
        }
    }

    /// Reply with `turns[round]`, repeating the last turn once the list runs out.
    pub fn per_round(tokenizer: Arc<dyn Tokenizer>, turns: Vec<ScriptedTurn>) -> Self {
        Self::new(tokenizer, move |round, _| {
            let idx = round.min(turns.len().saturating_sub(1));
            turns
                .get(idx)
                .cloned()
                .unwrap_or_else(|| ScriptedTurn::stop(""))
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_awake(&self) -> bool {
        self.awake.load(Ordering::SeqCst)
    }

    fn reply(&self, request_id: &str) -> Result<GenerationOutput> {
        let round = request_id
            .rsplit_once('-')
            .and_then(|(_, r)| r.parse::<usize>().ok())
            .unwrap_or(0);
        let turn = (self.script)(round, request_id);
        Ok(GenerationOutput {
            token_ids: self.tokenizer.encode(&turn.text)?,
            text: turn.text,
            finish_reason: turn.finish_reason,
        })
    }
}

impl GenerationEngine for ScriptedEngine {
    fn generate<'a>(
        &'a self,
        _prompt: EnginePrompt<'a>,
        _params: &'a SamplingParams,
        request_id: &'a str,
    ) -> BoxStream<'a, Result<GenerationOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outputs = match self.reply(request_id) {
            Ok(full) => {
                // A partial output first, as streaming engines do.
                let partial = GenerationOutput {
                    text: String::new(),
                    token_ids: Vec::new(),
                    finish_reason: None,
                };
                vec![Ok(partial), Ok(full)]
            }
            Err(e) => vec![Err(e)],
        };
        stream::iter(outputs).boxed()
    }

    async fn wake_up(&self) -> Result<()> {
        self.awake.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn sleep(&self) -> Result<()> {
        self.awake.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Demo prompts
// ---------------------------------------------------------------------------

/// Side of the full-resolution demo images.
const DEMO_ORIGINAL_SIDE: u32 = 448;
/// Side the demo images are shown to the model at.
const DEMO_SHOWN_SIDE: u32 = 112;

/// Build a left-padded prompt batch of `(question, answer)` pairs, each with a
/// solid-colour image.
pub fn demo_batch(
    tokenizer: &ByteTokenizer,
    processor: &PatchGridProcessor,
    tokens: &SpecialTokens,
    questions: &[(&str, &str)],
) -> Result<PromptBatch> {
    let palette = [Rgb([200u8, 30, 30]), Rgb([30, 160, 60]), Rgb([40, 60, 200])];
    let mut samples = Vec::with_capacity(questions.len());
    let mut expanded = Vec::with_capacity(questions.len());
    for (i, (question, answer)) in questions.iter().enumerate() {
        let original = Arc::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            DEMO_ORIGINAL_SIDE,
            DEMO_ORIGINAL_SIDE,
            palette[i % palette.len()],
        )));
        let shown = Arc::new(original.resize_exact(
            DEMO_SHOWN_SIDE,
            DEMO_SHOWN_SIDE,
            FilterType::Triangle,
        ));
        let raw_prompt = format!(
            "<|im_start|>user\n<|vision_start|><|image_pad|><|vision_end|>{question}<|im_end|>\n<|im_start|>assistant\n"
        );
        let raw_prompt_ids = tokenizer.encode(&raw_prompt)?;
        let image_tokens = processor.image_token_count(&shown)?;
        let full: Vec<u32> = raw_prompt_ids
            .iter()
            .flat_map(|&id| {
                let copies = if id == tokens.image_pad_token_id { image_tokens } else { 1 };
                std::iter::repeat(id).take(copies)
            })
            .collect();
        expanded.push(full);
        samples.push(Arc::new(PromptSample {
            raw_prompt_ids,
            image: shown,
            original_image: original,
            raw_prompt,
            index: i.to_string(),
            uid: format!("demo-{i}"),
            ground_truth: answer.to_string(),
            data_source: "demo".into(),
        }));
    }

    let width = expanded.iter().map(Vec::len).max().unwrap_or(0);
    let rows = expanded.len();
    let mut input_ids = Array2::<u32>::from_elem((rows, width), tokens.pad_token_id);
    let mut attention_mask = Array2::<u8>::zeros((rows, width));
    for (r, ids) in expanded.iter().enumerate() {
        let start = width - ids.len();
        for (k, &id) in ids.iter().enumerate() {
            input_ids[[r, start + k]] = id;
            attention_mask[[r, start + k]] = 1;
        }
    }
    let mut positions = Array3::<i64>::zeros((rows, 3, width));
    for (r, sample) in samples.iter().enumerate() {
        let grids = processor.grid_thw(std::slice::from_ref(&sample.image))?;
        let pos = processor.rope_index(input_ids.row(r), &grids, attention_mask.row(r))?;
        positions.index_axis_mut(Axis(0), r).assign(&pos);
    }

    Ok(PromptBatch {
        input_ids,
        attention_mask,
        position_ids: PositionIds::Rope(positions),
        samples,
    })
}
