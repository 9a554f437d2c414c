//! Core data types for the rollout engine.
//!
//! A [`PromptBatch`] is expanded into one [`RolloutRequest`] per
//! (prompt, sample) pair. Each request is driven through its turns by the
//! state machine and comes back as a [`RolloutOutcome`], which the batch
//! reassembler folds into a rectangular [`crate::rollout::batch::RolloutBatch`].

use std::fmt;
use std::sync::Arc;

use image::DynamicImage;
use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::config::RolloutConfig;

use super::image::ImageSize;

// ---------------------------------------------------------------------------
// Request lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a single rollout request.
///
/// `Pending -> Generating -> (ToolCall -> Generating)* -> {Completed | Exceeded | Void}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Generating,
    ToolCall,
    /// Finished with a well-formed final answer.
    Completed,
    /// Ran out of rounds, images or context while still calling tools.
    Exceeded,
    /// Truncated by length or finished without a final answer.
    Void,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Exceeded | Self::Void)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::ToolCall => "tool_call",
            Self::Completed => "completed",
            Self::Exceeded => "exceeded",
            Self::Void => "void",
        };
        f.write_str(s)
    }
}

/// Why the engine stopped producing tokens for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// Hit a stop string or end-of-sequence token.
    Stop,
    /// Hit the per-turn token limit.
    Length,
    /// Aborted by the engine.
    Abort,
}

// ---------------------------------------------------------------------------
// Engine I/O
// ---------------------------------------------------------------------------

/// Sampling parameters sent with every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub n: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub min_p: f32,
    pub max_tokens: usize,
    pub stop: Vec<String>,
    pub include_stop_str_in_output: bool,
}

impl SamplingParams {
    /// Per-turn parameters; `do_sample = false` selects greedy decoding.
    pub fn from_config(config: &RolloutConfig, do_sample: bool) -> Self {
        let mut params = Self {
            n: 1,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            min_p: 0.0,
            max_tokens: config.response_length,
            stop: config.stop.clone(),
            include_stop_str_in_output: true,
        };
        if !do_sample {
            params.temperature = 0.0;
            params.top_p = 1.0;
            params.top_k = -1;
            params.min_p = 0.0;
        }
        params
    }
}

/// One (partial or final) output of the generation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub text: String,
    pub token_ids: Vec<u32>,
    pub finish_reason: Option<FinishReason>,
}

// ---------------------------------------------------------------------------
// Prompt batch
// ---------------------------------------------------------------------------

/// Position ids of the left-padded prompts.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionIds {
    /// `(rows, L)` monotonic positions.
    Flat(Array2<i64>),
    /// `(rows, 3, L)` rotary multimodal positions.
    Rope(Array3<i64>),
}

impl PositionIds {
    pub fn rows(&self) -> usize {
        match self {
            Self::Flat(p) => p.nrows(),
            Self::Rope(p) => p.dim().0,
        }
    }

    pub fn width(&self) -> usize {
        match self {
            Self::Flat(p) => p.ncols(),
            Self::Rope(p) => p.dim().2,
        }
    }
}

/// Non-tensor inputs of one source prompt.
#[derive(Debug, Clone)]
pub struct PromptSample {
    /// Unpadded prompt token ids as fed to the engine.
    pub raw_prompt_ids: Vec<u32>,
    /// Resized prompt image the model sees.
    pub image: Arc<DynamicImage>,
    /// Full-resolution image that tool calls crop from.
    pub original_image: Arc<DynamicImage>,
    pub raw_prompt: String,
    /// Dataset index, used as the document id in logs.
    pub index: String,
    /// Group id shared by all samples of this prompt.
    pub uid: String,
    pub ground_truth: String,
    pub data_source: String,
}

impl PromptSample {
    pub fn image_size_used(&self) -> ImageSize {
        ImageSize::of(&self.image)
    }
}

/// A batch of left-padded prompts plus their per-row metadata.
#[derive(Debug, Clone)]
pub struct PromptBatch {
    /// `(rows, prompt_length)`.
    pub input_ids: Array2<u32>,
    /// `(rows, prompt_length)`.
    pub attention_mask: Array2<u8>,
    pub position_ids: PositionIds,
    pub samples: Vec<Arc<PromptSample>>,
}

impl PromptBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn prompt_length(&self) -> usize {
        self.input_ids.ncols()
    }
}

/// Per-call flags for one rollout round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutMode {
    pub do_sample: bool,
    pub is_validate: bool,
}

impl Default for RolloutMode {
    fn default() -> Self {
        Self {
            do_sample: true,
            is_validate: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

/// One (prompt, sample) pair waiting to be rolled out.
#[derive(Debug, Clone)]
pub struct RolloutRequest {
    pub request_id: String,
    /// Row of the source prompt in its batch.
    pub batch_index: usize,
    /// Sample number within the prompt's group.
    pub offset: usize,
    pub sample: Arc<PromptSample>,
    /// Model tokens the prompt image expands to.
    pub image_token_num: usize,
}

impl RolloutRequest {
    /// Document id for logs: the dataset index, suffixed with the offset when
    /// several samples share it.
    pub fn doc_id(&self, samples_per_prompt: usize) -> String {
        if samples_per_prompt == 1 {
            self.sample.index.clone()
        } else {
            format!("{}_{}", self.sample.index, self.offset)
        }
    }
}

/// Reward tensors for one row, each `max_total_response_length` wide.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardScores {
    pub reward: Array1<f32>,
    pub accuracy: Array1<f32>,
    pub format: Array1<f32>,
    pub overlong: Array1<f32>,
    /// Row ids the scorer wants excluded from training.
    pub invalid_uids: Vec<String>,
}

impl RewardScores {
    pub fn zeros(width: usize) -> Self {
        Self {
            reward: Array1::zeros(width),
            accuracy: Array1::zeros(width),
            format: Array1::zeros(width),
            overlong: Array1::zeros(width),
            invalid_uids: Vec::new(),
        }
    }
}

/// A finished request, ready for reassembly.
#[derive(Debug, Clone)]
pub struct RolloutOutcome {
    pub request_id: String,
    pub batch_index: usize,
    pub offset: usize,
    pub sample: Arc<PromptSample>,
    /// Terminal state.
    pub state: RequestState,
    /// Everything after the prompt, with image placeholders expanded.
    pub response_ids: Vec<u32>,
    /// 1 for assistant tokens, 0 for injected observation tokens.
    pub response_mask: Vec<u8>,
    /// Images fed to the engine: the prompt image then each observation.
    pub images: Vec<Arc<DynamicImage>>,
    pub scores: RewardScores,
    pub avg_response_tokens_per_turn: f32,
    pub round_num: usize,
}

impl RolloutOutcome {
    pub fn exceeded(&self) -> bool {
        self.state == RequestState::Exceeded
    }

    pub fn voided(&self) -> bool {
        self.state == RequestState::Void
    }
}
