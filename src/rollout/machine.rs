//! The multi-turn rollout state machine.
//!
//! Every request is an independent task that alternates between generation
//! and tool use:
//!
//! ```text
//! Pending -> Generating -> (ToolCall -> Generating)* -> {Completed | Exceeded | Void}
//! ```
//!
//! Generation runs on the shared engine; request forking, tool execution and
//! scoring run on a bounded blocking pool. A [`RolloutWorker`] drives all
//! requests of a batch concurrently and hands the outcomes to
//! [`batch::assemble`].

use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use image::DynamicImage;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RolloutConfig;
use crate::error::{RemoraError, Result};

use super::batch::{self, fit_width, final_eos_row, RolloutBatch};
use super::engine::{final_output, EnginePrompt, GenerationEngine};
use super::image::{resize_to_fit, ImageSize};
use super::pool::BlockingPool;
use super::processor::{tokens_for_grid, ImageProcessor, Tokenizer};
use super::prompt::ChatTemplate;
use super::scoring::{RewardScorer, ScoreRequest, ValidityClassifier};
use super::tools::{extract_tool_call, ToolDispatcher, ToolObservation};
use super::types::{
    FinishReason, PromptBatch, RequestState, RolloutMode, RolloutOutcome, RolloutRequest,
    SamplingParams,
};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Shared, read-only services the state machine calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub processor: Arc<dyn ImageProcessor>,
    pub tools: Arc<dyn ToolDispatcher>,
    pub scorer: Arc<dyn RewardScorer>,
    /// Scorer used in validation mode; falls back to `scorer`.
    pub val_scorer: Option<Arc<dyn RewardScorer>>,
    pub classifier: Arc<dyn ValidityClassifier>,
}

// ---------------------------------------------------------------------------
// Per-request buffer
// ---------------------------------------------------------------------------

/// Token stream and image history of one request.
#[derive(Debug, Clone)]
struct TurnBuffer {
    tokens: Vec<u32>,
    /// 1 for generated tokens, 0 for prompt and observation tokens.
    mask: Vec<u8>,
    /// Images fed to the engine, prompt image first.
    images: Vec<Arc<DynamicImage>>,
    /// Size each image was shown at.
    sizes: Vec<ImageSize>,
    /// Full-resolution counterparts of `images`.
    originals: Vec<Arc<DynamicImage>>,
}

/// Buffer lengths to truncate back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Checkpoint {
    tokens: usize,
    images: usize,
}

impl TurnBuffer {
    fn fork(request: &RolloutRequest) -> Self {
        let sample = &request.sample;
        Self {
            tokens: sample.raw_prompt_ids.clone(),
            mask: vec![0; sample.raw_prompt_ids.len()],
            images: vec![sample.image.clone()],
            sizes: vec![sample.image_size_used()],
            originals: vec![sample.original_image.clone()],
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            tokens: self.tokens.len(),
            images: self.images.len(),
        }
    }

    fn rollback(&mut self, to: Checkpoint) {
        self.tokens.truncate(to.tokens);
        self.mask.truncate(to.tokens);
        self.images.truncate(to.images);
        self.sizes.truncate(to.images);
        self.originals.truncate(to.images);
    }

    fn push_generated(&mut self, ids: &[u32]) {
        self.tokens.extend_from_slice(ids);
        self.mask.extend(std::iter::repeat(1).take(ids.len()));
    }

    fn push_tool_turn(&mut self, turn: ToolTurn) {
        self.mask.extend(std::iter::repeat(0).take(turn.prompt_ids.len()));
        self.tokens.extend(turn.prompt_ids);
        if let Some(obs) = turn.observation {
            self.sizes.push(ImageSize::of(&obs.resized));
            self.images.push(obs.resized);
            self.originals.push(obs.original);
        }
    }
}

// ---------------------------------------------------------------------------
// Tool turns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ObservationImage {
    original: Arc<DynamicImage>,
    resized: Arc<DynamicImage>,
}

/// Tokens spliced in after a tool call.
#[derive(Debug, Clone)]
struct ToolTurn {
    prompt_ids: Vec<u32>,
    observation: Option<ObservationImage>,
    /// Model tokens the observation image expands to.
    image_tokens: usize,
}

impl ToolTurn {
    /// Context growth once the image placeholder is expanded.
    fn context_cost(&self) -> usize {
        match self.observation {
            Some(_) => self.prompt_ids.len() + self.image_tokens.saturating_sub(1),
            None => self.prompt_ids.len(),
        }
    }
}

/// Everything a tool turn needs, detached from the request so it can move to
/// the blocking pool.
struct ToolJob {
    payload: String,
    originals: Vec<Arc<DynamicImage>>,
    sizes: Vec<ImageSize>,
    round: usize,
    tokenizer: Arc<dyn Tokenizer>,
    processor: Arc<dyn ImageProcessor>,
    tools: Arc<dyn ToolDispatcher>,
    template: ChatTemplate,
    max_pixels: usize,
    min_pixels: usize,
}

impl ToolJob {
    /// Run the call and render the following user turn. Tool failures become
    /// an error turn; only tokenizer and processor failures are returned.
    fn run(self) -> anyhow::Result<ToolTurn> {
        let observed = self
            .tools
            .prepare(&self.payload, &self.originals, &self.sizes)
            .and_then(|tool| self.tools.execute(&tool, &self.originals))
            .and_then(|obs| match obs {
                ToolObservation::Image(img) => {
                    let resized = resize_to_fit(&img, self.max_pixels, self.min_pixels)?;
                    Ok((Some((img, resized)), None))
                }
                ToolObservation::Text(text) => Ok((None, Some(text))),
            });

        match observed {
            Ok((Some((original, resized)), _)) => {
                let resized = Arc::new(resized);
                let text = self
                    .template
                    .observation_turn(self.round, self.originals.len());
                let image_tokens = self.processor.image_token_count(&resized)?;
                Ok(ToolTurn {
                    prompt_ids: self.tokenizer.encode(&text)?,
                    observation: Some(ObservationImage {
                        original: Arc::new(original),
                        resized,
                    }),
                    image_tokens,
                })
            }
            Ok((None, text)) => {
                let text = self.template.text_turn(&text.unwrap_or_default());
                Ok(ToolTurn {
                    prompt_ids: self.tokenizer.encode(&text)?,
                    observation: None,
                    image_tokens: 0,
                })
            }
            Err(e) => {
                debug!(error = %format!("{e:#}"), "tool call failed, injecting error turn");
                let text = self.template.error_turn(&format!("{e:#}"));
                Ok(ToolTurn {
                    prompt_ids: self.tokenizer.encode(&text)?,
                    observation: None,
                    image_tokens: 0,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Drives rollout requests against one engine.
pub struct RolloutWorker<E> {
    engine: E,
    parts: Collaborators,
    config: RolloutConfig,
    tool_pattern: Regex,
    answer_pattern: Regex,
    pool: BlockingPool,
}

impl<E: GenerationEngine> RolloutWorker<E> {
    pub fn new(engine: E, parts: Collaborators, config: RolloutConfig) -> Result<Self> {
        let tool_pattern = Regex::new(&config.tool_call_pattern)?;
        let answer_pattern = Regex::new(&config.final_answer_pattern)?;
        let pool = BlockingPool::new(config.blocking_workers);
        Ok(Self {
            engine,
            parts,
            config,
            tool_pattern,
            answer_pattern,
            pool,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Bring the engine back before a rollout round.
    pub async fn wake_up(&self) -> Result<()> {
        self.engine
            .wake_up()
            .await
            .map_err(|e| RemoraError::collaborator("generation engine", e))
    }

    /// Release the engine after a rollout round.
    pub async fn sleep(&self) -> Result<()> {
        self.engine
            .sleep()
            .await
            .map_err(|e| RemoraError::collaborator("generation engine", e))
    }

    /// Roll out every prompt `n` times and assemble the batch.
    pub async fn generate_sequences(
        &self,
        prompts: &PromptBatch,
        mode: RolloutMode,
    ) -> Result<RolloutBatch> {
        let n = self.config.samples_per_prompt(mode.is_validate);
        let requests = self.expand_requests(prompts, n)?;
        let params = SamplingParams::from_config(&self.config, mode.do_sample);
        let started = Instant::now();
        info!(
            prompts = prompts.len(),
            requests = requests.len(),
            validate = mode.is_validate,
            "starting rollout"
        );

        let outcomes = try_join_all(
            requests
                .into_iter()
                .map(|request| self.run_request(request, &params, mode)),
        )
        .await?;
        info!(
            requests = outcomes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rollout requests finished"
        );

        batch::assemble(
            prompts,
            outcomes,
            &self.config,
            self.parts.processor.as_ref(),
            self.parts.classifier.as_ref(),
            mode,
        )
    }

    fn expand_requests(&self, prompts: &PromptBatch, n: usize) -> Result<Vec<RolloutRequest>> {
        let mut requests = Vec::with_capacity(prompts.len() * n);
        for (batch_index, sample) in prompts.samples.iter().enumerate() {
            let image_token_num = self
                .parts
                .processor
                .image_token_count(&sample.image)
                .map_err(|e| RemoraError::collaborator("image processor", e))?;
            for offset in 0..n {
                requests.push(RolloutRequest {
                    request_id: Uuid::new_v4().to_string(),
                    batch_index,
                    offset,
                    sample: sample.clone(),
                    image_token_num,
                });
            }
        }
        Ok(requests)
    }

    fn transition(
        &self,
        request: &RolloutRequest,
        from: RequestState,
        to: RequestState,
        round: usize,
    ) -> RequestState {
        debug!(
            request_id = %request.request_id,
            doc_id = %request.doc_id(self.config.samples_per_prompt(false)),
            round,
            %from,
            %to,
            "request state change"
        );
        to
    }

    /// Drop ids outside the vocabulary and stray image placeholders.
    fn filter_generated(&self, ids: Vec<u32>) -> Vec<u32> {
        let tokens = &self.config.tokens;
        ids.into_iter()
            .filter(|&id| id != tokens.image_pad_token_id)
            .filter(|&id| tokens.max_valid_token_id.map_or(true, |max| id <= max))
            .collect()
    }

    /// Drive one request to a terminal state and score it.
    pub async fn run_request(
        &self,
        request: RolloutRequest,
        params: &SamplingParams,
        mode: RolloutMode,
    ) -> Result<RolloutOutcome> {
        let (max_rounds, max_images) = self.config.round_limits(mode.is_validate);
        let budget = self.config.context_budget();

        let fork_source = request.clone();
        let mut buffer = self.pool.run(move || TurnBuffer::fork(&fork_source)).await?;
        let prefix_len = buffer.tokens.len();
        let mut context = prefix_len + request.image_token_num.saturating_sub(1);

        let mut state = RequestState::Pending;
        let mut round = 0;
        while round < max_rounds {
            state = self.transition(&request, state, RequestState::Generating, round);

            let round_id = format!("{}-{round}", request.request_id);
            let prompt = EnginePrompt {
                token_ids: &buffer.tokens,
                images: &buffer.images,
            };
            let output = final_output(self.engine.generate(prompt, params, &round_id))
                .await
                .map_err(|e| RemoraError::collaborator("generation engine", e))?;
            let ids = self.filter_generated(output.token_ids);
            buffer.push_generated(&ids);
            context += ids.len();

            let text = self
                .parts
                .tokenizer
                .decode(&ids, true)
                .map_err(|e| RemoraError::collaborator("tokenizer", e))?;

            let Some(payload) = extract_tool_call(&self.tool_pattern, &text) else {
                let truncated = output.finish_reason == Some(FinishReason::Length);
                let answered = self.answer_pattern.is_match(&text);
                let next = if truncated || !answered {
                    RequestState::Void
                } else {
                    RequestState::Completed
                };
                state = self.transition(&request, state, next, round);
                break;
            };
            state = self.transition(&request, state, RequestState::ToolCall, round);

            if buffer.images.len() >= max_images || round + 1 == max_rounds {
                debug!(request_id = %request.request_id, images = buffer.images.len(), round, "round or image limit reached");
                state = self.transition(&request, state, RequestState::Exceeded, round);
                break;
            }
            if context >= budget {
                debug!(request_id = %request.request_id, context, budget, "context budget reached before tool call");
                state = self.transition(&request, state, RequestState::Exceeded, round);
                break;
            }

            let checkpoint = buffer.checkpoint();
            let job = ToolJob {
                payload: payload.to_string(),
                originals: buffer.originals.clone(),
                sizes: buffer.sizes.clone(),
                round,
                tokenizer: self.parts.tokenizer.clone(),
                processor: self.parts.processor.clone(),
                tools: self.parts.tools.clone(),
                template: self.config.template.clone(),
                max_pixels: self.config.max_pixels,
                min_pixels: self.config.min_pixels,
            };
            let turn = self
                .pool
                .run(move || job.run())
                .await?
                .map_err(|e| RemoraError::collaborator("tool turn", e))?;
            context += turn.context_cost();
            buffer.push_tool_turn(turn);

            if context >= budget {
                debug!(request_id = %request.request_id, context, budget, "observation overflows context, rolling back");
                buffer.rollback(checkpoint);
                state = self.transition(&request, state, RequestState::Exceeded, round);
                break;
            }

            state = self.transition(&request, state, RequestState::Generating, round + 1);
            round += 1;
        }
        if !state.is_terminal() {
            warn!(request_id = %request.request_id, %state, "round loop ended without a terminal state");
            state = RequestState::Exceeded;
        }

        self.finish(request, buffer, prefix_len, state, round, mode).await
    }

    /// Expand placeholders, fit to width and score.
    async fn finish(
        &self,
        request: RolloutRequest,
        buffer: TurnBuffer,
        prefix_len: usize,
        state: RequestState,
        round: usize,
        mode: RolloutMode,
    ) -> Result<RolloutOutcome> {
        let rounds = round + 1;
        let generated: usize = buffer.mask.iter().map(|&m| usize::from(m)).sum();
        let avg_response_tokens_per_turn = generated as f32 / rounds as f32;

        let (response_ids, response_mask) = self.expand_image_pads(&buffer, prefix_len)?;

        let tokens = &self.config.tokens;
        let width = self.config.max_total_response_length;
        let padded_ids = fit_width(&response_ids, width, tokens.pad_token_id);
        let padded_mask = fit_width(&response_mask, width, 0);
        let attention = final_eos_row(&padded_ids, tokens.eos_token_id, tokens.pad_token_id);
        let live = attention.iter().rposition(|&m| m == 1).map_or(0, |i| i + 1);
        let response_text = self
            .parts
            .tokenizer
            .decode(&padded_ids[..live], true)
            .map_err(|e| RemoraError::collaborator("tokenizer", e))?;

        let score_request = ScoreRequest {
            uid: request.sample.uid.clone(),
            data_source: request.sample.data_source.clone(),
            ground_truth: request.sample.ground_truth.clone(),
            raw_prompt: request.sample.raw_prompt.clone(),
            response_text,
            response_ids: padded_ids,
            response_mask: padded_mask,
            attention_mask: attention,
            round,
        };
        let scorer = match (&self.parts.val_scorer, mode.is_validate) {
            (Some(val), true) => val.clone(),
            _ => self.parts.scorer.clone(),
        };
        let scores = self
            .pool
            .run(move || scorer.score(&score_request))
            .await?
            .map_err(|e| RemoraError::collaborator("reward scorer", e))?;

        info!(
            request_id = %request.request_id,
            %state,
            rounds,
            images = buffer.images.len(),
            response_tokens = response_ids.len(),
            "request finished"
        );

        Ok(RolloutOutcome {
            request_id: request.request_id,
            batch_index: request.batch_index,
            offset: request.offset,
            sample: request.sample,
            state,
            response_ids,
            response_mask,
            images: buffer.images,
            scores,
            avg_response_tokens_per_turn,
            round_num: rounds,
        })
    }

    /// Response tokens with each observation placeholder expanded to its
    /// image's token count. Expanded tokens carry mask 0.
    fn expand_image_pads(&self, buffer: &TurnBuffer, prefix_len: usize) -> Result<(Vec<u32>, Vec<u8>)> {
        let pad = self.config.tokens.image_pad_token_id;
        let observations = buffer.images.get(1..).unwrap_or_default();
        let grids = self
            .parts
            .processor
            .grid_thw(observations)
            .map_err(|e| RemoraError::collaborator("image processor", e))?;
        let merge = self.parts.processor.merge_size();

        let mut grids = grids.into_iter();
        let mut ids = Vec::with_capacity(buffer.tokens.len() - prefix_len);
        let mut mask = Vec::with_capacity(ids.capacity());
        for (&id, &m) in buffer.tokens[prefix_len..].iter().zip(&buffer.mask[prefix_len..]) {
            if id != pad {
                ids.push(id);
                mask.push(m);
                continue;
            }
            let grid = grids.next().ok_or(RemoraError::ShapeMismatch {
                what: "observation image grids",
                expected: vec![observations.len() + 1],
                actual: vec![observations.len()],
            })?;
            let count = tokens_for_grid(grid, merge);
            ids.extend(std::iter::repeat(pad).take(count));
            mask.extend(std::iter::repeat(0).take(count));
        }
        Ok((ids, mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::image::ImageSize;
    use crate::rollout::mock::{demo_batch, ByteTokenizer, ScriptedEngine, ScriptedTurn};
    use crate::rollout::processor::PatchGridProcessor;
    use crate::rollout::scoring::{AnswerMatchScorer, ZeroVarianceFilter};
    use crate::rollout::tools::CropTool;
    use crate::rollout::types::PositionIds;

    const CROP: &str =
        r#"<grounding>{"bbox_2d": [0, 0, 56, 56], "source": "original_image"}</grounding>"#;
    const ANSWER: &str = "<answer>red</answer><|im_end|>";

    fn config() -> RolloutConfig {
        RolloutConfig {
            n: 2,
            max_generation_round: 3,
            limit_images: 3,
            max_total_response_length: 4096,
            context_safety_margin: 0,
            // Keep observation images small: 112x112 at most.
            max_pixels: 112 * 112,
            min_pixels: 28 * 28,
            blocking_workers: 2,
            ..RolloutConfig::default()
        }
    }

    fn worker(config: RolloutConfig, turns: Vec<ScriptedTurn>) -> RolloutWorker<ScriptedEngine> {
        let tokens = config.tokens.clone();
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(ByteTokenizer::new(&tokens));
        let parts = Collaborators {
            tokenizer: tokenizer.clone(),
            processor: Arc::new(PatchGridProcessor::new(tokens.image_pad_token_id)),
            tools: Arc::new(CropTool::new(false)),
            scorer: Arc::new(AnswerMatchScorer::new(config.max_total_response_length, 0).unwrap()),
            val_scorer: None,
            classifier: Arc::new(ZeroVarianceFilter),
        };
        let engine = ScriptedEngine::per_round(tokenizer, turns);
        RolloutWorker::new(engine, parts, config).unwrap()
    }

    fn prompts(config: &RolloutConfig) -> PromptBatch {
        let tok = ByteTokenizer::new(&config.tokens);
        let proc = PatchGridProcessor::new(config.tokens.image_pad_token_id);
        demo_batch(&tok, &proc, &config.tokens, &[("What colour?", "red")]).unwrap()
    }

    fn request(config: &RolloutConfig) -> RolloutRequest {
        let batch = prompts(config);
        RolloutRequest {
            request_id: "req".into(),
            batch_index: 0,
            offset: 0,
            sample: batch.samples[0].clone(),
            image_token_num: 16,
        }
    }

    async fn run_one(config: RolloutConfig, turns: Vec<ScriptedTurn>) -> RolloutOutcome {
        let req = request(&config);
        let w = worker(config.clone(), turns);
        let params = SamplingParams::from_config(&config, true);
        w.run_request(req, &params, RolloutMode::default()).await.unwrap()
    }

    #[test]
    fn test_turn_buffer_rollback() {
        let config = config();
        let req = request(&config);
        let mut buffer = TurnBuffer::fork(&req);
        let prompt_len = buffer.tokens.len();
        buffer.push_generated(&[1, 2, 3]);
        let cp = buffer.checkpoint();
        let image = Arc::new(DynamicImage::new_rgb8(28, 28));
        buffer.push_tool_turn(ToolTurn {
            prompt_ids: vec![4, 5],
            observation: Some(ObservationImage {
                original: image.clone(),
                resized: image,
            }),
            image_tokens: 1,
        });
        assert_eq!(buffer.images.len(), 2);
        assert_eq!(buffer.sizes[1], ImageSize::new(28, 28));
        buffer.rollback(cp);
        assert_eq!(buffer.tokens.len(), prompt_len + 3);
        assert_eq!(buffer.mask.len(), prompt_len + 3);
        assert_eq!(buffer.images.len(), 1);
        assert_eq!(buffer.originals.len(), 1);
        assert_eq!(&buffer.mask[prompt_len..], &[1, 1, 1]);
    }

    #[tokio::test]
    async fn test_direct_answer_completes() {
        let out = run_one(config(), vec![ScriptedTurn::stop(ANSWER)]).await;
        assert_eq!(out.state, RequestState::Completed);
        assert_eq!(out.round_num, 1);
        assert_eq!(out.images.len(), 1);
        assert!(out.response_mask.iter().all(|&m| m == 1));
        assert_eq!(out.scores.accuracy.sum(), 1.0);
        assert!((out.avg_response_tokens_per_turn - out.response_ids.len() as f32).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_missing_answer_is_void() {
        let out = run_one(config(), vec![ScriptedTurn::stop("I am not sure.<|im_end|>")]).await;
        assert_eq!(out.state, RequestState::Void);
        assert!(out.voided());
    }

    #[tokio::test]
    async fn test_length_truncation_is_void() {
        let out = run_one(config(), vec![ScriptedTurn::length("<answer>red</answer>")]).await;
        assert_eq!(out.state, RequestState::Void);
    }

    #[tokio::test]
    async fn test_tool_call_then_answer() {
        let config = config();
        let out = run_one(
            config.clone(),
            vec![ScriptedTurn::stop(CROP), ScriptedTurn::stop(ANSWER)],
        )
        .await;
        assert_eq!(out.state, RequestState::Completed);
        assert_eq!(out.round_num, 2);
        assert_eq!(out.images.len(), 2);

        // Crop of 56x56 shown pixels is 224x224 in the original, downscaled
        // to 112x112: grid (1, 8, 8), 16 tokens.
        let pad = config.tokens.image_pad_token_id;
        let pads: Vec<usize> = out
            .response_ids
            .iter()
            .enumerate()
            .filter(|(_, &id)| id == pad)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(pads.len(), 16);
        assert!(pads.iter().all(|&i| out.response_mask[i] == 0));
        assert_eq!(out.response_ids.len(), out.response_mask.len());

        // Generated tokens of both rounds are trainable, the observation is not.
        let crop_len = ByteTokenizer::default().encode(CROP).unwrap().len();
        assert!(out.response_mask[..crop_len].iter().all(|&m| m == 1));
        assert_eq!(out.response_mask[crop_len], 0);
        assert_eq!(*out.response_mask.last().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_last_round_tool_call_exceeds() {
        let mut config = config();
        config.max_generation_round = 2;
        let out = run_one(config, vec![ScriptedTurn::stop(CROP)]).await;
        assert_eq!(out.state, RequestState::Exceeded);
        assert_eq!(out.round_num, 2);
        assert_eq!(out.images.len(), 2);
    }

    #[tokio::test]
    async fn test_image_limit_exceeds() {
        let mut config = config();
        config.limit_images = 1;
        let out = run_one(config, vec![ScriptedTurn::stop(CROP)]).await;
        assert_eq!(out.state, RequestState::Exceeded);
        assert_eq!(out.round_num, 1);
        assert_eq!(out.images.len(), 1);
        assert!(out.exceeded());
    }

    #[tokio::test]
    async fn test_context_overflow_rolls_back() {
        let mut config = config();
        let req = request(&config);
        let prompt_len = req.sample.raw_prompt_ids.len();
        let crop_len = ByteTokenizer::default().encode(CROP).unwrap().len();
        // Room for the generation but not for the observation turn.
        config.max_total_response_length = prompt_len + 15 + crop_len + 10;
        let w = worker(config.clone(), vec![ScriptedTurn::stop(CROP), ScriptedTurn::stop(ANSWER)]);
        let params = SamplingParams::from_config(&config, true);
        let out = w.run_request(req, &params, RolloutMode::default()).await.unwrap();
        assert_eq!(out.state, RequestState::Exceeded);
        assert_eq!(out.images.len(), 1);
        // Only the generated call survives the rollback.
        assert_eq!(out.response_ids.len(), crop_len);
        assert!(out.response_mask.iter().all(|&m| m == 1));
        assert_eq!(w.engine().calls(), 1);
    }

    #[tokio::test]
    async fn test_bad_tool_call_becomes_error_turn() {
        let bad = r#"<grounding>{"bbox_2d": [5, 5], "source": "original_image"}</grounding>"#;
        let out = run_one(
            config(),
            vec![ScriptedTurn::stop(bad), ScriptedTurn::stop(ANSWER)],
        )
        .await;
        assert_eq!(out.state, RequestState::Completed);
        assert_eq!(out.images.len(), 1);
        let text = ByteTokenizer::default().decode(&out.response_ids, false).unwrap();
        assert!(text.contains("ERROR occurs during grounding"));
        assert!(!out.response_ids.contains(&config().tokens.image_pad_token_id));
    }

    #[tokio::test]
    async fn test_out_of_vocab_ids_are_dropped() {
        let mut config = config();
        config.tokens.max_valid_token_id = Some(151_644);
        // `<|im_end|>` (151645) is above the cap and disappears.
        let out = run_one(config.clone(), vec![ScriptedTurn::stop(ANSWER)]).await;
        assert!(!out.response_ids.contains(&config.tokens.eos_token_id));
        assert_eq!(out.state, RequestState::Completed);
    }

    #[tokio::test]
    async fn test_generate_sequences_builds_batch() {
        let config = config();
        let prompts = prompts(&config);
        let w = worker(
            config.clone(),
            vec![ScriptedTurn::stop(CROP), ScriptedTurn::stop(ANSWER)],
        );
        w.wake_up().await.unwrap();
        let batch = w.generate_sequences(&prompts, RolloutMode::default()).await.unwrap();
        w.sleep().await.unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.responses.dim(), (2, config.max_total_response_length));
        assert_eq!(
            batch.input_ids.ncols(),
            prompts.prompt_length() + config.max_total_response_length
        );
        let PositionIds::Rope(pos) = &batch.position_ids else {
            panic!("expected rotary positions");
        };
        assert_eq!(pos.dim(), (2, 3, batch.input_ids.ncols()));
        assert!(batch.rows.iter().all(|r| r.state == RequestState::Completed));
        assert!(batch.exceed_mask.iter().all(|&e| !e));
        // Both samples scored the same, so the group carries no signal.
        assert!(batch.rows.iter().all(|r| r.valid == Some(false) && r.images.is_none()));
        assert_eq!(w.engine().calls(), 4);
    }

    #[tokio::test]
    async fn test_validation_uses_val_limits() {
        let mut config = config();
        config.val_n = 1;
        config.val_max_generation_round = 2;
        let prompts = prompts(&config);
        let w = worker(config.clone(), vec![ScriptedTurn::stop(CROP)]);
        let mode = RolloutMode {
            do_sample: false,
            is_validate: true,
        };
        let batch = w.generate_sequences(&prompts, mode).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.exceed_mask[0]);
        assert_eq!(batch.rows[0].round_num, 2);
        assert!(batch.statistics.is_none());
    }
}
