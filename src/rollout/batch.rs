//! Reassembly of finished requests into one rectangular training batch.
//!
//! Rows come back from concurrent tasks in arbitrary order. They are sorted by
//! `(batch_index, offset)`, fitted to `max_total_response_length`, joined to
//! their (repeated) prompts, and given fresh attention masks, position ids and
//! reward tensors.

use std::collections::BTreeMap;
use std::sync::Arc;

use image::DynamicImage;
use ndarray::{concatenate, s, Array1, Array2, Array3, Axis};
use serde::Serialize;
use tracing::info;

use crate::config::RolloutConfig;
use crate::error::{RemoraError, Result};

use super::processor::ImageProcessor;
use super::scoring::{ValidityClassifier, ValidityInput};
use super::types::{PositionIds, PromptBatch, RequestState, RolloutMode, RolloutOutcome};

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Pad with `pad` or truncate so the result is exactly `width` long.
pub fn fit_width<T: Copy>(values: &[T], width: usize, pad: T) -> Vec<T> {
    let mut out: Vec<T> = values.iter().take(width).copied().collect();
    out.resize(width, pad);
    out
}

/// Attention over one response row: 1 up to and including the last EOS.
///
/// A row without EOS is live up to its last non-pad token.
pub fn final_eos_row(ids: &[u32], eos_token_id: u32, pad_token_id: u32) -> Vec<u8> {
    let end = ids
        .iter()
        .rposition(|&id| id == eos_token_id)
        .or_else(|| ids.iter().rposition(|&id| id != pad_token_id));
    let mut mask = vec![0u8; ids.len()];
    if let Some(end) = end {
        mask[..=end].fill(1);
    }
    mask
}

/// [`final_eos_row`] applied to every row.
pub fn final_eos_mask(responses: &Array2<u32>, eos_token_id: u32, pad_token_id: u32) -> Array2<u8> {
    let mut mask = Array2::<u8>::zeros(responses.dim());
    for (row, mut out) in responses.outer_iter().zip(mask.outer_iter_mut()) {
        let ids: Vec<u32> = row.to_vec();
        let live = final_eos_row(&ids, eos_token_id, pad_token_id);
        out.assign(&Array1::from(live));
    }
    mask
}

fn repeat_rows<T: Clone>(a: &Array2<T>, n: usize) -> Array2<T> {
    let idx: Vec<usize> = (0..a.nrows()).flat_map(|i| std::iter::repeat(i).take(n)).collect();
    a.select(Axis(0), &idx)
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Per-row metadata that travels next to the tensors.
#[derive(Debug, Clone)]
pub struct RowMeta {
    pub request_id: String,
    pub uid: String,
    pub data_source: String,
    pub ground_truth: String,
    pub raw_prompt: String,
    pub state: RequestState,
    /// Images of the row; cleared for invalid rows so the batch stays rectangular.
    pub images: Option<Vec<Arc<DynamicImage>>>,
    pub avg_response_tokens_per_turn: f32,
    pub round_num: usize,
    pub acc_score: f32,
    pub format_score: f32,
    pub overlong_score: f32,
    /// `None` in validation mode.
    pub valid: Option<bool>,
}

/// Diagnostics from the validity pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStatistics {
    /// Ids the scorer asked to exclude.
    pub invalid_num: usize,
    pub wrong_and_use_tool_uids: Vec<String>,
    pub wrong_and_direct_answer_uids: Vec<String>,
    pub values: BTreeMap<String, f64>,
}

/// Rectangular rollout batch. Sequence tensors are `prompt_length +
/// max_total_response_length` wide; response tensors are
/// `max_total_response_length` wide.
#[derive(Debug, Clone)]
pub struct RolloutBatch {
    pub prompts: Array2<u32>,
    pub responses: Array2<u32>,
    pub input_ids: Array2<u32>,
    pub attention_mask: Array2<u8>,
    pub position_ids: PositionIds,
    /// 1 on assistant tokens of the response, 0 on prompts, observations and padding.
    pub multi_turn_response_mask: Array2<u8>,
    pub reward_tensor: Array2<f32>,
    pub exceed_mask: Vec<bool>,
    pub void_mask: Vec<bool>,
    pub rows: Vec<RowMeta>,
    /// Present outside validation.
    pub statistics: Option<BatchStatistics>,
}

/// Aggregate view of a batch for logs and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub rows: usize,
    pub sequence_width: usize,
    pub completed: usize,
    pub exceeded: usize,
    pub void: usize,
    pub valid: Option<usize>,
    pub mean_reward: f32,
    pub mean_accuracy: f32,
    pub mean_rounds: f32,
    pub mean_response_tokens_per_turn: f32,
    pub statistics: Option<BatchStatistics>,
}

impl RolloutBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn response_width(&self) -> usize {
        self.responses.ncols()
    }

    /// Training mask over the response part: assistant tokens that are live.
    pub fn response_mask(&self) -> Array2<f32> {
        let start = self.prompts.ncols();
        let turn = self.multi_turn_response_mask.slice(s![.., start..]);
        let live = self.attention_mask.slice(s![.., start..]);
        ndarray::Zip::from(&turn)
            .and(&live)
            .map_collect(|&t, &l| f32::from(t * l))
    }

    /// Group id per row.
    pub fn group_index(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.uid.clone()).collect()
    }

    pub fn summary(&self) -> BatchSummary {
        let rows = self.rows.len();
        let denom = rows.max(1) as f32;
        let count = |state: RequestState| self.rows.iter().filter(|r| r.state == state).count();
        let valid = self
            .statistics
            .as_ref()
            .map(|_| self.rows.iter().filter(|r| r.valid == Some(true)).count());
        BatchSummary {
            rows,
            sequence_width: self.input_ids.ncols(),
            completed: count(RequestState::Completed),
            exceeded: count(RequestState::Exceeded),
            void: count(RequestState::Void),
            valid,
            mean_reward: self.reward_tensor.sum() / denom,
            mean_accuracy: self.rows.iter().map(|r| r.acc_score).sum::<f32>() / denom,
            mean_rounds: self.rows.iter().map(|r| r.round_num as f32).sum::<f32>() / denom,
            mean_response_tokens_per_turn: self
                .rows
                .iter()
                .map(|r| r.avg_response_tokens_per_turn)
                .sum::<f32>()
                / denom,
            statistics: self.statistics.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Fold finished requests into a [`RolloutBatch`].
pub fn assemble(
    prompts: &PromptBatch,
    mut outcomes: Vec<RolloutOutcome>,
    config: &RolloutConfig,
    processor: &dyn ImageProcessor,
    classifier: &dyn ValidityClassifier,
    mode: RolloutMode,
) -> Result<RolloutBatch> {
    let n = config.samples_per_prompt(mode.is_validate);
    let rows = prompts.len() * n;
    if outcomes.len() != rows {
        return Err(RemoraError::ShapeMismatch {
            what: "rollout outcomes",
            expected: vec![rows],
            actual: vec![outcomes.len()],
        });
    }
    outcomes.sort_by_key(|o| (o.batch_index, o.offset));

    let width = config.max_total_response_length;
    let tokens = &config.tokens;
    let mut responses = Array2::<u32>::zeros((rows, width));
    let mut response_mask = Array2::<u8>::zeros((rows, width));
    let mut rewards = Array2::<f32>::zeros((rows, width));
    let mut accuracy = Array2::<f32>::zeros((rows, width));
    let mut format = Array2::<f32>::zeros((rows, width));
    let mut overlong = Array2::<f32>::zeros((rows, width));
    for (i, outcome) in outcomes.iter().enumerate() {
        let ids = fit_width(&outcome.response_ids, width, tokens.pad_token_id);
        let mask = fit_width(&outcome.response_mask, width, 0);
        responses.row_mut(i).assign(&Array1::from(ids));
        response_mask.row_mut(i).assign(&Array1::from(mask));

        let scores = &outcome.scores;
        for (target, source, what) in [
            (&mut rewards, &scores.reward, "reward_tensor"),
            (&mut accuracy, &scores.accuracy, "accuracy reward"),
            (&mut format, &scores.format, "format reward"),
            (&mut overlong, &scores.overlong, "overlong reward"),
        ] {
            if source.len() != width {
                return Err(RemoraError::ShapeMismatch {
                    what,
                    expected: vec![width],
                    actual: vec![source.len()],
                });
            }
            target.row_mut(i).assign(source);
        }
    }

    let prompt_ids = repeat_rows(&prompts.input_ids, n);
    let prompt_attention = repeat_rows(&prompts.attention_mask, n);
    let response_attention = final_eos_mask(&responses, tokens.eos_token_id, tokens.pad_token_id);

    let input_ids = concatenate(Axis(1), &[prompt_ids.view(), responses.view()])
        .map_err(|_| RemoraError::shape("input_ids", prompt_ids.dim(), responses.dim()))?;
    let attention_mask = concatenate(Axis(1), &[prompt_attention.view(), response_attention.view()])
        .map_err(|_| RemoraError::shape("attention_mask", prompt_attention.dim(), response_attention.dim()))?;
    let prompt_zeros = Array2::<u8>::zeros(prompt_ids.dim());
    let multi_turn_response_mask = concatenate(Axis(1), &[prompt_zeros.view(), response_mask.view()])
        .map_err(|_| RemoraError::shape("multi_turn_response_mask", prompt_zeros.dim(), response_mask.dim()))?;

    let position_ids = match &prompts.position_ids {
        PositionIds::Flat(prompt_positions) => {
            let repeated = repeat_rows(prompt_positions, n);
            let last = repeated.column(repeated.ncols().saturating_sub(1)).to_owned();
            let mut response_positions = Array2::<i64>::zeros((rows, width));
            for ((r, t), slot) in response_positions.indexed_iter_mut() {
                *slot = last[r] + t as i64 + 1;
            }
            let joined = concatenate(Axis(1), &[repeated.view(), response_positions.view()])
                .map_err(|_| RemoraError::shape("position_ids", repeated.dim(), (rows, width)))?;
            PositionIds::Flat(joined)
        }
        PositionIds::Rope(_) => {
            let total = input_ids.ncols();
            let mut positions = Array3::<i64>::zeros((rows, 3, total));
            for (i, outcome) in outcomes.iter().enumerate() {
                let grids = processor
                    .grid_thw(&outcome.images)
                    .map_err(|e| RemoraError::collaborator("image processor", e))?;
                let row = processor
                    .rope_index(input_ids.row(i), &grids, attention_mask.row(i))
                    .map_err(|e| RemoraError::collaborator("image processor", e))?;
                if row.dim() != (3, total) {
                    return Err(RemoraError::shape("rope index", (3, total), row.dim()));
                }
                positions.slice_mut(s![i, .., ..]).assign(&row);
            }
            PositionIds::Rope(positions)
        }
    };

    let acc_scores = accuracy.sum_axis(Axis(1));
    let format_scores = format.sum_axis(Axis(1));
    let overlong_scores = overlong.sum_axis(Axis(1));
    let invalid_uids: Vec<String> = outcomes
        .iter()
        .flat_map(|o| o.scores.invalid_uids.iter().cloned())
        .collect();

    let mut meta: Vec<RowMeta> = outcomes
        .iter()
        .enumerate()
        .map(|(i, o)| RowMeta {
            request_id: o.request_id.clone(),
            uid: o.sample.uid.clone(),
            data_source: o.sample.data_source.clone(),
            ground_truth: o.sample.ground_truth.clone(),
            raw_prompt: o.sample.raw_prompt.clone(),
            state: o.state,
            images: Some(o.images.clone()),
            avg_response_tokens_per_turn: o.avg_response_tokens_per_turn,
            round_num: o.round_num,
            acc_score: acc_scores[i],
            format_score: format_scores[i],
            overlong_score: overlong_scores[i],
            valid: None,
        })
        .collect();

    let statistics = if mode.is_validate {
        None
    } else {
        let uids: Vec<String> = meta.iter().map(|m| m.uid.clone()).collect();
        let image_counts: Vec<usize> = outcomes.iter().map(|o| o.images.len()).collect();
        let report = classifier
            .classify(&ValidityInput {
                uids: &uids,
                image_counts: &image_counts,
                rewards: &rewards,
                accuracy: &accuracy,
                format: &format,
                invalid_uids: &invalid_uids,
            })
            .map_err(|e| RemoraError::collaborator("validity classifier", e))?;
        if report.valid.len() != rows {
            return Err(RemoraError::ShapeMismatch {
                what: "valid mask",
                expected: vec![rows],
                actual: vec![report.valid.len()],
            });
        }
        for (row, &valid) in meta.iter_mut().zip(&report.valid) {
            row.valid = Some(valid);
            if !valid {
                row.images = None;
            }
        }
        Some(BatchStatistics {
            invalid_num: invalid_uids.len(),
            wrong_and_use_tool_uids: report.wrong_and_use_tool_uids,
            wrong_and_direct_answer_uids: report.wrong_and_direct_answer_uids,
            values: report.statistics,
        })
    };

    let batch = RolloutBatch {
        prompts: prompt_ids,
        responses,
        input_ids,
        attention_mask,
        position_ids,
        multi_turn_response_mask,
        reward_tensor: rewards,
        exceed_mask: outcomes.iter().map(RolloutOutcome::exceeded).collect(),
        void_mask: outcomes.iter().map(RolloutOutcome::voided).collect(),
        rows: meta,
        statistics,
    };
    let summary = batch.summary();
    info!(
        rows = summary.rows,
        completed = summary.completed,
        exceeded = summary.exceeded,
        void = summary.void,
        valid = ?summary.valid,
        mean_reward = summary.mean_reward,
        "rollout batch assembled"
    );
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::processor::PatchGridProcessor;
    use crate::rollout::scoring::ZeroVarianceFilter;
    use crate::rollout::types::{PromptSample, RewardScores};
    use ndarray::array;

    const PAD: u32 = 0;
    const EOS: u32 = 2;

    #[test]
    fn test_fit_width() {
        assert_eq!(fit_width(&[1, 2, 3], 5, 0), vec![1, 2, 3, 0, 0]);
        assert_eq!(fit_width(&[1, 2, 3], 2, 0), vec![1, 2]);
    }

    #[test]
    fn test_final_eos_row() {
        // Last EOS wins, tokens after it are dropped.
        assert_eq!(final_eos_row(&[5, EOS, 6, EOS, 7, PAD], EOS, PAD), vec![1, 1, 1, 1, 0, 0]);
        // No EOS: live through the last non-pad token.
        assert_eq!(final_eos_row(&[5, 6, PAD, PAD], EOS, PAD), vec![1, 1, 0, 0]);
        assert_eq!(final_eos_row(&[PAD, PAD], EOS, PAD), vec![0, 0]);
    }

    fn sample(uid: &str) -> Arc<PromptSample> {
        let image = Arc::new(DynamicImage::new_rgb8(56, 56));
        Arc::new(PromptSample {
            raw_prompt_ids: vec![7, 8],
            image: image.clone(),
            original_image: image,
            raw_prompt: "q".into(),
            index: uid.into(),
            uid: uid.into(),
            ground_truth: "a".into(),
            data_source: "demo".into(),
        })
    }

    fn outcome(batch_index: usize, offset: usize, ids: Vec<u32>, reward: f32, width: usize) -> RolloutOutcome {
        let s = sample(&format!("p{batch_index}"));
        let mut scores = RewardScores::zeros(width);
        scores.reward[0] = reward;
        scores.accuracy[0] = reward;
        RolloutOutcome {
            request_id: format!("r{batch_index}-{offset}"),
            batch_index,
            offset,
            response_mask: vec![1; ids.len()],
            response_ids: ids,
            images: vec![s.image.clone()],
            sample: s,
            state: RequestState::Completed,
            scores,
            avg_response_tokens_per_turn: 2.0,
            round_num: 1,
        }
    }

    fn prompts() -> PromptBatch {
        PromptBatch {
            input_ids: array![[PAD, 7, 8], [7, 8, 9]],
            attention_mask: array![[0, 1, 1], [1, 1, 1]],
            position_ids: PositionIds::Flat(array![[0, 0, 1], [0, 1, 2]]),
            samples: vec![sample("p0"), sample("p1")],
        }
    }

    fn config(width: usize) -> RolloutConfig {
        let mut config = RolloutConfig {
            n: 2,
            max_total_response_length: width,
            ..RolloutConfig::default()
        };
        config.tokens.pad_token_id = PAD;
        config.tokens.eos_token_id = EOS;
        config
    }

    #[test]
    fn test_assemble_orders_pads_and_repeats() {
        let width = 4;
        let config = config(width);
        let outs = vec![
            outcome(1, 1, vec![5, 6, 7, 8, 9, 10], 0.0, width),
            outcome(0, 1, vec![5, EOS], 1.0, width),
            outcome(1, 0, vec![5, EOS], 1.0, width),
            outcome(0, 0, vec![5, 6, EOS], 0.0, width),
        ];
        let batch = assemble(
            &prompts(),
            outs,
            &config,
            &PatchGridProcessor::new(99),
            &ZeroVarianceFilter,
            RolloutMode::default(),
        )
        .unwrap();

        let order: Vec<&str> = batch.rows.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(order, vec!["r0-0", "r0-1", "r1-0", "r1-1"]);
        assert_eq!(batch.responses.dim(), (4, width));
        assert_eq!(batch.input_ids.dim(), (4, 3 + width));
        assert_eq!(batch.attention_mask.dim(), (4, 3 + width));
        assert_eq!(batch.reward_tensor.dim(), (4, width));

        // Truncated row keeps the first `width` tokens.
        assert_eq!(batch.responses.row(3).to_vec(), vec![5, 6, 7, 8]);
        // Prompts are repeated per sample.
        assert_eq!(batch.prompts.row(0), batch.prompts.row(1));
        assert_eq!(batch.prompts.row(2).to_vec(), vec![7, 8, 9]);
        // Final-EOS attention on the response half.
        assert_eq!(batch.attention_mask.row(0).to_vec(), vec![0, 1, 1, 1, 1, 1, 0]);
        assert_eq!(batch.multi_turn_response_mask.row(0).to_vec(), vec![0, 0, 0, 1, 1, 1, 0]);

        let PositionIds::Flat(pos) = &batch.position_ids else {
            panic!("expected flat positions");
        };
        assert_eq!(pos.row(0).to_vec(), vec![0, 0, 1, 2, 3, 4, 5]);
        assert_eq!(pos.row(2).to_vec(), vec![0, 1, 2, 3, 4, 5, 6]);

        let stats = batch.statistics.as_ref().unwrap();
        assert_eq!(stats.invalid_num, 0);
        assert!(batch.rows.iter().all(|r| r.valid == Some(true)));
        assert_eq!(batch.rows[1].acc_score, 1.0);
    }

    #[test]
    fn test_invalid_rows_lose_images() {
        let width = 3;
        let config = config(width);
        let outs = vec![
            outcome(0, 0, vec![5, EOS], 1.0, width),
            outcome(0, 1, vec![5, EOS], 1.0, width),
            outcome(1, 0, vec![5, EOS], 1.0, width),
            outcome(1, 1, vec![5, EOS], 0.0, width),
        ];
        let batch = assemble(
            &prompts(),
            outs,
            &config,
            &PatchGridProcessor::new(99),
            &ZeroVarianceFilter,
            RolloutMode::default(),
        )
        .unwrap();
        assert_eq!(batch.rows[0].valid, Some(false));
        assert!(batch.rows[0].images.is_none());
        assert!(batch.rows[2].images.is_some());
        // Shape is unchanged.
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.summary().valid, Some(2));
    }

    #[test]
    fn test_validation_skips_classifier() {
        let width = 3;
        let mut config = config(width);
        config.val_n = 1;
        let outs = vec![
            outcome(0, 0, vec![5, EOS], 1.0, width),
            outcome(1, 0, vec![5, EOS], 1.0, width),
        ];
        let batch = assemble(
            &prompts(),
            outs,
            &config,
            &PatchGridProcessor::new(99),
            &ZeroVarianceFilter,
            RolloutMode {
                do_sample: false,
                is_validate: true,
            },
        )
        .unwrap();
        assert!(batch.statistics.is_none());
        assert!(batch.rows.iter().all(|r| r.valid.is_none() && r.images.is_some()));
    }

    #[test]
    fn test_row_count_mismatch() {
        let width = 3;
        let config = config(width);
        let outs = vec![outcome(0, 0, vec![5], 0.0, width)];
        let err = assemble(
            &prompts(),
            outs,
            &config,
            &PatchGridProcessor::new(99),
            &ZeroVarianceFilter,
            RolloutMode::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RemoraError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_response_mask_for_training() {
        let width = 4;
        let config = config(width);
        let outs = vec![
            outcome(0, 0, vec![5, EOS, 6], 0.0, width),
            outcome(0, 1, vec![5, EOS], 1.0, width),
            outcome(1, 0, vec![5, EOS], 1.0, width),
            outcome(1, 1, vec![5, EOS], 0.0, width),
        ];
        let batch = assemble(
            &prompts(),
            outs,
            &config,
            &PatchGridProcessor::new(99),
            &ZeroVarianceFilter,
            RolloutMode::default(),
        )
        .unwrap();
        let mask = batch.response_mask();
        assert_eq!(mask.dim(), (4, width));
        // Token after the final EOS is not trained on.
        assert_eq!(mask.row(0).to_vec(), vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(batch.group_index()[3], "p1");
    }
}
