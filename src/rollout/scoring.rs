//! Reward scoring and validity classification seams, with rule-based
//! implementations of both.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, Axis};
use regex::Regex;
use serde::Serialize;

use super::types::RewardScores;

// ---------------------------------------------------------------------------
// Reward scoring
// ---------------------------------------------------------------------------

/// One finished row handed to the scorer.
#[derive(Debug, Clone)]
pub struct ScoreRequest {
    pub uid: String,
    pub data_source: String,
    pub ground_truth: String,
    pub raw_prompt: String,
    /// Decoded live response text, special tokens skipped.
    pub response_text: String,
    /// Response ids padded or truncated to the total response width.
    pub response_ids: Vec<u32>,
    /// Assistant-token mask over `response_ids`.
    pub response_mask: Vec<u8>,
    /// Final-EOS attention mask over `response_ids`.
    pub attention_mask: Vec<u8>,
    /// Zero-based round the request finished in.
    pub round: usize,
}

impl ScoreRequest {
    /// Live response tokens.
    pub fn response_len(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m == 1).count()
    }

    /// Index that carries the outcome reward: the last live position.
    pub fn reward_index(&self) -> usize {
        self.attention_mask.iter().rposition(|&m| m == 1).unwrap_or(0)
    }
}

/// Scores one row. Every returned tensor must be as wide as `response_ids`.
pub trait RewardScorer: Send + Sync {
    fn score(&self, request: &ScoreRequest) -> Result<RewardScores>;
}

/// Rewards a final answer that matches the ground truth.
///
/// `reward = accuracy + format_weight * format + overlong`, all placed on the
/// last live token.
#[derive(Debug, Clone)]
pub struct AnswerMatchScorer {
    answer: Regex,
    /// Weight of the format reward (default: 0.5).
    pub format_weight: f32,
    /// Live-length budget before the overlong penalty applies.
    pub max_response_len: usize,
    /// Tokens before `max_response_len` over which the penalty ramps to -1.
    pub overlong_buffer: usize,
}

impl AnswerMatchScorer {
    pub fn new(max_response_len: usize, overlong_buffer: usize) -> Result<Self> {
        Ok(Self {
            answer: Regex::new(r"(?s)<answer>(.*?)</answer>")?,
            format_weight: 0.5,
            max_response_len,
            overlong_buffer,
        })
    }

    fn overlong_penalty(&self, len: usize) -> f32 {
        let threshold = self.max_response_len.saturating_sub(self.overlong_buffer);
        if self.overlong_buffer == 0 || len <= threshold {
            return 0.0;
        }
        let over = (len - threshold) as f32 / self.overlong_buffer as f32;
        (-over).max(-1.0)
    }
}

impl RewardScorer for AnswerMatchScorer {
    fn score(&self, request: &ScoreRequest) -> Result<RewardScores> {
        let width = request.response_ids.len();
        ensure!(
            request.attention_mask.len() == width,
            "attention mask has {} positions for {} ids",
            request.attention_mask.len(),
            width
        );
        let mut scores = RewardScores::zeros(width);
        if width == 0 {
            return Ok(scores);
        }

        let answer = self
            .answer
            .captures_iter(&request.response_text)
            .last()
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_lowercase());
        let format = if answer.is_some() { 1.0 } else { 0.0 };
        let accuracy = match answer {
            Some(a) if a == request.ground_truth.trim().to_lowercase() => 1.0,
            _ => 0.0,
        };
        let overlong = self.overlong_penalty(request.response_len());

        let idx = request.reward_index();
        scores.accuracy[idx] = accuracy;
        scores.format[idx] = format;
        scores.overlong[idx] = overlong;
        scores.reward[idx] = accuracy + self.format_weight * format + overlong;
        Ok(scores)
    }
}

// ---------------------------------------------------------------------------
// Validity classification
// ---------------------------------------------------------------------------

/// Batch-level view handed to the classifier, rows in final order.
#[derive(Debug, Clone, Copy)]
pub struct ValidityInput<'a> {
    pub uids: &'a [String],
    /// Images attached to each row, prompt image included.
    pub image_counts: &'a [usize],
    pub rewards: &'a Array2<f32>,
    pub accuracy: &'a Array2<f32>,
    pub format: &'a Array2<f32>,
    /// Ids the scorer asked to exclude.
    pub invalid_uids: &'a [String],
}

/// Validity split plus diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidityReport {
    pub valid: Vec<bool>,
    /// Groups with a wrong answer that used at least one tool call.
    pub wrong_and_use_tool_uids: Vec<String>,
    /// Groups with a wrong answer given without any tool call.
    pub wrong_and_direct_answer_uids: Vec<String>,
    pub statistics: BTreeMap<String, f64>,
}

/// Partitions rows into valid and invalid for training.
pub trait ValidityClassifier: Send + Sync {
    fn classify(&self, input: &ValidityInput<'_>) -> Result<ValidityReport>;
}

/// Marks a group invalid when its rewards carry no relative signal (every
/// sample scored the same) or when the scorer flagged it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroVarianceFilter;

impl ValidityClassifier for ZeroVarianceFilter {
    fn classify(&self, input: &ValidityInput<'_>) -> Result<ValidityReport> {
        let rows = input.uids.len();
        ensure!(
            input.image_counts.len() == rows && input.rewards.nrows() == rows,
            "validity inputs disagree on row count"
        );
        let totals: Array1<f32> = input.rewards.sum_axis(Axis(1));
        let accuracy: Array1<f32> = input.accuracy.sum_axis(Axis(1));
        let format: Array1<f32> = input.format.sum_axis(Axis(1));
        let flagged: HashSet<&str> = input.invalid_uids.iter().map(String::as_str).collect();

        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (row, uid) in input.uids.iter().enumerate() {
            groups.entry(uid.as_str()).or_default().push(row);
        }

        let mut valid = vec![true; rows];
        let mut zero_variance_groups = 0usize;
        for (uid, members) in &groups {
            let first = totals[members[0]];
            let flat = members.len() > 1 && members.iter().all(|&r| totals[r] == first);
            if flat {
                zero_variance_groups += 1;
            }
            if flat || flagged.contains(uid) {
                for &r in members {
                    valid[r] = false;
                }
            }
        }

        let mut wrong_tool: Vec<String> = Vec::new();
        let mut wrong_direct: Vec<String> = Vec::new();
        for (row, uid) in input.uids.iter().enumerate() {
            if accuracy[row] > 0.0 {
                continue;
            }
            let bucket = if input.image_counts[row] > 1 {
                &mut wrong_tool
            } else {
                &mut wrong_direct
            };
            if !bucket.contains(uid) {
                bucket.push(uid.clone());
            }
        }

        let denom = rows.max(1) as f64;
        let tool_rows = input.image_counts.iter().filter(|&&c| c > 1).count();
        let valid_rows = valid.iter().filter(|&&v| v).count();
        let mut statistics = BTreeMap::new();
        statistics.insert("valid_rows".into(), valid_rows as f64);
        statistics.insert("invalid_rows".into(), (rows - valid_rows) as f64);
        statistics.insert("zero_variance_groups".into(), zero_variance_groups as f64);
        statistics.insert("tool_use_rate".into(), tool_rows as f64 / denom);
        statistics.insert(
            "accuracy_mean".into(),
            f64::from(accuracy.sum()) / denom,
        );
        statistics.insert("format_mean".into(), f64::from(format.sum()) / denom);

        Ok(ValidityReport {
            valid,
            wrong_and_use_tool_uids: wrong_tool,
            wrong_and_direct_answer_uids: wrong_direct,
            statistics,
        })
    }
}
