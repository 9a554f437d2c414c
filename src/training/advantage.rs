//! Advantage and return estimators.
//!
//! Every estimator maps token-level rewards `R (rows x T)` and a response mask
//! `M (rows x T)` to an advantage tensor `A` and a return tensor `G` of the same
//! shape. Positions with mask 0 never feed a statistic and are zero in outcome
//! estimators' outputs.
//!
//! - **GAE**: `delta_t = R_t + gamma * V_{t+1} - V_t`, `A_t = delta_t + gamma * lambda * A_{t+1}`,
//!   `G = A + V`, then `A` is whitened over the masked batch.
//! - **GRPO**: per-row score `s = sum_t R_t`, normalized inside its group:
//!
//!     A_i = (s_i - mean(s_g)) / (std(s_g) + eps)
//!
//! - **RLOO**: leave-one-out baseline, `A_i = k/(k-1) * (s_i - mean(s_g))`.
//! - **REINFORCE++**: discounted return that resets at mask boundaries, whitened.
//! - **ReMax**: undiscounted reverse cumulative return minus a per-row baseline.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::str::FromStr;

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AlgorithmConfig;
use crate::error::{RemoraError, Result};

use super::masked::{ensure_same_shape, masked_whiten};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// How GRPO turns a centred group score into an advantage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GrpoNorm {
    /// `(s - mean) / (std + eps)`.
    Std,
    /// `(s - mean) / (scale / std + eps)`.
    ///
    /// Kept selectable for experiments; its scaling has not been checked
    /// against a published derivation.
    Importance { scale: f32 },
    /// `s - mean`.
    MeanOnly,
}

/// A named advantage estimator with its hyper-parameters bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AdvantageEstimator {
    Gae { gamma: f32, lam: f32 },
    Grpo { norm: GrpoNorm, epsilon: f32 },
    Rloo,
    ReinforcePlusPlus { gamma: f32 },
    Remax,
}

/// Estimator names without hyper-parameters, as spelled in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorKind {
    Gae,
    Grpo,
    Rloo,
    ReinforcePlusPlus,
    Remax,
}

impl FromStr for EstimatorKind {
    type Err = RemoraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gae" => Ok(Self::Gae),
            "grpo" => Ok(Self::Grpo),
            "rloo" => Ok(Self::Rloo),
            "reinforce_plus_plus" => Ok(Self::ReinforcePlusPlus),
            "remax" => Ok(Self::Remax),
            other => Err(RemoraError::InvalidConfig(format!(
                "unknown advantage estimator: {other}"
            ))),
        }
    }
}

/// Inputs shared by all estimators. Optional fields are required by some.
#[derive(Debug, Clone, Copy)]
pub struct AdvantageInputs<'a> {
    pub token_level_rewards: &'a Array2<f32>,
    pub response_mask: &'a Array2<f32>,
    /// Critic values, required by GAE.
    pub values: Option<&'a Array2<f32>>,
    /// Group id per row, required by GRPO and RLOO.
    pub index: Option<&'a [String]>,
    /// Per-row baseline rewards, required by ReMax.
    pub reward_baselines: Option<&'a Array1<f32>>,
}

/// Advantages and returns, both `rows x T`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvantageOutput {
    pub advantages: Array2<f32>,
    pub returns: Array2<f32>,
}

impl AdvantageEstimator {
    /// Resolve the configured estimator, rejecting unknown names and policies.
    pub fn from_config(config: &AlgorithmConfig) -> Result<Self> {
        let kind: EstimatorKind = config.adv_estimator.parse()?;
        let estimator = match kind {
            EstimatorKind::Gae => Self::Gae {
                gamma: config.gamma,
                lam: config.lam,
            },
            EstimatorKind::Grpo => {
                let norm = if config.norm_adv_by_std_in_grpo {
                    GrpoNorm::Std
                } else {
                    match config.norm_by_importance.as_deref() {
                        Some("v1") => GrpoNorm::Importance {
                            scale: config.importance_scale,
                        },
                        Some(other) => {
                            return Err(RemoraError::InvalidConfig(format!(
                                "unknown norm_by_importance policy: {other}"
                            )))
                        }
                        None => GrpoNorm::MeanOnly,
                    }
                };
                Self::Grpo {
                    norm,
                    epsilon: config.grpo_epsilon,
                }
            }
            EstimatorKind::Rloo => Self::Rloo,
            EstimatorKind::ReinforcePlusPlus => Self::ReinforcePlusPlus {
                gamma: config.gamma,
            },
            EstimatorKind::Remax => Self::Remax,
        };
        Ok(estimator)
    }

    /// Configuration name of this estimator.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gae { .. } => "gae",
            Self::Grpo { .. } => "grpo",
            Self::Rloo => "rloo",
            Self::ReinforcePlusPlus { .. } => "reinforce_plus_plus",
            Self::Remax => "remax",
        }
    }

    /// Whether the estimator needs critic values.
    pub fn uses_critic(&self) -> bool {
        matches!(self, Self::Gae { .. })
    }

    /// Compute `(advantages, returns)` for the batch.
    pub fn estimate(&self, inputs: &AdvantageInputs<'_>) -> Result<AdvantageOutput> {
        let rewards = inputs.token_level_rewards;
        let mask = inputs.response_mask;
        let (advantages, returns) = match *self {
            Self::Gae { gamma, lam } => {
                let values = inputs.values.ok_or_else(|| missing("gae", "values"))?;
                compute_gae_advantage_return(rewards, values, mask, gamma, lam)?
            }
            Self::Grpo { norm, epsilon } => {
                let index = inputs.index.ok_or_else(|| missing("grpo", "index"))?;
                compute_grpo_outcome_advantage(rewards, mask, index, norm, epsilon)?
            }
            Self::Rloo => {
                let index = inputs.index.ok_or_else(|| missing("rloo", "index"))?;
                compute_rloo_outcome_advantage(rewards, mask, index)?
            }
            Self::ReinforcePlusPlus { gamma } => {
                compute_reinforce_plus_plus_outcome_advantage(rewards, mask, gamma)?
            }
            Self::Remax => {
                let baselines = inputs
                    .reward_baselines
                    .ok_or_else(|| missing("remax", "reward_baselines"))?;
                compute_remax_outcome_advantage(rewards, baselines, mask)?
            }
        };
        debug!(
            estimator = self.name(),
            rows = rewards.nrows(),
            width = rewards.ncols(),
            "advantages computed"
        );
        Ok(AdvantageOutput {
            advantages,
            returns,
        })
    }
}

fn missing(estimator: &str, input: &str) -> RemoraError {
    RemoraError::InvalidConfig(format!("{estimator} estimator requires `{input}`"))
}

// ---------------------------------------------------------------------------
// GAE
// ---------------------------------------------------------------------------

/// Generalized Advantage Estimation with masked whitening of the advantages.
pub fn compute_gae_advantage_return(
    token_level_rewards: &Array2<f32>,
    values: &Array2<f32>,
    response_mask: &Array2<f32>,
    gamma: f32,
    lam: f32,
) -> Result<(Array2<f32>, Array2<f32>)> {
    ensure_same_shape("values", token_level_rewards, values)?;
    ensure_same_shape("response_mask", token_level_rewards, response_mask)?;
    let (raw, returns) = gae_unwhitened(token_level_rewards, values, gamma, lam);
    let advantages = masked_whiten(&raw, response_mask, true)?;
    Ok((advantages, returns))
}

/// The GAE recurrence before whitening: `(A, A + V)`.
pub(crate) fn gae_unwhitened(
    rewards: &Array2<f32>,
    values: &Array2<f32>,
    gamma: f32,
    lam: f32,
) -> (Array2<f32>, Array2<f32>) {
    let (rows, width) = rewards.dim();
    let mut advantages = Array2::<f32>::zeros((rows, width));
    let mut last_gae = Array1::<f32>::zeros(rows);
    for t in (0..width).rev() {
        for r in 0..rows {
            let next_value = if t + 1 < width { values[[r, t + 1]] } else { 0.0 };
            let delta = rewards[[r, t]] + gamma * next_value - values[[r, t]];
            last_gae[r] = delta + gamma * lam * last_gae[r];
            advantages[[r, t]] = last_gae[r];
        }
    }
    let returns = &advantages + values;
    (advantages, returns)
}

// ---------------------------------------------------------------------------
// Group-relative outcome estimators
// ---------------------------------------------------------------------------

/// Rows grouped by id, in first-seen order.
///
/// Groups are built from the rows that carry each id, so every group has at
/// least one member.
fn group_rows<K: Eq + Hash + Clone + Debug>(index: &[K]) -> Vec<(K, Vec<usize>)> {
    let mut order: Vec<(K, Vec<usize>)> = Vec::new();
    let mut slot: HashMap<K, usize> = HashMap::new();
    for (row, key) in index.iter().enumerate() {
        match slot.get(key) {
            Some(&s) => order[s].1.push(row),
            None => {
                slot.insert(key.clone(), order.len());
                order.push((key.clone(), vec![row]));
            }
        }
    }
    order
}

/// Population mean and standard deviation of a group's scores.
///
/// Singleton groups report `(0, 1)` so that normalization leaves the score
/// untouched instead of dividing by zero.
fn group_stats(scores: &[f32]) -> (f32, f32) {
    if scores.len() == 1 {
        return (0.0, 1.0);
    }
    let n = scores.len() as f64;
    let mean = scores.iter().map(|&s| f64::from(s)).sum::<f64>() / n;
    let variance = scores
        .iter()
        .map(|&s| (f64::from(s) - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean as f32, variance.sqrt() as f32)
}

fn outcome_scores<K>(
    token_level_rewards: &Array2<f32>,
    response_mask: &Array2<f32>,
    index: &[K],
) -> Result<Array1<f32>> {
    ensure_same_shape("response_mask", token_level_rewards, response_mask)?;
    if index.len() != token_level_rewards.nrows() {
        return Err(RemoraError::ShapeMismatch {
            what: "index",
            expected: vec![token_level_rewards.nrows()],
            actual: vec![index.len()],
        });
    }
    Ok(token_level_rewards.sum_axis(Axis(1)))
}

fn broadcast_scores(scores: &Array1<f32>, response_mask: &Array2<f32>) -> Array2<f32> {
    let column = scores.view().insert_axis(Axis(1));
    &column * response_mask
}

/// Compute group-relative advantages for outcome (scalar-per-row) rewards.
///
/// Returns `(A, G)` with `A == G`: the normalized score broadcast across every
/// live position of the row.
///
/// # Edge cases
///
/// - A singleton group uses mean 0 and std 1.
/// - A group whose scores are all equal has zero advantage under `Std`.
pub fn compute_grpo_outcome_advantage<K: Eq + Hash + Clone + Debug>(
    token_level_rewards: &Array2<f32>,
    response_mask: &Array2<f32>,
    index: &[K],
    norm: GrpoNorm,
    epsilon: f32,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let mut scores = outcome_scores(token_level_rewards, response_mask, index)?;

    for (_, rows) in group_rows(index) {
        let group: Vec<f32> = rows.iter().map(|&r| scores[r]).collect();
        let (mean, std) = group_stats(&group);
        for &r in &rows {
            let centred = scores[r] - mean;
            scores[r] = match norm {
                GrpoNorm::Std => centred / (std + epsilon),
                GrpoNorm::Importance { scale } => centred / (scale / std + epsilon),
                GrpoNorm::MeanOnly => centred,
            };
        }
    }

    let advantages = broadcast_scores(&scores, response_mask);
    Ok((advantages.clone(), advantages))
}

/// Leave-one-out advantages: each row is compared with the mean of the others.
///
/// For a group of size `k > 1` this is `s * k/(k-1) - mean * k/(k-1)`;
/// singleton groups have no baseline and get zero advantage.
pub fn compute_rloo_outcome_advantage<K: Eq + Hash + Clone + Debug>(
    token_level_rewards: &Array2<f32>,
    response_mask: &Array2<f32>,
    index: &[K],
) -> Result<(Array2<f32>, Array2<f32>)> {
    let mut scores = outcome_scores(token_level_rewards, response_mask, index)?;

    for (_, rows) in group_rows(index) {
        let k = rows.len();
        if k == 1 {
            scores[rows[0]] = 0.0;
            continue;
        }
        let group: Vec<f32> = rows.iter().map(|&r| scores[r]).collect();
        let mean = group.iter().sum::<f32>() / k as f32;
        let factor = k as f32 / (k as f32 - 1.0);
        for &r in &rows {
            scores[r] = scores[r] * factor - mean * factor;
        }
    }

    let advantages = broadcast_scores(&scores, response_mask);
    Ok((advantages.clone(), advantages))
}

// ---------------------------------------------------------------------------
// Return-based outcome estimators
// ---------------------------------------------------------------------------

/// REINFORCE++: discounted return that restarts wherever the mask is 0,
/// whitened over the batch and re-masked.
pub fn compute_reinforce_plus_plus_outcome_advantage(
    token_level_rewards: &Array2<f32>,
    response_mask: &Array2<f32>,
    gamma: f32,
) -> Result<(Array2<f32>, Array2<f32>)> {
    ensure_same_shape("response_mask", token_level_rewards, response_mask)?;
    let (rows, width) = token_level_rewards.dim();
    let mut returns = Array2::<f32>::zeros((rows, width));
    let mut running = Array1::<f32>::zeros(rows);
    for t in (0..width).rev() {
        for r in 0..rows {
            running[r] = token_level_rewards[[r, t]] + gamma * running[r];
            returns[[r, t]] = running[r];
            running[r] *= response_mask[[r, t]];
        }
    }
    let advantages = masked_whiten(&returns, response_mask, true)? * response_mask;
    Ok((advantages, returns))
}

/// ReMax: masked reverse cumulative reward minus the greedy-rollout baseline.
pub fn compute_remax_outcome_advantage(
    token_level_rewards: &Array2<f32>,
    reward_baselines: &Array1<f32>,
    response_mask: &Array2<f32>,
) -> Result<(Array2<f32>, Array2<f32>)> {
    ensure_same_shape("response_mask", token_level_rewards, response_mask)?;
    let (rows, width) = token_level_rewards.dim();
    if reward_baselines.len() != rows {
        return Err(RemoraError::ShapeMismatch {
            what: "reward_baselines",
            expected: vec![rows],
            actual: vec![reward_baselines.len()],
        });
    }
    let masked = token_level_rewards * response_mask;
    let mut returns = Array2::<f32>::zeros((rows, width));
    for r in 0..rows {
        let mut acc = 0.0f32;
        for t in (0..width).rev() {
            acc += masked[[r, t]];
            returns[[r, t]] = acc;
        }
    }
    let returns = returns * response_mask;
    let baseline = broadcast_scores(reward_baselines, response_mask);
    let advantages = (&returns - &baseline) * response_mask;
    Ok((advantages, returns))
}
