//! Clipped policy-gradient objectives and the combined actor loss.

use std::str::FromStr;

use ndarray::{Array1, Array2, Array3, Axis, Zip};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ActorConfig;
use crate::error::{RemoraError, Result};

use super::kl::{kl_penalty, KlPenaltyKind};
use super::loss::{agg_loss, LossAggMode, AGG_EPS};
use super::masked::{ensure_same_shape, masked_mean};
use super::value::compute_entropy_loss;

/// Bound on `|logp - old_logp|` in the GSPO KL diagnostic.
const GSPO_KL_CLAMP: f32 = 20.0;

/// Which importance ratio gates the clipped objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyLossKind {
    /// One ratio per token.
    Ppo,
    /// One length-normalized ratio per sequence.
    Gspo,
}

impl FromStr for PolicyLossKind {
    type Err = RemoraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ppo" | "vanilla" => Ok(Self::Ppo),
            "gspo" => Ok(Self::Gspo),
            other => Err(RemoraError::InvalidConfig(format!(
                "unknown policy loss: {other}"
            ))),
        }
    }
}

/// Aggregated policy loss with its diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PolicyLossOutput {
    pub loss: f32,
    /// Fraction of live elements where the clipped branch was larger.
    pub clip_fraction: f32,
    /// Masked mean of `old_logp - logp`.
    pub approx_kl: f32,
}

/// Pessimistic max of the unclipped and clipped surrogate losses, with the
/// masked fraction of elements where the clipped branch won.
fn clipped_surrogate(
    advantages: &Array2<f32>,
    ratio: &Array2<f32>,
    response_mask: &Array2<f32>,
    clip_low: f32,
    clip_high: f32,
) -> (Array2<f32>, f32) {
    let mut clipped_wins = Array2::<f32>::zeros(advantages.dim());
    let losses = Zip::from(advantages)
        .and(ratio)
        .and(&mut clipped_wins)
        .map_collect(|&a, &r, won| {
            let unclipped = -a * r;
            let clipped = -a * r.clamp(1.0 - clip_low, 1.0 + clip_high);
            if clipped > unclipped {
                *won = 1.0;
            }
            unclipped.max(clipped)
        });
    let clip_fraction = masked_mean(&clipped_wins, response_mask);
    (losses, clip_fraction)
}

/// Token-level PPO clipped objective.
#[allow(clippy::too_many_arguments)]
pub fn compute_policy_loss(
    old_log_prob: &Array2<f32>,
    log_prob: &Array2<f32>,
    advantages: &Array2<f32>,
    response_mask: &Array2<f32>,
    clip_low: f32,
    clip_high: f32,
    mode: LossAggMode,
    scale: f32,
) -> Result<PolicyLossOutput> {
    ensure_same_shape("log_prob", old_log_prob, log_prob)?;
    ensure_same_shape("advantages", old_log_prob, advantages)?;
    ensure_same_shape("response_mask", old_log_prob, response_mask)?;

    let log_ratio = log_prob - old_log_prob;
    let ratio = log_ratio.mapv(f32::exp);
    let approx_kl = masked_mean(&log_ratio.mapv(|x| -x), response_mask);

    let (losses, clip_fraction) =
        clipped_surrogate(advantages, &ratio, response_mask, clip_low, clip_high);
    let loss = agg_loss(&losses, response_mask, mode, scale, AGG_EPS)?;
    Ok(PolicyLossOutput {
        loss,
        clip_fraction,
        approx_kl,
    })
}

/// Sequence-level (GSPO) clipped objective.
///
/// Each row gets a single ratio `exp(mean_t logp - mean_t old_logp)` over its
/// live tokens, and that ratio gates the loss of every token in the row.
/// `scale` is applied during aggregation as for PPO, whereas the reference
/// GSPO recipe aggregates with a scale of 1.
#[allow(clippy::too_many_arguments)]
pub fn compute_policy_loss_gspo(
    old_log_prob: &Array2<f32>,
    log_prob: &Array2<f32>,
    advantages: &Array2<f32>,
    response_mask: &Array2<f32>,
    clip_low: f32,
    clip_high: f32,
    mode: LossAggMode,
    scale: f32,
) -> Result<PolicyLossOutput> {
    ensure_same_shape("log_prob", old_log_prob, log_prob)?;
    ensure_same_shape("advantages", old_log_prob, advantages)?;
    ensure_same_shape("response_mask", old_log_prob, response_mask)?;

    let lengths = response_mask.sum_axis(Axis(1)) + AGG_EPS;
    let seq_logp = (log_prob * response_mask).sum_axis(Axis(1)) / &lengths;
    let seq_old_logp = (old_log_prob * response_mask).sum_axis(Axis(1)) / &lengths;
    let seq_ratio: Array1<f32> = (seq_logp - seq_old_logp).mapv(f32::exp);
    let ratio = seq_ratio
        .insert_axis(Axis(1))
        .broadcast(advantages.dim())
        .map(|view| view.to_owned())
        .ok_or_else(|| RemoraError::shape("sequence ratio", advantages.dim(), (0, 0)))?;

    let (losses, clip_fraction) =
        clipped_surrogate(advantages, &ratio, response_mask, clip_low, clip_high);
    let loss = agg_loss(&losses, response_mask, mode, scale, AGG_EPS)?;

    let token_kl = (log_prob - old_log_prob).mapv(|x| -x.clamp(-GSPO_KL_CLAMP, GSPO_KL_CLAMP));
    let approx_kl = masked_mean(&token_kl, response_mask);
    Ok(PolicyLossOutput {
        loss,
        clip_fraction,
        approx_kl,
    })
}

// ---------------------------------------------------------------------------
// Actor objective
// ---------------------------------------------------------------------------

/// Tensors for one actor update micro-batch.
#[derive(Debug, Clone, Copy)]
pub struct ActorInputs<'a> {
    pub old_log_prob: &'a Array2<f32>,
    pub log_prob: &'a Array2<f32>,
    pub advantages: &'a Array2<f32>,
    pub response_mask: &'a Array2<f32>,
    /// Needed when the entropy bonus is enabled.
    pub logits: Option<&'a Array3<f32>>,
    /// Needed when the KL loss is enabled.
    pub ref_log_prob: Option<&'a Array2<f32>>,
    /// Per-row flag for rollouts that ran out of budget.
    pub exceed: Option<&'a [bool]>,
}

/// Combined actor loss and its parts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActorLossOutput {
    /// `policy - entropy_coeff * entropy + kl_loss_coef * kl_loss`.
    pub total: f32,
    pub policy: PolicyLossOutput,
    pub entropy: Option<f32>,
    pub kl_loss: Option<f32>,
}

/// The actor's objective with every named policy resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActorObjective {
    pub kind: PolicyLossKind,
    pub clip_low: f32,
    pub clip_high: f32,
    pub agg_mode: LossAggMode,
    pub loss_scale: f32,
    pub entropy_coeff: f32,
    /// Penalty kind and coefficient of the KL-to-reference loss term.
    pub kl_loss: Option<(KlPenaltyKind, f32)>,
    /// Drop rows flagged `exceed` from every loss term.
    pub ignore_exceed: bool,
}

impl ActorObjective {
    pub fn from_config(config: &ActorConfig) -> Result<Self> {
        let (clip_low, clip_high) = config.clip_bounds();
        let kl_loss = if config.use_kl_loss {
            Some((config.kl_loss_type.parse()?, config.kl_loss_coef))
        } else {
            None
        };
        Ok(Self {
            kind: config.policy_loss.parse()?,
            clip_low,
            clip_high,
            agg_mode: config.loss_agg_mode.parse()?,
            loss_scale: config.loss_scale,
            entropy_coeff: config.entropy_coeff,
            kl_loss,
            ignore_exceed: config.ignore_exceed,
        })
    }

    pub fn evaluate(&self, inputs: &ActorInputs<'_>) -> Result<ActorLossOutput> {
        let mask = self.effective_mask(inputs)?;
        let policy_fn = match self.kind {
            PolicyLossKind::Ppo => compute_policy_loss,
            PolicyLossKind::Gspo => compute_policy_loss_gspo,
        };
        let policy = policy_fn(
            inputs.old_log_prob,
            inputs.log_prob,
            inputs.advantages,
            &mask,
            self.clip_low,
            self.clip_high,
            self.agg_mode,
            self.loss_scale,
        )?;
        let mut total = policy.loss;

        let entropy = if self.entropy_coeff != 0.0 {
            let logits = inputs.logits.ok_or_else(|| {
                RemoraError::InvalidConfig("entropy bonus requires logits".into())
            })?;
            let entropy = compute_entropy_loss(logits, &mask)?;
            total -= self.entropy_coeff * entropy;
            Some(entropy)
        } else {
            None
        };

        let kl_loss = match self.kl_loss {
            Some((kind, coef)) => {
                let ref_log_prob = inputs.ref_log_prob.ok_or_else(|| {
                    RemoraError::InvalidConfig("KL loss requires reference log-probs".into())
                })?;
                let kld = kl_penalty(inputs.log_prob, ref_log_prob, kind)?;
                let value = agg_loss(&kld, &mask, self.agg_mode, self.loss_scale, AGG_EPS)?;
                total += coef * value;
                Some(value)
            }
            None => None,
        };

        debug!(
            policy_loss = policy.loss,
            clip_fraction = policy.clip_fraction,
            approx_kl = policy.approx_kl,
            total,
            "actor loss"
        );
        Ok(ActorLossOutput {
            total,
            policy,
            entropy,
            kl_loss,
        })
    }

    fn effective_mask(&self, inputs: &ActorInputs<'_>) -> Result<Array2<f32>> {
        let mut mask = inputs.response_mask.clone();
        if !self.ignore_exceed {
            return Ok(mask);
        }
        let Some(exceed) = inputs.exceed else {
            return Ok(mask);
        };
        if exceed.len() != mask.nrows() {
            return Err(RemoraError::ShapeMismatch {
                what: "exceed",
                expected: vec![mask.nrows()],
                actual: vec![exceed.len()],
            });
        }
        for (mut row, &flag) in mask.axis_iter_mut(Axis(0)).zip(exceed) {
            if flag {
                row.fill(0.0);
            }
        }
        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn fixture() -> (Array2<f32>, Array2<f32>, Array2<f32>, Array2<f32>) {
        let old = array![[-1.0, -0.5, -2.0], [-0.3, -1.2, -0.8]];
        let new = array![[-0.6, -0.9, -1.5], [-0.4, -0.7, -1.4]];
        let adv = array![[1.0, -1.0, 0.5], [-0.5, 2.0, 1.0]];
        let mask = Array2::ones((2, 3));
        (old, new, adv, mask)
    }

    #[test]
    fn test_parse_policy_kind() {
        assert_eq!("ppo".parse::<PolicyLossKind>().unwrap(), PolicyLossKind::Ppo);
        assert_eq!("gspo".parse::<PolicyLossKind>().unwrap(), PolicyLossKind::Gspo);
        assert!("dpo".parse::<PolicyLossKind>().is_err());
    }

    #[test]
    fn test_identical_policies_have_no_clipping() {
        let (old, _, adv, mask) = fixture();
        let out = compute_policy_loss(&old, &old, &adv, &mask, 0.2, 0.2, LossAggMode::TokenMean, 1.0)
            .unwrap();
        assert_eq!(out.clip_fraction, 0.0);
        assert!(out.approx_kl.abs() < 1e-7);
        // ratio 1 everywhere: loss is -mean(A).
        assert!((out.loss + adv.mean().unwrap()).abs() < 1e-6);
    }

    #[test]
    fn test_clip_fraction_grows_as_range_shrinks() {
        let (old, new, adv, mask) = fixture();
        let mut previous = -1.0f32;
        for clip in [1.0, 0.5, 0.3, 0.2, 0.1, 0.05, 0.0] {
            let out =
                compute_policy_loss(&old, &new, &adv, &mask, clip, clip, LossAggMode::TokenMean, 1.0)
                    .unwrap();
            assert!(
                out.clip_fraction >= previous,
                "clip fraction fell at clip={clip}: {} < {previous}",
                out.clip_fraction
            );
            previous = out.clip_fraction;
        }
        assert!(previous > 0.0);
    }

    #[test]
    fn test_pessimistic_bound() {
        // ratio = e^1 with positive advantage: clipped branch -A*1.2 is larger.
        let old = array![[0.0]];
        let new = array![[1.0]];
        let adv = array![[1.0]];
        let mask = array![[1.0]];
        let out = compute_policy_loss(&old, &new, &adv, &mask, 0.2, 0.2, LossAggMode::TokenMean, 1.0)
            .unwrap();
        assert!((out.loss + 1.2).abs() < 1e-6);
        assert_eq!(out.clip_fraction, 1.0);
        assert!((out.approx_kl + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_gspo_uses_one_ratio_per_row() {
        // Row mean log-ratio is 0, so every token sees ratio 1 even though
        // individual tokens moved.
        let old = array![[0.0, 0.0]];
        let new = array![[0.5, -0.5]];
        let adv = array![[1.0, 1.0]];
        let mask = array![[1.0, 1.0]];
        let out = compute_policy_loss_gspo(
            &old,
            &new,
            &adv,
            &mask,
            0.2,
            0.2,
            LossAggMode::TokenMean,
            1.0,
        )
        .unwrap();
        assert!((out.loss + 1.0).abs() < 1e-5);
        assert_eq!(out.clip_fraction, 0.0);

        let token = compute_policy_loss(&old, &new, &adv, &mask, 0.2, 0.2, LossAggMode::TokenMean, 1.0)
            .unwrap();
        assert!(token.clip_fraction > 0.0);
    }

    #[test]
    fn test_gspo_kl_diagnostic_is_clamped() {
        let old = array![[0.0]];
        let new = array![[-100.0]];
        let adv = array![[0.0]];
        let mask = array![[1.0]];
        let out = compute_policy_loss_gspo(
            &old,
            &new,
            &adv,
            &mask,
            0.2,
            0.2,
            LossAggMode::TokenMean,
            1.0,
        )
        .unwrap();
        assert!((out.approx_kl - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_actor_objective_combines_terms() {
        let (old, new, adv, mask) = fixture();
        let logits = Array3::<f32>::zeros((2, 3, 4));
        let objective = ActorObjective {
            kind: PolicyLossKind::Ppo,
            clip_low: 0.2,
            clip_high: 0.2,
            agg_mode: LossAggMode::TokenMean,
            loss_scale: 1.0,
            entropy_coeff: 0.1,
            kl_loss: Some((KlPenaltyKind::Kl, 0.5)),
            ignore_exceed: false,
        };
        let out = objective
            .evaluate(&ActorInputs {
                old_log_prob: &old,
                log_prob: &new,
                advantages: &adv,
                response_mask: &mask,
                logits: Some(&logits),
                ref_log_prob: Some(&old),
                exceed: None,
            })
            .unwrap();
        let entropy = out.entropy.unwrap();
        let kl = out.kl_loss.unwrap();
        assert!((entropy - 4.0f32.ln()).abs() < 1e-5);
        assert!((out.total - (out.policy.loss - 0.1 * entropy + 0.5 * kl)).abs() < 1e-6);
    }

    #[test]
    fn test_actor_objective_ignores_exceeded_rows() {
        let (old, new, adv, mask) = fixture();
        let config = ActorConfig {
            ignore_exceed: true,
            ..ActorConfig::default()
        };
        let objective = ActorObjective::from_config(&config).unwrap();
        let exceed = [false, true];
        let out = objective
            .evaluate(&ActorInputs {
                old_log_prob: &old,
                log_prob: &new,
                advantages: &adv,
                response_mask: &mask,
                logits: None,
                ref_log_prob: None,
                exceed: Some(&exceed),
            })
            .unwrap();

        let first_row_only = array![[1.0, 1.0, 1.0], [0.0, 0.0, 0.0]];
        let expected = compute_policy_loss(
            &old,
            &new,
            &adv,
            &first_row_only,
            0.2,
            0.2,
            LossAggMode::TokenMean,
            1.0,
        )
        .unwrap();
        assert!((out.total - expected.loss).abs() < 1e-6);
    }

    #[test]
    fn test_entropy_bonus_requires_logits() {
        let (old, new, adv, mask) = fixture();
        let config = ActorConfig {
            entropy_coeff: 0.01,
            ..ActorConfig::default()
        };
        let objective = ActorObjective::from_config(&config).unwrap();
        let result = objective.evaluate(&ActorInputs {
            old_log_prob: &old,
            log_prob: &new,
            advantages: &adv,
            response_mask: &mask,
            logits: None,
            ref_log_prob: None,
            exceed: None,
        });
        assert!(matches!(result, Err(RemoraError::InvalidConfig(_))));
    }
}
