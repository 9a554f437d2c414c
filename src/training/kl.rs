//! KL penalties against a reference policy and the controllers that scale them.
//!
//! The adaptive controller follows Ziegler et al. (2019): the coefficient is
//! nudged proportionally toward a target KL, with the error clipped to ±0.2.
//! `low_var_kl` is the k3 estimator from Schulman's "Approximating KL
//! divergence" note.

use std::str::FromStr;

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::KlControlConfig;
use crate::error::{RemoraError, Result};

use super::masked::{ensure_same_shape, masked_mean_rows};

// ---------------------------------------------------------------------------
// Controllers
// ---------------------------------------------------------------------------

/// Scalar KL coefficient, mutated once per training step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KlController {
    /// Constant coefficient.
    Fixed { value: f32 },
    /// Proportional controller toward `target`.
    Adaptive {
        value: f32,
        target: f32,
        horizon: f32,
    },
}

impl KlController {
    /// A controller whose coefficient never changes.
    pub fn fixed(kl_coef: f32) -> Self {
        Self::Fixed { value: kl_coef }
    }

    /// An adaptive controller. Fails if `horizon` or `target` is not positive.
    pub fn adaptive(init_kl_coef: f32, target: f32, horizon: f32) -> Result<Self> {
        if horizon <= 0.0 {
            return Err(RemoraError::InvalidConfig(format!(
                "horizon must be larger than 0, got {horizon}"
            )));
        }
        if target <= 0.0 {
            return Err(RemoraError::InvalidConfig(format!(
                "target_kl must be larger than 0, got {target}"
            )));
        }
        Ok(Self::Adaptive {
            value: init_kl_coef,
            target,
            horizon,
        })
    }

    /// Build the controller named by `config.kind`.
    pub fn from_config(config: &KlControlConfig) -> Result<Self> {
        match config.kind.as_str() {
            "fixed" => Ok(Self::fixed(config.kl_coef)),
            "adaptive" => Self::adaptive(config.kl_coef, config.target_kl, config.horizon),
            other => Err(RemoraError::InvalidConfig(format!(
                "unknown kl_ctrl type: {other}"
            ))),
        }
    }

    /// Current coefficient.
    pub fn value(&self) -> f32 {
        match self {
            Self::Fixed { value } | Self::Adaptive { value, .. } => *value,
        }
    }

    /// Feed the KL measured over `n_steps` samples.
    pub fn update(&mut self, current_kl: f32, n_steps: usize) {
        if let Self::Adaptive {
            value,
            target,
            horizon,
        } = self
        {
            let proportional_error = (current_kl / *target - 1.0).clamp(-0.2, 0.2);
            let mult = 1.0 + proportional_error * n_steps as f32 / *horizon;
            *value *= mult;
            debug!(current_kl, proportional_error, kl_coef = *value, "adaptive KL coefficient updated");
        }
    }
}

// ---------------------------------------------------------------------------
// Penalties
// ---------------------------------------------------------------------------

/// How the per-token divergence from the reference policy is estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KlPenaltyKind {
    /// `logp - ref`.
    Kl,
    /// `|logp - ref|`.
    Abs,
    /// `0.5 * (logp - ref)^2`.
    Mse,
    /// `exp(ref - logp) - (ref - logp) - 1`, clamped to `[-10, 10]`.
    LowVarKl,
}

impl FromStr for KlPenaltyKind {
    type Err = RemoraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kl" => Ok(Self::Kl),
            "abs" => Ok(Self::Abs),
            "mse" => Ok(Self::Mse),
            "low_var_kl" => Ok(Self::LowVarKl),
            "full" => Err(RemoraError::NotSupported(
                "full-vocabulary KL penalty needs logits for every token".into(),
            )),
            other => Err(RemoraError::NotSupported(format!(
                "unknown KL penalty: {other}"
            ))),
        }
    }
}

/// Per-token KL penalty between the policy and the reference log-probs.
pub fn kl_penalty(
    logprob: &Array2<f32>,
    ref_logprob: &Array2<f32>,
    kind: KlPenaltyKind,
) -> Result<Array2<f32>> {
    ensure_same_shape("ref_logprob", logprob, ref_logprob)?;
    let out = Zip::from(logprob)
        .and(ref_logprob)
        .map_collect(|&lp, &rp| match kind {
            KlPenaltyKind::Kl => lp - rp,
            KlPenaltyKind::Abs => (lp - rp).abs(),
            KlPenaltyKind::Mse => 0.5 * (lp - rp) * (lp - rp),
            KlPenaltyKind::LowVarKl => {
                let kl = rp - lp;
                let kld = kl.exp() - kl - 1.0;
                // exp overflow yields inf, and inf - inf yields NaN; both clamp high.
                if kld.is_nan() {
                    10.0
                } else {
                    kld.clamp(-10.0, 10.0)
                }
            }
        });
    Ok(out)
}

/// Token rewards with the `old - ref` divergence subtracted at rate `kl_ratio`.
pub fn compute_rewards(
    token_level_scores: &Array2<f32>,
    old_log_prob: &Array2<f32>,
    ref_log_prob: &Array2<f32>,
    kl_ratio: f32,
) -> Result<Array2<f32>> {
    ensure_same_shape("old_log_prob", token_level_scores, old_log_prob)?;
    ensure_same_shape("ref_log_prob", token_level_scores, ref_log_prob)?;
    Ok(Zip::from(token_level_scores)
        .and(old_log_prob)
        .and(ref_log_prob)
        .map_collect(|&s, &o, &r| s - (o - r) * kl_ratio))
}

/// Result of shaping token rewards with the controller's KL coefficient.
#[derive(Debug, Clone)]
pub struct KlShaping {
    /// `scores - beta * masked_kl`.
    pub token_level_rewards: Array2<f32>,
    /// Batch mean of the per-row masked KL.
    pub current_kl: f32,
    /// Coefficient that was applied (before the controller update).
    pub kl_coef: f32,
}

/// Subtract the KL penalty from token scores and update the controller.
///
/// The controller sees the batch-mean KL with `n_steps` equal to the number of
/// rows.
pub fn apply_kl_penalty(
    token_level_scores: &Array2<f32>,
    old_log_prob: &Array2<f32>,
    ref_log_prob: &Array2<f32>,
    response_mask: &Array2<f32>,
    controller: &mut KlController,
    kind: KlPenaltyKind,
) -> Result<KlShaping> {
    ensure_same_shape("response_mask", token_level_scores, response_mask)?;
    let kld = kl_penalty(old_log_prob, ref_log_prob, kind)? * response_mask;
    let beta = controller.value();
    let token_level_rewards = token_level_scores - &kld.mapv(|k| k * beta);

    let per_row = masked_mean_rows(&kld, response_mask);
    let current_kl = per_row.mean().unwrap_or(0.0);
    controller.update(current_kl, token_level_scores.nrows());

    Ok(KlShaping {
        token_level_rewards,
        current_kl,
        kl_coef: beta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn adaptive_config(horizon: f32) -> KlControlConfig {
        KlControlConfig {
            kind: "adaptive".into(),
            kl_coef: 0.1,
            target_kl: 0.5,
            horizon,
        }
    }

    // ------------------------------------------------------------------
    // Controllers
    // ------------------------------------------------------------------

    #[test]
    fn test_fixed_controller_never_moves() {
        let mut ctrl = KlController::fixed(0.05);
        ctrl.update(100.0, 64);
        assert_eq!(ctrl.value(), 0.05);
    }

    #[test]
    fn test_adaptive_controller_grows_when_kl_high() {
        let mut ctrl = KlController::from_config(&adaptive_config(100.0)).unwrap();
        // KL far above target: error clipped to +0.2, mult = 1 + 0.2 * 10 / 100.
        ctrl.update(10.0, 10);
        assert!((ctrl.value() - 0.1 * 1.02).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_controller_shrinks_when_kl_low() {
        let mut ctrl = KlController::from_config(&adaptive_config(100.0)).unwrap();
        // current/target - 1 = 0.45/0.5 - 1 = -0.1 (inside the clip window).
        ctrl.update(0.45, 10);
        assert!((ctrl.value() - 0.1 * (1.0 - 0.1 * 10.0 / 100.0)).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_controller_rejects_bad_horizon() {
        assert!(matches!(
            KlController::from_config(&adaptive_config(0.0)),
            Err(RemoraError::InvalidConfig(_))
        ));
        assert!(KlController::from_config(&adaptive_config(-5.0)).is_err());
    }

    #[test]
    fn test_unknown_controller_rejected() {
        let config = KlControlConfig {
            kind: "pid".into(),
            ..KlControlConfig::default()
        };
        assert!(matches!(
            KlController::from_config(&config),
            Err(RemoraError::InvalidConfig(_))
        ));
    }

    // ------------------------------------------------------------------
    // Penalties
    // ------------------------------------------------------------------

    #[test]
    fn test_penalty_kinds() {
        let lp = array![[-1.0, -2.0]];
        let rp = array![[-2.0, -1.0]];
        assert_eq!(kl_penalty(&lp, &rp, KlPenaltyKind::Kl).unwrap(), array![[1.0, -1.0]]);
        assert_eq!(kl_penalty(&lp, &rp, KlPenaltyKind::Abs).unwrap(), array![[1.0, 1.0]]);
        assert_eq!(kl_penalty(&lp, &rp, KlPenaltyKind::Mse).unwrap(), array![[0.5, 0.5]]);

        let low = kl_penalty(&lp, &rp, KlPenaltyKind::LowVarKl).unwrap();
        // kl = ref - logp = -1 -> exp(-1) + 1 - 1
        assert!((low[[0, 0]] - (-1.0f32).exp()).abs() < 1e-6);
        // kl = 1 -> e - 2
        assert!((low[[0, 1]] - (1.0f32.exp() - 2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_low_var_kl_is_clamped() {
        let lp = array![[-500.0, 0.0, 0.0, -1.0e30]];
        let rp = array![[0.0, -500.0, 0.0, 1.0e30]];
        let out = kl_penalty(&lp, &rp, KlPenaltyKind::LowVarKl).unwrap();
        for v in out.iter() {
            assert!((-10.0..=10.0).contains(v), "value {v} escaped the clamp");
        }
        assert_eq!(out[[0, 0]], 10.0);
        assert_eq!(out[[0, 2]], 0.0);
    }

    #[test]
    fn test_full_and_unknown_penalties_not_supported() {
        assert!(matches!(
            "full".parse::<KlPenaltyKind>(),
            Err(RemoraError::NotSupported(_))
        ));
        assert!(matches!(
            "js".parse::<KlPenaltyKind>(),
            Err(RemoraError::NotSupported(_))
        ));
    }

    #[test]
    fn test_compute_rewards() {
        let scores = array![[0.0, 1.0]];
        let old = array![[-1.0, -1.0]];
        let reference = array![[-1.5, -0.5]];
        let rewards = compute_rewards(&scores, &old, &reference, 0.1).unwrap();
        assert!((rewards[[0, 0]] - (-0.05)).abs() < 1e-6);
        assert!((rewards[[0, 1]] - 1.05).abs() < 1e-6);
    }

    #[test]
    fn test_apply_kl_penalty_masks_and_updates() {
        let scores = array![[0.0, 0.0, 1.0], [0.0, 2.0, 0.0]];
        let old = array![[-1.0, -1.0, -1.0], [-1.0, -1.0, -1.0]];
        let reference = array![[-2.0, -2.0, -2.0], [-2.0, -2.0, -2.0]];
        let mask = array![[1.0, 1.0, 1.0], [1.0, 1.0, 0.0]];
        let mut ctrl = KlController::fixed(0.5);

        let shaped =
            apply_kl_penalty(&scores, &old, &reference, &mask, &mut ctrl, KlPenaltyKind::Kl)
                .unwrap();

        assert!((shaped.current_kl - 1.0).abs() < 1e-6);
        assert_eq!(shaped.kl_coef, 0.5);
        assert!((shaped.token_level_rewards[[0, 2]] - 0.5).abs() < 1e-6);
        // Masked position keeps its raw score.
        assert!((shaped.token_level_rewards[[1, 2]] - 0.0).abs() < 1e-6);
        assert!((shaped.token_level_rewards[[1, 1]] - 1.5).abs() < 1e-6);
    }
}
