use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RemoraError, Result};
use crate::rollout::prompt::ChatTemplate;
use crate::training::advantage::AdvantageEstimator;
use crate::training::kl::{KlController, KlPenaltyKind};
use crate::training::loss::LossAggMode;
use crate::training::policy::PolicyLossKind;

/// Complete configuration consumed by the optimization core and the rollout engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub algorithm: AlgorithmConfig,
    pub actor: ActorConfig,
    pub critic: CriticConfig,
    pub rollout: RolloutConfig,
}

/// Advantage estimation and reward shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    /// Estimator name: `gae`, `grpo`, `rloo`, `reinforce_plus_plus` or `remax` (default: `grpo`).
    pub adv_estimator: String,
    /// Discount factor (default: 1.0).
    pub gamma: f32,
    /// GAE trace decay (default: 1.0).
    pub lam: f32,
    /// Divide GRPO scores by the group standard deviation (default: true).
    pub norm_adv_by_std_in_grpo: bool,
    /// Importance-scaled GRPO normalization used when the std branch is off.
    /// Only `v1` is recognised; `None` selects mean-only centring (default: `v1`).
    pub norm_by_importance: Option<String>,
    /// Numerator of the importance-scaled denominator (default: 0.25).
    pub importance_scale: f32,
    /// Epsilon added to group-normalization denominators (default: 1e-6).
    pub grpo_epsilon: f32,
    /// Subtract a KL penalty from token rewards before estimation (default: false).
    pub use_kl_in_reward: bool,
    /// KL penalty kind used for reward shaping (default: `kl`).
    pub kl_penalty: String,
    /// KL coefficient controller.
    pub kl_ctrl: KlControlConfig,
}

/// KL coefficient controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KlControlConfig {
    /// `fixed` or `adaptive` (default: `fixed`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Initial coefficient (default: 0.001).
    pub kl_coef: f32,
    /// Target KL for the adaptive controller (default: 0.1).
    pub target_kl: f32,
    /// Horizon of the adaptive controller; must be positive (default: 10000).
    pub horizon: f32,
}

/// Policy (actor) objective configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// `ppo` (token-level ratio) or `gspo` (sequence-level ratio) (default: `ppo`).
    pub policy_loss: String,
    /// Symmetric clip range (default: 0.2).
    pub clip_ratio: f32,
    /// Lower clip range; falls back to `clip_ratio`.
    pub clip_ratio_low: Option<f32>,
    /// Upper clip range; falls back to `clip_ratio`.
    pub clip_ratio_high: Option<f32>,
    /// Loss aggregation mode (default: `token-mean`).
    pub loss_agg_mode: String,
    /// Multiplier for `seq-mean-token-sum-norm-scaled` (default: 1.0).
    pub loss_scale: f32,
    /// Entropy bonus coefficient (default: 0.0).
    pub entropy_coeff: f32,
    /// Add a KL term against the reference policy to the actor loss (default: false).
    pub use_kl_loss: bool,
    /// KL penalty kind for the actor KL loss (default: `low_var_kl`).
    pub kl_loss_type: String,
    /// Coefficient of the actor KL loss (default: 0.001).
    pub kl_loss_coef: f32,
    /// Drop rows that ended in the exceeded state from the loss mask (default: false).
    pub ignore_exceed: bool,
}

/// Value (critic) objective configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticConfig {
    /// Half-width of the value clipping window (default: 0.5).
    pub cliprange_value: f32,
}

/// Multi-turn rollout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Samples per prompt during training (default: 8).
    pub n: usize,
    /// Samples per prompt during validation (default: 1).
    pub val_n: usize,
    /// Maximum generation rounds per request during training (default: 6).
    pub max_generation_round: usize,
    /// Maximum generation rounds during validation; `1` reuses the training limit (default: 6).
    pub val_max_generation_round: usize,
    /// Left-padded prompt width (default: 2048).
    pub prompt_length: usize,
    /// Per-turn generation cap passed to the engine as `max_tokens` (default: 2048).
    pub response_length: usize,
    /// Width of the response block in the assembled batch (default: 16384).
    pub max_total_response_length: usize,
    /// Tokens reserved below `max_total_response_length` before a tool call is refused (default: 2000).
    pub context_safety_margin: usize,
    /// Maximum images per trajectory during training, initial image included (default: 6).
    pub limit_images: usize,
    /// Maximum images per trajectory during validation (default: 6).
    pub val_limit_images: usize,
    /// Upper pixel budget for observation images (default: 2048 * 2048).
    pub max_pixels: usize,
    /// Lower pixel budget for observation images (default: 512 * 512).
    pub min_pixels: usize,
    /// Interpret tool bounding boxes as fractions of the image (default: false).
    pub use_relative_coordinates: bool,
    /// Stop sequences passed to the engine (default: `["</grounding>"]`).
    pub stop: Vec<String>,
    /// Sampling temperature (default: 1.0).
    pub temperature: f32,
    /// Nucleus sampling threshold (default: 1.0).
    pub top_p: f32,
    /// Top-k cutoff, `-1` disables (default: -1).
    pub top_k: i32,
    /// Concurrent blocking jobs (request forks, tool calls) (default: 8).
    pub blocking_workers: usize,
    /// Regex locating a tool invocation in decoded text; group 1 is the payload.
    pub tool_call_pattern: String,
    /// Regex that a terminal (non-tool) turn must match to count as answered.
    pub final_answer_pattern: String,
    /// Model-specific token ids.
    pub tokens: SpecialTokens,
    /// Chat-template fragments used to splice observation turns.
    pub template: ChatTemplate,
}

/// Token ids the rollout engine needs to know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialTokens {
    /// Padding id (default: 151643).
    pub pad_token_id: u32,
    /// End-of-turn id used for the final attention mask (default: 151645).
    pub eos_token_id: u32,
    /// Placeholder id that stands for one image in the token stream (default: 151655).
    pub image_pad_token_id: u32,
    /// Generated ids above this value are discarded (default: 151664).
    pub max_valid_token_id: Option<u32>,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            adv_estimator: "grpo".into(),
            gamma: 1.0,
            lam: 1.0,
            norm_adv_by_std_in_grpo: true,
            norm_by_importance: Some("v1".into()),
            importance_scale: 0.25,
            grpo_epsilon: 1e-6,
            use_kl_in_reward: false,
            kl_penalty: "kl".into(),
            kl_ctrl: KlControlConfig::default(),
        }
    }
}

impl Default for KlControlConfig {
    fn default() -> Self {
        Self {
            kind: "fixed".into(),
            kl_coef: 0.001,
            target_kl: 0.1,
            horizon: 10_000.0,
        }
    }
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            policy_loss: "ppo".into(),
            clip_ratio: 0.2,
            clip_ratio_low: None,
            clip_ratio_high: None,
            loss_agg_mode: "token-mean".into(),
            loss_scale: 1.0,
            entropy_coeff: 0.0,
            use_kl_loss: false,
            kl_loss_type: "low_var_kl".into(),
            kl_loss_coef: 0.001,
            ignore_exceed: false,
        }
    }
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            cliprange_value: 0.5,
        }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            n: 8,
            val_n: 1,
            max_generation_round: 6,
            val_max_generation_round: 6,
            prompt_length: 2048,
            response_length: 2048,
            max_total_response_length: 16_384,
            context_safety_margin: 2000,
            limit_images: 6,
            val_limit_images: 6,
            max_pixels: 2048 * 2048,
            min_pixels: 512 * 512,
            use_relative_coordinates: false,
            stop: vec!["</grounding>".into()],
            temperature: 1.0,
            top_p: 1.0,
            top_k: -1,
            blocking_workers: 8,
            tool_call_pattern: r"(?s)<grounding>(.*?)</grounding>".into(),
            final_answer_pattern: r"(?s)<answer>.*</answer>\n?$".into(),
            tokens: SpecialTokens::default(),
            template: ChatTemplate::default(),
        }
    }
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            pad_token_id: 151_643,
            eos_token_id: 151_645,
            image_pad_token_id: 151_655,
            max_valid_token_id: Some(151_664),
        }
    }
}

impl ActorConfig {
    /// Effective `(low, high)` clip bounds.
    pub fn clip_bounds(&self) -> (f32, f32) {
        (
            self.clip_ratio_low.unwrap_or(self.clip_ratio),
            self.clip_ratio_high.unwrap_or(self.clip_ratio),
        )
    }
}

impl RolloutConfig {
    /// Samples per prompt for the given mode.
    pub fn samples_per_prompt(&self, is_validate: bool) -> usize {
        if is_validate {
            self.val_n
        } else {
            self.n
        }
    }

    /// `(max_rounds, max_images)` for the given mode.
    pub fn round_limits(&self, is_validate: bool) -> (usize, usize) {
        if is_validate && self.val_max_generation_round != 1 {
            (self.val_max_generation_round, self.val_limit_images)
        } else {
            (self.max_generation_round, self.limit_images)
        }
    }

    /// Context length at which tool calls stop being accepted.
    pub fn context_budget(&self) -> usize {
        self.max_total_response_length
            .saturating_sub(self.context_safety_margin)
    }
}

impl TrainerConfig {
    /// Resolve every named policy and pattern so that bad settings fail at startup.
    pub fn validate(&self) -> Result<()> {
        AdvantageEstimator::from_config(&self.algorithm)?;
        KlController::from_config(&self.algorithm.kl_ctrl)?;
        self.algorithm.kl_penalty.parse::<KlPenaltyKind>()?;
        self.actor.loss_agg_mode.parse::<LossAggMode>()?;
        self.actor.policy_loss.parse::<PolicyLossKind>()?;
        if self.actor.use_kl_loss {
            self.actor.kl_loss_type.parse::<KlPenaltyKind>()?;
        }

        let (low, high) = self.actor.clip_bounds();
        if low < 0.0 || high < 0.0 {
            return Err(RemoraError::InvalidConfig(format!(
                "clip ranges must be non-negative, got low={low} high={high}"
            )));
        }
        if self.critic.cliprange_value < 0.0 {
            return Err(RemoraError::InvalidConfig(format!(
                "cliprange_value must be non-negative, got {}",
                self.critic.cliprange_value
            )));
        }

        let rollout = &self.rollout;
        if rollout.n == 0 || rollout.val_n == 0 {
            return Err(RemoraError::InvalidConfig(
                "samples per prompt must be at least 1".into(),
            ));
        }
        if rollout.max_generation_round == 0 || rollout.val_max_generation_round == 0 {
            return Err(RemoraError::InvalidConfig(
                "generation round limits must be at least 1".into(),
            ));
        }
        if rollout.blocking_workers == 0 {
            return Err(RemoraError::InvalidConfig(
                "blocking_workers must be at least 1".into(),
            ));
        }
        if rollout.min_pixels > rollout.max_pixels {
            return Err(RemoraError::InvalidConfig(format!(
                "min_pixels ({}) exceeds max_pixels ({})",
                rollout.min_pixels, rollout.max_pixels
            )));
        }
        Regex::new(&rollout.tool_call_pattern)?;
        Regex::new(&rollout.final_answer_pattern)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        TrainerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_unknown_estimator_rejected() {
        let mut config = TrainerConfig::default();
        config.algorithm.adv_estimator = "vtrace".into();
        assert!(matches!(
            config.validate(),
            Err(RemoraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_adaptive_controller_needs_positive_horizon() {
        let mut config = TrainerConfig::default();
        config.algorithm.kl_ctrl.kind = "adaptive".into();
        config.algorithm.kl_ctrl.horizon = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let mut config = TrainerConfig::default();
        config.rollout.tool_call_pattern = "(unclosed".into();
        assert!(matches!(config.validate(), Err(RemoraError::Pattern(_))));
    }

    #[test]
    fn test_clip_bounds_fall_back_to_symmetric() {
        let mut actor = ActorConfig::default();
        assert_eq!(actor.clip_bounds(), (0.2, 0.2));
        actor.clip_ratio_high = Some(0.28);
        assert_eq!(actor.clip_bounds(), (0.2, 0.28));
    }

    #[test]
    fn test_round_limits_by_mode() {
        let mut rollout = RolloutConfig {
            max_generation_round: 4,
            val_max_generation_round: 3,
            limit_images: 5,
            val_limit_images: 2,
            ..RolloutConfig::default()
        };
        assert_eq!(rollout.round_limits(false), (4, 5));
        assert_eq!(rollout.round_limits(true), (3, 2));

        // A validation limit of one round falls back to the training limits.
        rollout.val_max_generation_round = 1;
        assert_eq!(rollout.round_limits(true), (4, 5));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"algorithm": {"adv_estimator": "rloo"}, "rollout": {"n": 4}}"#;
        let config: TrainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.algorithm.adv_estimator, "rloo");
        assert_eq!(config.rollout.n, 4);
        assert_eq!(config.rollout.context_safety_margin, 2000);
        assert_eq!(config.algorithm.kl_ctrl.kind, "fixed");
    }
}
