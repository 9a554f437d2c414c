//! Optimization core.
//!
//! Advantage estimators, KL control, loss aggregation and the policy, value and
//! entropy objectives. Everything here is a pure function of `ndarray` tensors
//! shaped `rows x T` plus a 0/1 response mask.

pub mod advantage;
pub mod kl;
pub mod loss;
pub mod masked;
pub mod policy;
pub mod value;

pub use advantage::{
    compute_gae_advantage_return, compute_grpo_outcome_advantage,
    compute_reinforce_plus_plus_outcome_advantage, compute_remax_outcome_advantage,
    compute_rloo_outcome_advantage, AdvantageEstimator, AdvantageInputs, AdvantageOutput,
    EstimatorKind, GrpoNorm,
};
pub use kl::{apply_kl_penalty, compute_rewards, kl_penalty, KlController, KlPenaltyKind, KlShaping};
pub use loss::{agg_loss, LossAggMode};
pub use policy::{
    compute_policy_loss, compute_policy_loss_gspo, ActorInputs, ActorLossOutput, ActorObjective,
    PolicyLossKind, PolicyLossOutput,
};
pub use value::{compute_entropy_loss, compute_value_loss};
