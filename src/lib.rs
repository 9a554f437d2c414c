//! Remora: policy optimization with multi-turn, tool-augmented rollouts.
//!
//! Two halves share one configuration:
//!
//! - [`training`]: advantage estimators, KL control, loss aggregation and the
//!   policy, value and entropy objectives over masked `ndarray` tensors.
//! - [`rollout`]: an async state machine that drives each prompt sample through
//!   generation and tool-call rounds, then reassembles a rectangular batch.

pub mod config;
pub mod error;
pub mod rollout;
pub mod training;

pub use error::{RemoraError, Result};
