//! Reduction of a token-level loss matrix to a scalar.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{RemoraError, Result};

use super::masked::{ensure_same_shape, masked_mean};

/// Denominator guard for `seq-mean-token-mean` (default: 1e-6).
pub const AGG_EPS: f32 = 1e-6;

/// How a `rows x T` loss matrix is reduced under a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossAggMode {
    /// Mean over every live element of the batch.
    TokenMean,
    /// Masked sum per row, then mean over rows.
    SeqMeanTokenSum,
    /// Masked mean per row, then mean over rows.
    SeqMeanTokenMean,
    /// Masked sum per row divided by the tensor width, then mean over rows.
    ///
    /// The divisor is the padded width rather than the live count so that it
    /// stays constant across batches with different padding.
    SeqMeanTokenSumNorm,
    /// As [`LossAggMode::SeqMeanTokenSumNorm`], multiplied by a scale.
    SeqMeanTokenSumNormScaled,
}

impl LossAggMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenMean => "token-mean",
            Self::SeqMeanTokenSum => "seq-mean-token-sum",
            Self::SeqMeanTokenMean => "seq-mean-token-mean",
            Self::SeqMeanTokenSumNorm => "seq-mean-token-sum-norm",
            Self::SeqMeanTokenSumNormScaled => "seq-mean-token-sum-norm-scaled",
        }
    }
}

impl fmt::Display for LossAggMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossAggMode {
    type Err = RemoraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "token-mean" => Ok(Self::TokenMean),
            "seq-mean-token-sum" => Ok(Self::SeqMeanTokenSum),
            "seq-mean-token-mean" => Ok(Self::SeqMeanTokenMean),
            "seq-mean-token-sum-norm" => Ok(Self::SeqMeanTokenSumNorm),
            "seq-mean-token-sum-norm-scaled" => Ok(Self::SeqMeanTokenSumNormScaled),
            other => Err(RemoraError::InvalidConfig(format!(
                "invalid loss_agg_mode: {other}"
            ))),
        }
    }
}

/// Aggregate `loss` into a scalar under `mask`.
///
/// `scale` only affects [`LossAggMode::SeqMeanTokenSumNormScaled`]; `eps` only
/// guards the per-row count of [`LossAggMode::SeqMeanTokenMean`].
/// An empty batch aggregates to `0.0`.
pub fn agg_loss(
    loss: &Array2<f32>,
    mask: &Array2<f32>,
    mode: LossAggMode,
    scale: f32,
    eps: f32,
) -> Result<f32> {
    ensure_same_shape("loss mask", loss, mask)?;
    if mode == LossAggMode::TokenMean {
        return Ok(masked_mean(loss, mask));
    }

    let width = loss.ncols() as f32;
    let row_sums = (loss * mask).sum_axis(Axis(1));
    let per_row = match mode {
        LossAggMode::SeqMeanTokenSum => row_sums,
        LossAggMode::SeqMeanTokenMean => {
            let counts = mask.sum_axis(Axis(1));
            row_sums / (counts + eps)
        }
        LossAggMode::SeqMeanTokenSumNorm => row_sums / width,
        LossAggMode::SeqMeanTokenSumNormScaled => row_sums / width * scale,
        LossAggMode::TokenMean => unreachable!("handled above"),
    };
    Ok(per_row.mean().unwrap_or(0.0))
}
