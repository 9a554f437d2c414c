//! Critic loss and the entropy term of the actor loss.

use ndarray::{Array2, Array3, Zip};

use crate::error::{RemoraError, Result};

use super::masked::{clip_by_value, ensure_same_shape, entropy_from_logits, masked_mean};

/// Clipped value loss and the fraction of elements where clipping won.
///
/// Predictions are clipped to `old_values ± cliprange_value`; the larger of
/// the two squared errors is averaged over the mask and halved.
pub fn compute_value_loss(
    vpreds: &Array2<f32>,
    returns: &Array2<f32>,
    old_values: &Array2<f32>,
    response_mask: &Array2<f32>,
    cliprange_value: f32,
) -> Result<(f32, f32)> {
    ensure_same_shape("returns", vpreds, returns)?;
    ensure_same_shape("values", vpreds, old_values)?;
    ensure_same_shape("response_mask", vpreds, response_mask)?;

    let low = old_values - cliprange_value;
    let high = old_values + cliprange_value;
    let clipped = clip_by_value(vpreds, &low, &high);

    let mut clipped_wins = Array2::<f32>::zeros(vpreds.dim());
    let losses = Zip::from(vpreds)
        .and(&clipped)
        .and(returns)
        .and(&mut clipped_wins)
        .map_collect(|&v, &vc, &g, won| {
            let unclipped = (v - g) * (v - g);
            let clipped = (vc - g) * (vc - g);
            if clipped > unclipped {
                *won = 1.0;
            }
            unclipped.max(clipped)
        });

    let loss = 0.5 * masked_mean(&losses, response_mask);
    let clip_fraction = masked_mean(&clipped_wins, response_mask);
    Ok((loss, clip_fraction))
}

/// Masked mean of the categorical entropy of `logits` `(rows, T, vocab)`.
pub fn compute_entropy_loss(logits: &Array3<f32>, response_mask: &Array2<f32>) -> Result<f32> {
    let (rows, width, _) = logits.dim();
    if (rows, width) != response_mask.dim() {
        return Err(RemoraError::shape("logits", response_mask.dim(), (rows, width)));
    }
    let entropy = entropy_from_logits(logits);
    Ok(masked_mean(&entropy, response_mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_value_loss_inside_clip_range() {
        let vpreds = array![[1.0, 2.0]];
        let old = array![[1.1, 1.9]];
        let returns = array![[0.0, 0.0]];
        let mask = array![[1.0, 1.0]];
        let (loss, frac) = compute_value_loss(&vpreds, &returns, &old, &mask, 0.5).unwrap();
        // No clipping: 0.5 * mean(1, 4).
        assert!((loss - 1.25).abs() < 1e-6);
        assert_eq!(frac, 0.0);
    }

    #[test]
    fn test_value_loss_clipped_branch() {
        // Prediction moved away from old value toward the return; clipping
        // keeps it at 0.5 which has the larger error.
        let vpreds = array![[2.0]];
        let old = array![[0.0]];
        let returns = array![[2.0]];
        let mask = array![[1.0]];
        let (loss, frac) = compute_value_loss(&vpreds, &returns, &old, &mask, 0.5).unwrap();
        assert!((loss - 0.5 * 2.25).abs() < 1e-6);
        assert_eq!(frac, 1.0);
    }

    #[test]
    fn test_value_loss_respects_mask() {
        let vpreds = array![[1.0, 100.0]];
        let old = array![[1.0, 100.0]];
        let returns = array![[0.0, 0.0]];
        let mask = array![[1.0, 0.0]];
        let (loss, _) = compute_value_loss(&vpreds, &returns, &old, &mask, 0.2).unwrap();
        assert!((loss - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_entropy_loss_masked() {
        let mut logits = Array3::<f32>::zeros((1, 2, 2));
        logits[[0, 1, 0]] = 50.0;
        let mask = array![[1.0, 0.0]];
        let h = compute_entropy_loss(&logits, &mask).unwrap();
        assert!((h - 2.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_entropy_loss_shape_check() {
        let logits = Array3::<f32>::zeros((1, 3, 2));
        let mask = array![[1.0, 1.0]];
        assert!(compute_entropy_loss(&logits, &mask).is_err());
    }
}
