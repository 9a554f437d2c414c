//! Masked tensor statistics shared by the estimators and objectives.
//!
//! Every helper treats `mask` as a 0/1 weight tensor with the same shape as the
//! values. Positions with mask 0 never contribute to a statistic.

use ndarray::{Array1, Array2, Array3, Axis, Zip};

use crate::error::{RemoraError, Result};

/// Variance floor used by [`masked_whiten`].
const WHITEN_EPS: f32 = 1e-8;

/// Fail unless `a` and `b` have identical 2-D shapes.
pub fn ensure_same_shape(what: &'static str, a: &Array2<f32>, b: &Array2<f32>) -> Result<()> {
    if a.dim() != b.dim() {
        return Err(RemoraError::shape(what, a.dim(), b.dim()));
    }
    Ok(())
}

/// Sum of `values * mask`.
pub fn masked_sum(values: &Array2<f32>, mask: &Array2<f32>) -> f32 {
    Zip::from(values)
        .and(mask)
        .fold(0.0f64, |acc, &v, &m| acc + f64::from(v * m)) as f32
}

/// Mean of `values` over the live positions of `mask`.
///
/// An all-zero mask yields `0.0`.
pub fn masked_mean(values: &Array2<f32>, mask: &Array2<f32>) -> f32 {
    let count: f64 = mask.iter().map(|&m| f64::from(m)).sum();
    if count == 0.0 {
        return 0.0;
    }
    (f64::from(masked_sum(values, mask)) / count) as f32
}

/// Per-row masked mean; rows without live positions yield `0.0`.
pub fn masked_mean_rows(values: &Array2<f32>, mask: &Array2<f32>) -> Array1<f32> {
    let sums = (values * mask).sum_axis(Axis(1));
    let counts = mask.sum_axis(Axis(1));
    Zip::from(&sums)
        .and(&counts)
        .map_collect(|&s, &c| if c == 0.0 { 0.0 } else { s / c })
}

/// Masked variance, optionally with Bessel's correction.
///
/// With `unbiased`, fewer than two live positions is an error because the
/// correction would divide by zero.
pub fn masked_var(values: &Array2<f32>, mask: &Array2<f32>, unbiased: bool) -> Result<f32> {
    let mean = masked_mean(values, mask);
    let centered = values.mapv(|v| (v - mean) * (v - mean));
    let mut variance = masked_mean(&centered, mask);
    if unbiased {
        let count = mask.sum();
        if count == 0.0 {
            return Err(RemoraError::DegenerateMask(
                "at least one element in the mask has to be 1".into(),
            ));
        }
        if count == 1.0 {
            return Err(RemoraError::DegenerateMask(
                "the sum of the mask is one, which would divide by zero".into(),
            ));
        }
        variance *= count / (count - 1.0);
    }
    Ok(variance)
}

/// Whiten `values` with the masked mean and unbiased masked variance.
///
/// When `shift_mean` is false the mean is added back after scaling.
pub fn masked_whiten(values: &Array2<f32>, mask: &Array2<f32>, shift_mean: bool) -> Result<Array2<f32>> {
    ensure_same_shape("whiten mask", values, mask)?;
    let mean = masked_mean(values, mask);
    let var = masked_var(values, mask, true)?;
    let inv_std = 1.0 / (var + WHITEN_EPS).sqrt();
    Ok(values.mapv(|v| {
        let w = (v - mean) * inv_std;
        if shift_mean {
            w
        } else {
            w + mean
        }
    }))
}

/// Clamp each element of `x` into `[low, high]`, both given elementwise.
pub fn clip_by_value(x: &Array2<f32>, low: &Array2<f32>, high: &Array2<f32>) -> Array2<f32> {
    Zip::from(x)
        .and(low)
        .and(high)
        .map_collect(|&v, &lo, &hi| v.max(lo).min(hi))
}

/// Categorical entropy per position from unnormalized logits `(rows, T, vocab)`.
///
/// Uses `H = logsumexp(z) - sum(softmax(z) * z)` with the max-shifted form of
/// log-sum-exp, so large logits do not overflow.
pub fn entropy_from_logits(logits: &Array3<f32>) -> Array2<f32> {
    let (rows, cols, _) = logits.dim();
    let mut out = Array2::<f32>::zeros((rows, cols));
    for ((r, t), slot) in out.indexed_iter_mut() {
        let z = logits.slice(ndarray::s![r, t, ..]);
        let max = z.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        if !max.is_finite() {
            *slot = 0.0;
            continue;
        }
        let sum_exp: f64 = z.iter().map(|&v| f64::from(v - max).exp()).sum();
        let lse = f64::from(max) + sum_exp.ln();
        let expected: f64 = z
            .iter()
            .map(|&v| {
                let p = (f64::from(v) - lse).exp();
                p * f64::from(v)
            })
            .sum();
        *slot = (lse - expected) as f32;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_masked_mean_ignores_dead_positions() {
        let v = array![[1.0, 2.0, 100.0], [3.0, 4.0, -100.0]];
        let m = array![[1.0, 1.0, 0.0], [1.0, 1.0, 0.0]];
        assert!((masked_mean(&v, &m) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_masked_mean_empty_mask() {
        let v = array![[1.0, 2.0]];
        let m = array![[0.0, 0.0]];
        assert_eq!(masked_mean(&v, &m), 0.0);
    }

    #[test]
    fn test_masked_mean_rows() {
        let v = array![[1.0, 3.0, 9.0], [2.0, 0.0, 0.0]];
        let m = array![[1.0, 1.0, 0.0], [0.0, 0.0, 0.0]];
        let rows = masked_mean_rows(&v, &m);
        assert!((rows[0] - 2.0).abs() < 1e-6);
        assert_eq!(rows[1], 0.0);
    }

    #[test]
    fn test_masked_var_unbiased() {
        let v = array![[1.0, 3.0, 50.0]];
        let m = array![[1.0, 1.0, 0.0]];
        // Mean 2, squared deviations 1 and 1, unbiased variance 2.
        assert!((masked_var(&v, &m, true).unwrap() - 2.0).abs() < 1e-6);
        assert!((masked_var(&v, &m, false).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_masked_var_single_element_fails() {
        let v = array![[1.0, 3.0]];
        let m = array![[1.0, 0.0]];
        assert!(matches!(
            masked_var(&v, &m, true),
            Err(RemoraError::DegenerateMask(_))
        ));
    }

    #[test]
    fn test_masked_whiten_zero_mean_unit_var() {
        let v = array![[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]];
        let m = Array2::ones((2, 4));
        let w = masked_whiten(&v, &m, true).unwrap();
        assert!(masked_mean(&w, &m).abs() < 1e-5);
        assert!((masked_var(&w, &m, true).unwrap() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_masked_whiten_keep_mean() {
        let v = array![[1.0, 3.0]];
        let m = array![[1.0, 1.0]];
        let w = masked_whiten(&v, &m, false).unwrap();
        assert!((masked_mean(&w, &m) - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_clip_by_value() {
        let x = array![[0.0, 5.0, -5.0]];
        let lo = array![[-1.0, -1.0, -1.0]];
        let hi = array![[1.0, 1.0, 1.0]];
        assert_eq!(clip_by_value(&x, &lo, &hi), array![[0.0, 1.0, -1.0]]);
    }

    #[test]
    fn test_entropy_uniform_logits() {
        let logits = Array3::<f32>::zeros((1, 2, 4));
        let h = entropy_from_logits(&logits);
        let expected = (4.0f32).ln();
        assert!((h[[0, 0]] - expected).abs() < 1e-5);
        assert!((h[[0, 1]] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_entropy_large_logits_stay_finite() {
        let mut logits = Array3::<f32>::zeros((1, 1, 3));
        logits[[0, 0, 0]] = 1.0e4;
        let h = entropy_from_logits(&logits);
        assert!(h[[0, 0]].is_finite());
        assert!(h[[0, 0]].abs() < 1e-3);
    }
}
