//! Cross-validation helpers: regularization grids, folds, alpha selection.

use serde::{Deserialize, Serialize};

use crate::error::{HsrError, Result};

/// Relative tolerance under which two validation errors count as tied
pub const TIE_RELATIVE_TOLERANCE: f64 = 1e-9;

/// Held-out error for one regularization strength
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CvScore {
    pub alpha: f64,
    /// Mean squared held-out prediction error over all folds
    pub mse: f64,
}

/// Geometric grid of `n` strengths from `min` to `max` inclusive
///
/// # Errors
/// `InvalidConfig` unless `0 < min <= max`, both finite, and `n >= 1`.
pub fn geometric_grid(min: f64, max: f64, n: usize) -> Result<Vec<f64>> {
    if !(min.is_finite() && max.is_finite()) || min <= 0.0 || max < min || n == 0 {
        return Err(HsrError::InvalidConfig(format!(
            "invalid geometric grid: min={min}, max={max}, n={n}"
        )));
    }
    if n == 1 {
        return Ok(vec![min]);
    }
    let ratio = (max / min).ln() / (n - 1) as f64;
    let mut grid: Vec<f64> = (0..n).map(|i| min * (ratio * i as f64).exp()).collect();
    grid[n - 1] = max;
    Ok(grid)
}

/// Validate a regularization grid and return it sorted ascending without
/// duplicates
pub fn normalized_grid(grid: &[f64]) -> Result<Vec<f64>> {
    if grid.is_empty() {
        return Err(HsrError::InvalidConfig(
            "regularization grid is empty".to_string(),
        ));
    }
    if let Some(bad) = grid.iter().find(|a| !a.is_finite() || **a <= 0.0) {
        return Err(HsrError::InvalidConfig(format!(
            "regularization strengths must be positive and finite, got {bad}"
        )));
    }
    let mut sorted = grid.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup();
    Ok(sorted)
}

/// Split `indices` into `k` contiguous, nearly equal folds
///
/// The first `len % k` folds receive one extra element.
pub fn contiguous_folds(indices: &[usize], k: usize) -> Vec<Vec<usize>> {
    let k = k.clamp(1, indices.len().max(1));
    let base = indices.len() / k;
    let extra = indices.len() % k;

    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let len = base + usize::from(fold < extra);
        folds.push(indices[start..start + len].to_vec());
        start += len;
    }
    folds
}

/// Pick the strength with the smallest held-out error
///
/// Errors within [`TIE_RELATIVE_TOLERANCE`] of the minimum are treated as
/// equal, and among those the largest alpha (the simplest model) wins.
///
/// # Errors
/// `RegressionFit` if there are no scores or any score is not finite.
pub fn select_alpha(scores: &[CvScore]) -> Result<f64> {
    if scores.is_empty() {
        return Err(HsrError::RegressionFit(
            "no cross-validation scores to select from".to_string(),
        ));
    }
    if let Some(bad) = scores.iter().find(|s| !s.mse.is_finite()) {
        return Err(HsrError::RegressionFit(format!(
            "cross-validation error for alpha={} is not finite",
            bad.alpha
        )));
    }

    let best = scores
        .iter()
        .map(|s| s.mse)
        .fold(f64::INFINITY, f64::min);
    let threshold = best + TIE_RELATIVE_TOLERANCE * best.abs().max(f64::MIN_POSITIVE);

    scores
        .iter()
        .filter(|s| s.mse <= threshold)
        .map(|s| s.alpha)
        .max_by(|a, b| a.total_cmp(b))
        .ok_or_else(|| HsrError::RegressionFit("alpha selection failed".to_string()))
}
