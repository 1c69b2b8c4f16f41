//! Principal-component compression of predictor time series.

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView2};

use crate::error::{HsrError, Result};

/// Relative eigenvalue floor below which a component carries no variance
const COMPONENT_FLOOR: f64 = 1e-12;

/// Project the predictor columns of `design` onto their leading principal
/// components
///
/// Columns are centered over all rows. The result has shape
/// `(n_rows, k)` with `k <= n_components`; components with vanishing
/// variance are omitted, so `k` can be smaller than requested.
///
/// # Errors
/// `RegressionFit` if `design` contains non-finite values or the
/// decomposition fails.
pub fn principal_component_sources(
    design: ArrayView2<f64>,
    n_components: usize,
) -> Result<Array2<f64>> {
    let (n, p) = design.dim();
    if design.iter().any(|v| !v.is_finite()) {
        return Err(HsrError::RegressionFit(
            "cannot compute principal components of non-finite predictors".to_string(),
        ));
    }
    if n == 0 || p == 0 || n_components == 0 {
        return Ok(Array2::zeros((n, 0)));
    }

    let means: Vec<f64> = (0..p)
        .map(|j| design.column(j).sum() / n as f64)
        .collect();
    let centered = DMatrix::from_fn(n, p, |i, j| design[[i, j]] - means[j]);

    // Decompose the smaller Gram matrix; both give the same scores
    let form = if p <= n { GramForm::Primal } else { GramForm::Dual };
    component_scores(&centered, n_components, form)
}

/// Which Gram matrix of the centered design is decomposed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GramForm {
    /// `X^T X`, size `p x p`
    Primal,
    /// `X X^T`, size `n x n`
    Dual,
}

fn component_scores(centered: &DMatrix<f64>, n_components: usize, form: GramForm) -> Result<Array2<f64>> {
    let n = centered.nrows();
    let gram = match form {
        GramForm::Primal => centered.transpose() * centered,
        GramForm::Dual => centered * centered.transpose(),
    };
    let eigen = nalgebra::SymmetricEigen::try_new(gram, 1e-14, 10_000).ok_or_else(|| {
        HsrError::RegressionFit("principal component decomposition did not converge".to_string())
    })?;

    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let largest = order
        .first()
        .map(|&k| eigen.eigenvalues[k])
        .unwrap_or(0.0);
    let kept: Vec<usize> = order
        .into_iter()
        .filter(|&k| eigen.eigenvalues[k] > COMPONENT_FLOOR * largest.max(f64::MIN_POSITIVE))
        .take(n_components)
        .collect();

    let mut scores = Array2::<f64>::zeros((n, kept.len()));
    for (column, &k) in kept.iter().enumerate() {
        let vector = eigen.eigenvectors.column(k);
        match form {
            GramForm::Primal => {
                let projected = centered * vector;
                for i in 0..n {
                    scores[[i, column]] = projected[i];
                }
            }
            GramForm::Dual => {
                let scale = eigen.eigenvalues[k].sqrt();
                for i in 0..n {
                    scores[[i, column]] = vector[i] * scale;
                }
            }
        }
    }

    if scores.iter().any(|v| !v.is_finite()) {
        return Err(HsrError::RegressionFit(
            "principal component scores are not finite".to_string(),
        ));
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn test_rank_one_design() {
        // Every column is a multiple of the same series
        let series: Vec<f64> = (0..10).map(|i| (i as f64 * 0.7).sin()).collect();
        let design = Array2::from_shape_fn((10, 4), |(i, j)| series[i] * (j + 1) as f64 + j as f64);
        let scores = principal_component_sources(design.view(), 3).unwrap();
        assert_eq!(scores.dim(), (10, 1));

        // The single component is proportional to the centered series
        let mean = series.iter().sum::<f64>() / 10.0;
        let ratio = scores[[0, 0]] / (series[0] - mean);
        for i in 0..10 {
            assert_relative_eq!(scores[[i, 0]], ratio * (series[i] - mean), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_primal_and_dual_scores_agree() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let design = Array2::from_shape_fn((12, 5), |(_, j)| normal.sample(&mut rng) * (j + 1) as f64);
        let means: Vec<f64> = (0..5).map(|j| design.column(j).sum() / 12.0).collect();
        let centered = DMatrix::from_fn(12, 5, |i, j| design[[i, j]] - means[j]);

        let primal = component_scores(&centered, 3, GramForm::Primal).unwrap();
        let dual = component_scores(&centered, 3, GramForm::Dual).unwrap();
        assert_eq!(primal.dim(), (12, 3));
        assert_eq!(dual.dim(), (12, 3));

        // Same components in the same order; each may flip sign
        for k in 0..3 {
            let sign = if primal.column(k).dot(&dual.column(k)) < 0.0 { -1.0 } else { 1.0 };
            for i in 0..12 {
                assert_relative_eq!(primal[[i, k]], sign * dual[[i, k]], epsilon = 1e-8);
            }
        }

        // The public entry point picks the primal form for this tall design
        let public = principal_component_sources(design.view(), 3).unwrap();
        assert_eq!(public, primal);
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut design = Array2::<f64>::ones((3, 3));
        design[[1, 1]] = f64::NAN;
        assert!(principal_component_sources(design.view(), 2).is_err());
    }
}
