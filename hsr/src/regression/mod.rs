//! Per-pixel regularized regression.
//!
//! [`fit_ridge_cv`] fits a ridge model with intercept that predicts a target
//! pixel's time series from its predictors' time series. The strength is
//! selected by contiguous k-fold cross-validation over the usable training
//! steps; the final model is refit on all of them and evaluated at every
//! time step, including those excluded from training.

pub mod cv;
pub mod pca;
pub mod ridge;

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, ArrayView1, ArrayView2};

use crate::error::{HsrError, Result};
pub use cv::{contiguous_folds, geometric_grid, normalized_grid, select_alpha, CvScore};
pub use pca::principal_component_sources;
pub use ridge::RidgeSolver;

/// Regression settings shared by every pixel of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionSettings {
    /// Candidate regularization strengths
    pub grid: Vec<f64>,
    pub cv_folds: usize,
}

/// Fitted model for one (pixel, candidate) pair
#[derive(Debug, Clone)]
pub struct RidgeFit {
    pub alpha: f64,
    /// One coefficient per design column; dropped constant columns get 0
    pub coefficients: Array1<f64>,
    pub intercept: f64,
    /// Model prediction at every time step
    pub predictions: Array1<f64>,
    /// `target - predictions` at every time step
    pub residuals: Array1<f64>,
    pub cv_scores: Vec<CvScore>,
    pub n_training: usize,
    /// Number of design columns with non-zero training variance
    pub n_active: usize,
    /// Indices of those columns, ascending
    pub active_columns: Vec<usize>,
}

impl RidgeFit {
    /// Whether design column `j` took part in the fit
    pub fn is_active(&self, j: usize) -> bool {
        self.active_columns.binary_search(&j).is_ok()
    }
}

fn submatrix(design: &ArrayView2<f64>, rows: &[usize], columns: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), columns.len(), |i, j| design[[rows[i], columns[j]]])
}

fn subvector(target: &ArrayView1<f64>, rows: &[usize]) -> DVector<f64> {
    DVector::from_fn(rows.len(), |i, _| target[rows[i]])
}

/// Columns whose training values are not all identical
fn varying_columns(design: &ArrayView2<f64>, rows: &[usize]) -> Vec<usize> {
    (0..design.ncols())
        .filter(|&j| {
            let first = design[[rows[0], j]];
            rows.iter().any(|&i| design[[i, j]] != first)
        })
        .collect()
}

/// Fit a cross-validated ridge model
///
/// # Arguments
/// * `design` - `(n_frames, n_predictors)` predictor time series
/// * `target` - target time series of length `n_frames`
/// * `usable` - per-step flags, only `true` steps are used for training
/// * `settings` - regularization grid and fold count
///
/// # Errors
/// `RegressionFit` if fewer than 2 training samples are available, the
/// training data is not finite, the grid is empty, or the numerical solution
/// is not finite.
pub fn fit_ridge_cv(
    design: ArrayView2<f64>,
    target: ArrayView1<f64>,
    usable: &[bool],
    settings: &RegressionSettings,
) -> Result<RidgeFit> {
    let n_frames = target.len();
    if design.nrows() != n_frames || usable.len() != n_frames {
        return Err(HsrError::RegressionFit(format!(
            "design has {} rows, target {} samples, usable flags {}",
            design.nrows(),
            n_frames,
            usable.len()
        )));
    }
    let grid = normalized_grid(&settings.grid)
        .map_err(|e| HsrError::RegressionFit(e.to_string()))?;

    let training: Vec<usize> = (0..n_frames).filter(|&t| usable[t]).collect();
    if training.len() < 2 {
        return Err(HsrError::RegressionFit(format!(
            "only {} usable training samples",
            training.len()
        )));
    }
    let finite_training = training.iter().all(|&t| {
        target[t].is_finite() && design.row(t).iter().all(|v| v.is_finite())
    });
    if !finite_training {
        return Err(HsrError::RegressionFit(
            "training data contains non-finite values".to_string(),
        ));
    }

    let columns = varying_columns(&design, &training);
    let folds = contiguous_folds(&training, settings.cv_folds.max(2));

    let mut squared_errors = vec![0.0; grid.len()];
    for fold in &folds {
        let train_rows: Vec<usize> = training
            .iter()
            .copied()
            .filter(|t| !fold.contains(t))
            .collect();
        let solver = RidgeSolver::new(
            &submatrix(&design, &train_rows, &columns),
            &subvector(&target, &train_rows),
        )?;
        let held_out = submatrix(&design, fold, &columns);
        let held_out_target = subvector(&target, fold);

        for (error, &alpha) in squared_errors.iter_mut().zip(&grid) {
            let coefficients = solver.coefficients(alpha);
            let predicted = solver.predict(&held_out, &coefficients);
            *error += (&held_out_target - predicted).norm_squared();
        }
    }

    let cv_scores: Vec<CvScore> = grid
        .iter()
        .zip(&squared_errors)
        .map(|(&alpha, &sse)| CvScore {
            alpha,
            mse: sse / training.len() as f64,
        })
        .collect();
    let alpha = select_alpha(&cv_scores)?;

    let solver = RidgeSolver::new(
        &submatrix(&design, &training, &columns),
        &subvector(&target, &training),
    )?;
    let active = solver.coefficients(alpha);
    let intercept = solver.intercept(&active);
    if !intercept.is_finite() || active.iter().any(|c| !c.is_finite()) {
        return Err(HsrError::RegressionFit(format!(
            "non-finite coefficients at alpha={alpha}"
        )));
    }

    let mut coefficients = Array1::<f64>::zeros(design.ncols());
    for (k, &j) in columns.iter().enumerate() {
        coefficients[j] = active[k];
    }

    // Rows outside training may hold NaN predictors; those predictions stay NaN
    let predictions: Array1<f64> = design
        .rows()
        .into_iter()
        .map(|row| {
            intercept
                + columns
                    .iter()
                    .zip(active.iter())
                    .map(|(&j, &c)| row[j] * c)
                    .sum::<f64>()
        })
        .collect();
    let residuals = &target - &predictions;

    Ok(RidgeFit {
        alpha,
        coefficients,
        intercept,
        predictions,
        residuals,
        cv_scores,
        n_training: training.len(),
        n_active: columns.len(),
        active_columns: columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn settings(grid: Vec<f64>) -> RegressionSettings {
        RegressionSettings { grid, cv_folds: 5 }
    }

    fn noisy_problem(n: usize, p: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let design = Array2::from_shape_fn((n, p), |_| normal.sample(&mut rng));
        let target = Array1::from_shape_fn(n, |t| {
            design[[t, 0]] * 2.0 - design[[t, 1]] + 0.1 * normal.sample(&mut rng) + 5.0
        });
        (design, target)
    }

    #[test]
    fn test_alpha_is_drawn_from_grid() {
        let (design, target) = noisy_problem(40, 6, 1);
        let grid = geometric_grid(1e-3, 1e3, 7).unwrap();
        let fit = fit_ridge_cv(design.view(), target.view(), &[true; 40], &settings(grid.clone()))
            .unwrap();
        assert!(grid.contains(&fit.alpha));
        assert_eq!(fit.cv_scores.len(), 7);
        assert_relative_eq!(fit.coefficients[0], 2.0, epsilon = 0.1);
        assert_relative_eq!(fit.intercept, 5.0, epsilon = 0.1);
    }

    #[test]
    fn test_raised_grid_minimum_is_respected() {
        let (design, target) = noisy_problem(40, 6, 2);
        let grid = geometric_grid(1e3, 1e5, 5).unwrap();
        let fit = fit_ridge_cv(design.view(), target.view(), &[true; 40], &settings(grid)).unwrap();
        assert!(fit.alpha >= 1e3);
    }

    #[test]
    fn test_predictions_cover_excluded_steps() {
        let (design, mut target) = noisy_problem(30, 4, 3);
        let mut usable = vec![true; 30];
        for t in 10..15 {
            usable[t] = false;
            // A bright planet only the excluded steps see
            target[t] += 100.0;
        }
        let fit = fit_ridge_cv(design.view(), target.view(), &usable, &settings(vec![0.01, 0.1, 1.0]))
            .unwrap();
        assert_eq!(fit.n_training, 25);
        assert_eq!(fit.predictions.len(), 30);
        for t in 10..15 {
            assert!(fit.residuals[t] > 90.0);
        }
        for t in 0..10 {
            assert!(fit.residuals[t].abs() < 1.0);
        }
    }

    #[test]
    fn test_constant_predictors_are_handled() {
        let n = 20;
        let mut design = Array2::<f64>::zeros((n, 3));
        for t in 0..n {
            design[[t, 1]] = t as f64;
        }
        design.column_mut(2).fill(4.0);
        let target = Array1::from_shape_fn(n, |t| 3.0 * t as f64 + 1.0);

        let fit = fit_ridge_cv(design.view(), target.view(), &vec![true; n], &settings(vec![1e-8])).unwrap();
        assert_eq!(fit.n_active, 1);
        assert_eq!(fit.active_columns, vec![1]);
        assert!(fit.is_active(1) && !fit.is_active(2));
        assert_eq!(fit.coefficients[0], 0.0);
        assert_eq!(fit.coefficients[2], 0.0);
        assert_relative_eq!(fit.coefficients[1], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_all_constant_predictors_give_mean_model() {
        let design = Array2::<f64>::zeros((10, 4));
        let target = Array1::from_shape_fn(10, |t| t as f64);
        let grid = vec![0.1, 1.0, 10.0];
        let fit = fit_ridge_cv(design.view(), target.view(), &[true; 10], &settings(grid)).unwrap();
        // Every alpha scores the same, so the tie goes to the largest
        assert_eq!(fit.alpha, 10.0);
        assert!(fit.predictions.iter().all(|&p| (p - 4.5).abs() < 1e-12));
    }

    #[test]
    fn test_failure_modes() {
        let (design, target) = noisy_problem(10, 3, 4);
        let mut usable = vec![false; 10];
        usable[3] = true;
        assert!(matches!(
            fit_ridge_cv(design.view(), target.view(), &usable, &settings(vec![1.0])),
            Err(HsrError::RegressionFit(_))
        ));
        assert!(matches!(
            fit_ridge_cv(design.view(), target.view(), &[true; 10], &settings(vec![])),
            Err(HsrError::RegressionFit(_))
        ));

        let mut broken = target.clone();
        broken[0] = f64::NAN;
        assert!(fit_ridge_cv(design.view(), broken.view(), &[true; 10], &settings(vec![1.0])).is_err());
    }

    #[test]
    fn test_deterministic() {
        let (design, target) = noisy_problem(25, 30, 5);
        let grid = geometric_grid(1e-1, 1e3, 5).unwrap();
        let a = fit_ridge_cv(design.view(), target.view(), &[true; 25], &settings(grid.clone())).unwrap();
        let b = fit_ridge_cv(design.view(), target.view(), &[true; 25], &settings(grid)).unwrap();
        assert_eq!(a.alpha, b.alpha);
        assert_eq!(a.residuals, b.residuals);
    }
}
