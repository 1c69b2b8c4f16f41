//! Ridge solver backed by a symmetric eigendecomposition.
//!
//! The centered training data is decomposed once; solutions for any number of
//! regularization strengths then cost a single matrix-vector product each.
//! With more samples than predictors the p x p normal matrix `XᵀX` is
//! decomposed (primal form), otherwise the n x n kernel `XXᵀ` (dual form).

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::error::{HsrError, Result};

const EIGEN_EPSILON: f64 = 1e-14;
const EIGEN_MAX_ITERATIONS: usize = 10_000;

#[derive(Debug, Clone)]
enum Basis {
    /// No predictor columns, the model is the training mean
    Empty,
    /// Eigenvectors of `XᵀX`
    Primal,
    /// Eigenvectors of `XXᵀ`, coefficients recovered through `Xᵀ`
    Dual { centered: DMatrix<f64> },
}

/// Decomposed ridge problem for one training set
#[derive(Debug, Clone)]
pub struct RidgeSolver {
    x_mean: DVector<f64>,
    y_mean: f64,
    eigenvalues: DVector<f64>,
    eigenvectors: DMatrix<f64>,
    /// Right-hand side expressed in the eigenbasis
    projected: DVector<f64>,
    basis: Basis,
}

impl RidgeSolver {
    /// Center `x` (rows = samples) and `y` and decompose the problem
    ///
    /// # Errors
    /// `RegressionFit` if there are no rows, shapes disagree, or the
    /// eigendecomposition does not converge to finite values.
    pub fn new(x: &DMatrix<f64>, y: &DVector<f64>) -> Result<Self> {
        let (n, p) = x.shape();
        if n == 0 || y.len() != n {
            return Err(HsrError::RegressionFit(format!(
                "cannot fit {} targets against a {}x{} design",
                y.len(),
                n,
                p
            )));
        }

        let y_mean = y.mean();
        let x_mean = DVector::from_fn(p, |j, _| x.column(j).mean());
        let centered = DMatrix::from_fn(n, p, |i, j| x[(i, j)] - x_mean[j]);
        let y_centered = y.map(|v| v - y_mean);

        if p == 0 {
            return Ok(Self {
                x_mean,
                y_mean,
                eigenvalues: DVector::zeros(0),
                eigenvectors: DMatrix::zeros(0, 0),
                projected: DVector::zeros(0),
                basis: Basis::Empty,
            });
        }

        if p <= n {
            let normal = centered.transpose() * &centered;
            let eigen = decompose(normal)?;
            let projected = eigen.eigenvectors.transpose() * (centered.transpose() * &y_centered);
            Ok(Self {
                x_mean,
                y_mean,
                eigenvalues: eigen.eigenvalues,
                eigenvectors: eigen.eigenvectors,
                projected,
                basis: Basis::Primal,
            })
        } else {
            let kernel = &centered * centered.transpose();
            let eigen = decompose(kernel)?;
            let projected = eigen.eigenvectors.transpose() * &y_centered;
            Ok(Self {
                x_mean,
                y_mean,
                eigenvalues: eigen.eigenvalues,
                eigenvectors: eigen.eigenvectors,
                projected,
                basis: Basis::Dual { centered },
            })
        }
    }

    pub fn n_predictors(&self) -> usize {
        self.x_mean.len()
    }

    /// Ridge coefficients for strength `alpha`
    pub fn coefficients(&self, alpha: f64) -> DVector<f64> {
        let scaled = DVector::from_fn(self.projected.len(), |k, _| {
            // Round-off can push zero eigenvalues slightly negative
            self.projected[k] / (self.eigenvalues[k].max(0.0) + alpha)
        });
        match &self.basis {
            Basis::Empty => DVector::zeros(self.n_predictors()),
            Basis::Primal => &self.eigenvectors * scaled,
            Basis::Dual { centered } => centered.transpose() * (&self.eigenvectors * scaled),
        }
    }

    /// Intercept matching `coefficients` on the original (uncentered) scale
    pub fn intercept(&self, coefficients: &DVector<f64>) -> f64 {
        self.y_mean - self.x_mean.dot(coefficients)
    }

    /// Predictions for the rows of `x` using the given coefficients
    pub fn predict(&self, x: &DMatrix<f64>, coefficients: &DVector<f64>) -> DVector<f64> {
        let intercept = self.intercept(coefficients);
        if coefficients.is_empty() {
            return DVector::from_element(x.nrows(), intercept);
        }
        (x * coefficients).add_scalar(intercept)
    }
}

fn decompose(matrix: DMatrix<f64>) -> Result<SymmetricEigen<f64, nalgebra::Dyn>> {
    let dim = matrix.nrows();
    let eigen = SymmetricEigen::try_new(matrix, EIGEN_EPSILON, EIGEN_MAX_ITERATIONS).ok_or_else(
        || HsrError::RegressionFit(format!("eigendecomposition of {dim}x{dim} matrix did not converge")),
    )?;
    if eigen.eigenvalues.iter().any(|v| !v.is_finite())
        || eigen.eigenvectors.iter().any(|v| !v.is_finite())
    {
        return Err(HsrError::RegressionFit(
            "eigendecomposition produced non-finite values".to_string(),
        ));
    }
    Ok(eigen)
}
