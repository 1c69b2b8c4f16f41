//! Error taxonomy for the half-sibling regression pipeline.
//!
//! Geometry and batch-input errors are fatal for the run that raised them.
//! `InsufficientPredictors` and `RegressionFit` are local to a single pixel
//! and are converted into [`crate::pipeline::PixelStatus`] markers by the
//! pipeline; `CalibrationInput` only aborts the injection run it belongs to.

use thiserror::Error;

/// Errors produced by the HSR engine
#[derive(Error, Debug)]
pub enum HsrError {
    /// Malformed angle series, mismatched cube/angle lengths, or a position
    /// that never lands inside the frame
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The predictor pool collapsed below the configured minimum
    #[error("Insufficient predictors: {available} available, {required} required")]
    InsufficientPredictors { available: usize, required: usize },

    /// Numerical failure while fitting a regularized model
    #[error("Regression fit failed: {0}")]
    RegressionFit(String),

    /// Malformed injection template or contrast
    #[error("Invalid calibration input: {0}")]
    CalibrationInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("FITS I/O error: {0}")]
    Fits(#[from] fitsio::compat::errors::Error),
}

impl HsrError {
    /// Whether this error only invalidates a single pixel rather than the run
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            HsrError::InsufficientPredictors { .. } | HsrError::RegressionFit(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HsrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_errors() {
        assert!(HsrError::InsufficientPredictors {
            available: 1,
            required: 8
        }
        .is_local());
        assert!(HsrError::RegressionFit("singular".to_string()).is_local());
        assert!(!HsrError::InvalidGeometry("empty".to_string()).is_local());
        assert!(!HsrError::CalibrationInput("negative".to_string()).is_local());
    }

    #[test]
    fn test_display_messages() {
        let err = HsrError::InsufficientPredictors {
            available: 3,
            required: 10,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient predictors: 3 available, 10 required"
        );
    }
}
