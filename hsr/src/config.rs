//! Run configuration.
//!
//! All options are serialized as JSON. Missing fields take their default
//! values, so a configuration file only needs to name what it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::derotation::{CombinationRule, InterpolationKind};
use crate::error::{HsrError, Result};
use crate::masking::MaskMode;
use crate::regression::{geometric_grid, normalized_grid, RegressionSettings};
use crate::selection::{Annulus, SelectionMode, SelectionRules};

/// Which pixels are refit for every candidate position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefitScope {
    /// Only pixels the candidate's exclusion mask touches at some time step;
    /// every other pixel keeps its baseline residuals
    #[default]
    CollectionRegion,
    /// Every region-of-interest pixel
    Full,
}

/// How predictor time series are fed to the regression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Replace raw predictors by this many principal components
    pub pca_components: Option<usize>,
}

/// Complete set of options for a half-sibling regression run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HsrConfig {
    /// Radius in pixels excluded around the candidate trajectory
    pub masking_radius: f64,
    /// Annulus of admissible predictor pixels
    pub predictor_region: Annulus,
    /// Candidate ridge strengths
    pub regularization_grid: Vec<f64>,
    pub combination_rule: CombinationRule,
    pub cv_folds: usize,
    /// Target pixels to model; defaults to the predictor region
    pub roi: Option<Annulus>,
    pub min_predictors: usize,
    pub min_target_separation: f64,
    pub selection_mode: SelectionMode,
    pub mask_mode: MaskMode,
    pub interpolation: InterpolationKind,
    /// Aperture radius in pixels, typically half the PSF FWHM
    pub aperture_radius: f64,
    /// Reference apertures skipped on each side of the signal aperture
    pub ignore_neighbors: usize,
    /// Below this many usable samples a pixel keeps its baseline residual
    pub min_training_samples: usize,
    pub refit_scope: RefitScope,
    pub sources: SourceConfig,
    /// SNR above which an injected source counts as recovered
    pub detection_threshold: f64,
    /// Fit the candidate's signal trace as an extra design column instead of
    /// dropping the target's contaminated samples
    pub use_forward_model: bool,
    /// Fraction of the template peak a pixel's trace must reach to be refit
    /// under the forward model
    pub forward_model_footprint: f64,
}

impl Default for HsrConfig {
    fn default() -> Self {
        Self {
            masking_radius: 3.0,
            predictor_region: Annulus::new(0.0, 20.0),
            // 13 strengths spaced by half a decade between 1e-1 and 1e5
            regularization_grid: geometric_grid(1e-1, 1e5, 13).unwrap_or_else(|_| vec![1.0]),
            combination_rule: CombinationRule::Mean,
            cv_folds: 5,
            roi: None,
            min_predictors: 8,
            min_target_separation: 0.0,
            selection_mode: SelectionMode::AllFrames,
            mask_mode: MaskMode::Full,
            interpolation: InterpolationKind::Bilinear,
            aperture_radius: 1.0,
            ignore_neighbors: 0,
            min_training_samples: 10,
            refit_scope: RefitScope::CollectionRegion,
            sources: SourceConfig::default(),
            detection_threshold: 5.0,
            use_forward_model: false,
            forward_model_footprint: 0.5,
        }
    }
}

impl HsrConfig {
    /// Check every option for consistency
    ///
    /// # Errors
    /// `InvalidConfig` describing the first offending option
    pub fn validate(&self) -> Result<()> {
        if !self.masking_radius.is_finite() || self.masking_radius < 0.0 {
            return Err(HsrError::InvalidConfig(format!(
                "masking_radius must be finite and >= 0, got {}",
                self.masking_radius
            )));
        }
        self.predictor_region.validate()?;
        if let Some(roi) = &self.roi {
            roi.validate()?;
        }
        normalized_grid(&self.regularization_grid)?;
        self.combination_rule.validate()?;
        if self.cv_folds < 2 {
            return Err(HsrError::InvalidConfig(format!(
                "cv_folds must be at least 2, got {}",
                self.cv_folds
            )));
        }
        if !self.min_target_separation.is_finite() || self.min_target_separation < 0.0 {
            return Err(HsrError::InvalidConfig(format!(
                "min_target_separation must be finite and >= 0, got {}",
                self.min_target_separation
            )));
        }
        if !self.aperture_radius.is_finite() || self.aperture_radius <= 0.0 {
            return Err(HsrError::InvalidConfig(format!(
                "aperture_radius must be positive, got {}",
                self.aperture_radius
            )));
        }
        if self.min_training_samples < 2 {
            return Err(HsrError::InvalidConfig(format!(
                "min_training_samples must be at least 2, got {}",
                self.min_training_samples
            )));
        }
        if self.sources.pca_components == Some(0) {
            return Err(HsrError::InvalidConfig(
                "sources.pca_components must be positive when set".to_string(),
            ));
        }
        if !self.detection_threshold.is_finite() {
            return Err(HsrError::InvalidConfig(
                "detection_threshold must be finite".to_string(),
            ));
        }
        if !(self.forward_model_footprint > 0.0 && self.forward_model_footprint <= 1.0) {
            return Err(HsrError::InvalidConfig(format!(
                "forward_model_footprint must be in (0, 1], got {}",
                self.forward_model_footprint
            )));
        }
        Ok(())
    }

    /// Region of target pixels
    pub fn roi(&self) -> Annulus {
        self.roi.unwrap_or(self.predictor_region)
    }

    pub fn selection_rules(&self) -> SelectionRules {
        SelectionRules {
            mode: self.selection_mode,
            min_predictors: self.min_predictors,
            min_target_separation: self.min_target_separation,
        }
    }

    pub fn regression_settings(&self) -> RegressionSettings {
        RegressionSettings {
            grid: self.regularization_grid.clone(),
            cv_folds: self.cv_folds,
        }
    }

    /// Save as pretty-printed JSON
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from JSON and validate
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}
