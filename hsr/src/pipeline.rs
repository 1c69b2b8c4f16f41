//! Orchestration of the half-sibling regression chain.
//!
//! A run starts with a baseline: every region-of-interest pixel is modeled
//! with nothing excluded. Each candidate position then refits the pixels its
//! exclusion mask touches, derotates and combines the residuals, and scores
//! the candidate with the detection statistic. With the forward model
//! enabled, each refit target trains on every sample and carries the
//! candidate's signal trace as an extra design column; the median fitted
//! coefficient becomes the candidate's brightness estimate.
//!
//! Work is a parallel map over independent units (target pixels, candidate
//! positions). Every worker owns its design matrix, model and residual
//! buffer; the results are merged into the residual cube or detection map in
//! one sequential step once the map has finished. A [`CancellationToken`]
//! stops units that have not started yet; they are marked
//! [`PixelStatus::Cancelled`] and keep NaN values.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use ndarray::{concatenate, Array1, Array2, Array3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{HsrConfig, RefitScope};
use crate::cube::{ImageCube, Pixel, Position};
use crate::derotation::{CombinationRule, ResidualCube};
use crate::detection::{compute_snr, DetectionMap, InvalidSnr, SnrMeasurement};
use crate::error::{HsrError, Result};
use crate::forward_model::{signal_footprint, signal_stack};
use crate::geometry::Trajectory;
use crate::injection::PsfTemplate;
use crate::masking::ExclusionMask;
use crate::regression::{fit_ridge_cv, principal_component_sources};
use crate::selection::{select_predictors, PredictorRegion, SelectionMode};

/// Outcome marker for one pixel or one candidate position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelStatus {
    Valid,
    #[default]
    NotEvaluated,
    InsufficientPredictors,
    RegressionFailed,
    Cancelled,
    /// No finite data to compute a value from
    NoData,
    /// Too few usable samples under the candidate mask; the baseline
    /// residual was kept
    BaselineFallback,
}

impl PixelStatus {
    /// Whether a pixel with this status carries a usable residual
    pub fn has_residual(&self) -> bool {
        matches!(self, PixelStatus::Valid | PixelStatus::BaselineFallback)
    }

    /// Marker for an error confined to one pixel; `None` for run-level errors
    pub fn from_local_error(error: &HsrError) -> Option<Self> {
        if !error.is_local() {
            return None;
        }
        Some(match error {
            HsrError::InsufficientPredictors { .. } => PixelStatus::InsufficientPredictors,
            _ => PixelStatus::RegressionFailed,
        })
    }
}

/// Shared flag for stopping a running batch
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Called with each candidate's position and marker once it is finished
pub type CandidateCallback = Arc<dyn Fn(Pixel, PixelStatus) + Send + Sync>;

/// Residual series (or failure) of one target pixel
#[derive(Debug, Clone)]
struct PixelOutcome {
    pixel: Pixel,
    residuals: Option<Array1<f64>>,
    status: PixelStatus,
    /// Fitted weight of the signal column under the forward model
    signal_coefficient: Option<f64>,
}

impl PixelOutcome {
    fn marker(pixel: Pixel, status: PixelStatus) -> Self {
        Self {
            pixel,
            residuals: None,
            status,
            signal_coefficient: None,
        }
    }
}

/// Per-candidate inputs shared by every refit target
struct FitContext<'m> {
    mask: &'m ExclusionMask<'m>,
    /// Pixels the mask touches at some step
    footprint: Array2<bool>,
    /// Unit-contrast signal stack when the forward model is used
    signal: Option<Array3<f64>>,
}

impl<'m> FitContext<'m> {
    fn masked(mask: &'m ExclusionMask<'m>) -> Self {
        Self {
            mask,
            footprint: mask.footprint(),
            signal: None,
        }
    }
}

/// Residual cube and per-pixel status with nothing excluded
#[derive(Debug, Clone)]
pub struct Baseline {
    pub residuals: ResidualCube,
    pub status: Array2<PixelStatus>,
}

/// Everything computed for one candidate position
#[derive(Debug, Clone)]
pub struct CandidateEvaluation {
    pub candidate: Position,
    pub trajectory: Trajectory,
    pub residuals: ResidualCube,
    pub status: Array2<PixelStatus>,
    /// Derotated and combined residual frame
    pub combined: Array2<f64>,
    pub snr: std::result::Result<SnrMeasurement, InvalidSnr>,
    /// Median signal coefficient over the refit pixels (forward model only)
    pub signal_coefficient: Option<f64>,
    /// Number of pixels that were refit for this candidate
    pub n_refit: usize,
    pub cancelled: bool,
}

impl CandidateEvaluation {
    /// Marker for the detection map entry of this candidate
    pub fn candidate_status(&self) -> PixelStatus {
        if self.cancelled {
            return PixelStatus::Cancelled;
        }
        if self.snr.is_ok() {
            return PixelStatus::Valid;
        }
        let own = self
            .candidate
            .nearest_pixel(self.residuals.frame_size())
            .map(|p| self.status[p.index()]);
        match own {
            Some(s @ (PixelStatus::InsufficientPredictors | PixelStatus::RegressionFailed)) => s,
            _ => PixelStatus::NoData,
        }
    }
}

/// Configured pipeline over one image cube
pub struct HsrPipeline<'a> {
    cube: &'a ImageCube,
    config: HsrConfig,
    predictor_pool: Vec<Pixel>,
    roi: Vec<Pixel>,
    template: Option<PsfTemplate>,
    cancel: CancellationToken,
    on_candidate: Option<CandidateCallback>,
    show_progress: bool,
}

impl<'a> HsrPipeline<'a> {
    /// # Errors
    /// `InvalidConfig` if the configuration does not validate
    pub fn new(cube: &'a ImageCube, config: HsrConfig) -> Result<Self> {
        config.validate()?;
        let size = cube.frame_size();
        let predictor_pool =
            PredictorRegion::Annulus(config.predictor_region).pixels(size, cube.center())?;
        let roi = config.roi().pixels(size, cube.center());
        debug!(
            "pipeline over {} cube: {} predictor pixels, {} ROI pixels",
            size,
            predictor_pool.len(),
            roi.len()
        );
        Ok(Self {
            cube,
            config,
            predictor_pool,
            roi,
            template: None,
            cancel: CancellationToken::new(),
            on_candidate: None,
            show_progress: false,
        })
    }

    /// Replace the annulus pool by an explicit region
    pub fn with_predictor_region(mut self, region: &PredictorRegion) -> Result<Self> {
        self.predictor_pool = region.pixels(self.cube.frame_size(), self.cube.center())?;
        Ok(self)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// PSF template used to build the forward model's signal column
    pub fn with_psf_template(mut self, template: PsfTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_candidate_callback(mut self, callback: CandidateCallback) -> Self {
        self.on_candidate = Some(callback);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &HsrConfig {
        &self.config
    }

    pub fn cube(&self) -> &ImageCube {
        self.cube
    }

    pub fn roi(&self) -> &[Pixel] {
        &self.roi
    }

    fn progress_bar(&self, len: usize, message: &str) -> ProgressBar {
        let bar = ProgressBar::new(len as u64);
        if !self.show_progress {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) ETA: {eta}")
        {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
        }
        bar.set_message(message.to_string());
        bar
    }

    fn forward_template(&self) -> Result<Option<&PsfTemplate>> {
        if !self.config.use_forward_model {
            return Ok(None);
        }
        self.template.as_ref().map(Some).ok_or_else(|| {
            HsrError::InvalidConfig("use_forward_model requires a PSF template".to_string())
        })
    }

    /// Model one target pixel under the candidate context
    ///
    /// Errors confined to the pixel become status markers; anything else
    /// aborts the run.
    fn fit_pixel(&self, target: Pixel, context: &FitContext<'_>) -> Result<PixelOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(PixelOutcome::marker(target, PixelStatus::Cancelled));
        }

        let n_frames = self.cube.n_frames();
        let n_usable = match context.signal {
            Some(_) => n_frames,
            None => context.mask.usable_steps(target).iter().filter(|&&u| u).count(),
        };
        if n_usable < self.config.min_training_samples {
            return Ok(PixelOutcome::marker(target, PixelStatus::BaselineFallback));
        }

        let mut rules = self.config.selection_rules();
        if context.signal.is_some() {
            rules.mode = SelectionMode::AllFrames;
        }
        let fitted = select_predictors(
            target,
            &self.predictor_pool,
            context.mask,
            &context.footprint,
            &rules,
        )
        .and_then(|mut selection| {
            let design = selection.design_matrix(self.cube);
            let design = match self.config.sources.pca_components {
                Some(k) => principal_component_sources(design.view(), k)?,
                None => design,
            };
            let signal_column = context
                .signal
                .as_ref()
                .map(|stack| stack.slice(ndarray::s![.., target.row, target.col]).to_owned());
            let design = match &signal_column {
                Some(column) => {
                    selection.usable = vec![true; n_frames];
                    concatenate(Axis(1), &[design.view(), column.view().insert_axis(Axis(1))])
                        .map_err(|e| HsrError::RegressionFit(e.to_string()))?
                }
                None => design,
            };
            let fit = fit_ridge_cv(
                design.view(),
                self.cube.time_series(target),
                &selection.usable,
                &self.config.regression_settings(),
            )?;
            Ok((fit, signal_column))
        });

        match fitted {
            Ok((fit, None)) => Ok(PixelOutcome {
                pixel: target,
                residuals: Some(fit.residuals),
                status: PixelStatus::Valid,
                signal_coefficient: None,
            }),
            Ok((fit, Some(column))) => {
                // The planet term stays in the residual; only systematics are removed
                let last = fit.coefficients.len() - 1;
                let coefficient = fit.is_active(last).then(|| fit.coefficients[last]);
                let residuals = fit.residuals + &column * coefficient.unwrap_or(0.0);
                Ok(PixelOutcome {
                    pixel: target,
                    residuals: Some(residuals),
                    status: PixelStatus::Valid,
                    signal_coefficient: coefficient,
                })
            }
            Err(e) => match PixelStatus::from_local_error(&e) {
                Some(status) => {
                    debug!("pixel ({}, {}) not modeled: {}", target.row, target.col, e);
                    Ok(PixelOutcome::marker(target, status))
                }
                None => Err(e),
            },
        }
    }

    /// Parallel map over `targets`; results keep the input order
    fn fit_pixels(&self, targets: &[Pixel], context: &FitContext<'_>) -> Result<Vec<PixelOutcome>> {
        targets
            .par_iter()
            .map(|&target| self.fit_pixel(target, context))
            .collect()
    }

    /// Model every ROI pixel with nothing excluded
    ///
    /// Pixels without enough samples or predictors keep NaN residuals and a
    /// failure status.
    pub fn baseline(&self) -> Result<Baseline> {
        let size = self.cube.frame_size();
        info!(
            "Fitting baseline models for {} pixels ({} frames)",
            self.roi.len(),
            self.cube.n_frames()
        );
        let mask = ExclusionMask::empty(self.cube.n_frames(), size);
        let outcomes = self.fit_pixels(&self.roi, &FitContext::masked(&mask))?;

        let mut residuals = ResidualCube::empty(
            self.cube.frames().dim(),
            self.cube.angles().clone(),
            self.cube.center(),
        )?;
        let mut status = size.filled(PixelStatus::NotEvaluated);
        for outcome in outcomes {
            // The empty mask leaves every sample usable, so a fallback here
            // means the cube is shorter than `min_training_samples`
            let marker = match outcome.status {
                PixelStatus::BaselineFallback => PixelStatus::NoData,
                other => other,
            };
            status[outcome.pixel.index()] = marker;
            if let Some(series) = outcome.residuals {
                residuals
                    .residuals
                    .slice_mut(ndarray::s![.., outcome.pixel.row, outcome.pixel.col])
                    .assign(&series);
            }
        }

        let failed = status
            .iter()
            .filter(|s| !matches!(s, PixelStatus::Valid | PixelStatus::NotEvaluated))
            .count();
        if failed > 0 {
            warn!("{failed} baseline pixels could not be modeled");
        }
        Ok(Baseline { residuals, status })
    }

    /// Refit the pixels touched by `candidate`'s mask and score the candidate
    ///
    /// # Errors
    /// `InvalidGeometry` if the candidate never lies inside the frame,
    /// `InvalidConfig` if the forward model is enabled without a template
    pub fn evaluate_candidate(
        &self,
        baseline: &Baseline,
        candidate: Position,
    ) -> Result<CandidateEvaluation> {
        let size = self.cube.frame_size();
        let trajectory = Trajectory::compute(candidate, self.cube.angles(), self.cube.center(), size)?;
        let (outcomes, refit_region, n_refit) = {
            let mask = ExclusionMask::new(
                &trajectory,
                self.config.masking_radius,
                self.config.mask_mode,
                size,
            );
            let mut context = FitContext::masked(&mask);
            let mut refit_region = context.footprint.clone();
            if let Some(template) = self.forward_template()? {
                let stack = signal_stack(&trajectory, size, template, &self.config.interpolation);
                let traced = signal_footprint(&stack, template, self.config.forward_model_footprint);
                refit_region.zip_mut_with(&traced, |refit, &t| *refit |= t);
                context.signal = Some(stack);
            }

            let targets: Vec<Pixel> = match self.config.refit_scope {
                RefitScope::Full => self.roi.clone(),
                RefitScope::CollectionRegion => self
                    .roi
                    .iter()
                    .copied()
                    .filter(|p| refit_region[p.index()])
                    .collect(),
            };
            (self.fit_pixels(&targets, &context)?, refit_region, targets.len())
        };

        let mut coefficients: Vec<f64> = outcomes
            .iter()
            .filter(|o| refit_region[o.pixel.index()])
            .filter_map(|o| o.signal_coefficient)
            .collect();
        let signal_coefficient = match CombinationRule::Median.combine(&mut coefficients) {
            median if median.is_finite() => Some(median),
            _ => None,
        };

        let mut residuals = baseline.residuals.clone();
        let mut status = baseline.status.clone();
        let mut cancelled = false;
        for outcome in outcomes {
            let column = ndarray::s![.., outcome.pixel.row, outcome.pixel.col];
            match (outcome.status, outcome.residuals) {
                (PixelStatus::BaselineFallback, _) => {
                    if baseline.status[outcome.pixel.index()] == PixelStatus::Valid {
                        status[outcome.pixel.index()] = PixelStatus::BaselineFallback;
                    }
                }
                (marker, Some(series)) => {
                    residuals.residuals.slice_mut(column).assign(&series);
                    status[outcome.pixel.index()] = marker;
                }
                (marker, None) => {
                    cancelled |= marker == PixelStatus::Cancelled;
                    residuals.residuals.slice_mut(column).fill(f64::NAN);
                    status[outcome.pixel.index()] = marker;
                }
            }
        }

        let combined = residuals.combine(&self.config.interpolation, self.config.combination_rule)?;
        let snr = compute_snr(
            &combined.view(),
            candidate,
            self.cube.center(),
            self.config.aperture_radius,
            self.config.ignore_neighbors,
        );

        Ok(CandidateEvaluation {
            candidate,
            trajectory,
            residuals,
            status,
            combined,
            snr,
            signal_coefficient,
            n_refit,
            cancelled,
        })
    }

    /// Detection map over `candidates` (defaults to every ROI pixel)
    ///
    /// Candidates are evaluated in parallel against a shared baseline and
    /// merged into the map afterwards. Candidates that fail keep NaN values
    /// and a failure marker.
    pub fn detection_map(&self, candidates: Option<&[Pixel]>) -> Result<DetectionMap> {
        let baseline = self.baseline()?;
        self.detection_map_with_baseline(&baseline, candidates)
    }

    pub fn detection_map_with_baseline(
        &self,
        baseline: &Baseline,
        candidates: Option<&[Pixel]>,
    ) -> Result<DetectionMap> {
        let candidates = candidates.unwrap_or(self.roi.as_slice());
        self.forward_template()?;
        info!("Evaluating {} candidate positions", candidates.len());
        let bar = self.progress_bar(candidates.len(), "Detection map");

        type Entry = (Pixel, PixelStatus, Option<SnrMeasurement>, Option<f64>);
        let results: Vec<Entry> = candidates
            .par_iter()
            .map(|&pixel| {
                let result = if self.cancel.is_cancelled() {
                    (pixel, PixelStatus::Cancelled, None, None)
                } else {
                    match self.evaluate_candidate(baseline, pixel.position()) {
                        Ok(evaluation) => {
                            let status = evaluation.candidate_status();
                            let measurement = match status {
                                PixelStatus::Valid => evaluation.snr.ok(),
                                _ => None,
                            };
                            (pixel, status, measurement, evaluation.signal_coefficient)
                        }
                        Err(e) => {
                            warn!("candidate ({}, {}) skipped: {}", pixel.row, pixel.col, e);
                            (pixel, PixelStatus::NoData, None, None)
                        }
                    }
                };
                if let Some(callback) = &self.on_candidate {
                    callback(result.0, result.1);
                }
                bar.inc(1);
                result
            })
            .collect();
        bar.finish_and_clear();

        let mut map = DetectionMap::new(self.cube.frame_size());
        for (pixel, status, measurement, coefficient) in results {
            match measurement {
                Some(m) => map.record(pixel, &m),
                None => map.mark(pixel, status),
            }
            if status != PixelStatus::Cancelled {
                map.record_coefficient(pixel, coefficient);
            }
        }
        info!(
            "Detection map: {} valid, {} no data, {} cancelled",
            map.count(PixelStatus::Valid),
            map.count(PixelStatus::NoData),
            map.count(PixelStatus::Cancelled)
        );
        Ok(map)
    }
}
