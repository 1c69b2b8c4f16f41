//! Predictor ("half-sibling") selection for a target pixel.
//!
//! The admissible pool comes from a fixed spatial rule (an annulus around
//! the star or an explicit region mask). For a given candidate hypothesis,
//! pixels touched by the exclusion mask are removed from the pool, and the
//! target's own samples are dropped from training wherever the target sits
//! inside the mask.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::cube::{FrameSize, ImageCube, Pixel, Position};
use crate::error::{HsrError, Result};
use crate::masking::ExclusionMask;

/// Ring of pixels between two separations from the frame center
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Annulus {
    pub inner_radius: f64,
    pub outer_radius: f64,
}

impl Annulus {
    pub fn new(inner_radius: f64, outer_radius: f64) -> Self {
        Self {
            inner_radius,
            outer_radius,
        }
    }

    /// Whether the pixel center at `position` lies in the ring
    pub fn contains(&self, center: Position, position: Position) -> bool {
        let r = position.distance(center);
        r >= self.inner_radius && r <= self.outer_radius
    }

    /// All pixels of a frame whose centers lie in the ring, row-major
    pub fn pixels(&self, frame_size: FrameSize, center: Position) -> Vec<Pixel> {
        frame_size
            .pixels()
            .filter(|p| self.contains(center, p.position()))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.inner_radius.is_finite() && self.outer_radius.is_finite()) {
            return Err(HsrError::InvalidConfig(
                "annulus radii must be finite".to_string(),
            ));
        }
        if self.inner_radius < 0.0 || self.outer_radius <= self.inner_radius {
            return Err(HsrError::InvalidConfig(format!(
                "annulus requires 0 <= inner ({}) < outer ({})",
                self.inner_radius, self.outer_radius
            )));
        }
        Ok(())
    }
}

/// Spatial rule defining which pixels may ever act as predictors
#[derive(Debug, Clone)]
pub enum PredictorRegion {
    Annulus(Annulus),
    /// Explicit boolean mask with the frame's shape
    Mask(Array2<bool>),
}

impl PredictorRegion {
    /// Pixels admitted by the rule, row-major
    pub fn pixels(&self, frame_size: FrameSize, center: Position) -> Result<Vec<Pixel>> {
        match self {
            PredictorRegion::Annulus(annulus) => Ok(annulus.pixels(frame_size, center)),
            PredictorRegion::Mask(mask) => {
                let (height, width) = mask.dim();
                if height != frame_size.height || width != frame_size.width {
                    return Err(HsrError::InvalidConfig(format!(
                        "predictor region mask is {width}x{height}, frame is {frame_size}"
                    )));
                }
                Ok(mask
                    .indexed_iter()
                    .filter(|(_, &keep)| keep)
                    .map(|((r, c), _)| Pixel::new(r, c))
                    .collect())
            }
        }
    }
}

/// How the time-varying exclusion is applied to the predictor pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Drop predictors excluded at any time step
    #[default]
    AllFrames,
    /// Drop predictors excluded at any step used for training the target
    TrainingWindow,
}

/// Rules applied on top of the spatial pool
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionRules {
    pub mode: SelectionMode,
    pub min_predictors: usize,
    /// Pixels closer than this to the target are never predictors
    pub min_target_separation: f64,
}

/// Predictors and usable training steps for one target pixel
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorSelection {
    pub target: Pixel,
    pub predictors: Vec<Pixel>,
    /// `usable[t]` is false where the target lies inside the exclusion mask
    pub usable: Vec<bool>,
}

impl PredictorSelection {
    pub fn n_predictors(&self) -> usize {
        self.predictors.len()
    }

    pub fn n_training(&self) -> usize {
        self.usable.iter().filter(|&&u| u).count()
    }

    pub fn training_indices(&self) -> Vec<usize> {
        self.usable
            .iter()
            .enumerate()
            .filter_map(|(t, &u)| u.then_some(t))
            .collect()
    }

    /// Predictor time series as a `(n_frames, n_predictors)` design matrix
    pub fn design_matrix(&self, cube: &ImageCube) -> Array2<f64> {
        let frames = cube.frames();
        let mut design = Array2::<f64>::zeros((cube.n_frames(), self.predictors.len()));
        for (mut column, pixel) in design.axis_iter_mut(Axis(1)).zip(&self.predictors) {
            column.assign(&frames.slice(ndarray::s![.., pixel.row, pixel.col]));
        }
        design
    }
}

/// Select the predictors for `target` under `mask`
///
/// `pool` is the output of [`PredictorRegion::pixels`] and `footprint` the
/// mask's [`ExclusionMask::footprint`], computed once per candidate. The
/// target never appears in its own predictor set.
///
/// # Errors
/// `InsufficientPredictors` if fewer than `rules.min_predictors` remain;
/// `InvalidGeometry` if `footprint` does not match the mask's frame.
pub fn select_predictors(
    target: Pixel,
    pool: &[Pixel],
    mask: &ExclusionMask<'_>,
    footprint: &Array2<bool>,
    rules: &SelectionRules,
) -> Result<PredictorSelection> {
    let frame_size = mask.frame_size();
    if footprint.dim() != (frame_size.height, frame_size.width) {
        return Err(HsrError::InvalidGeometry(format!(
            "exclusion footprint is {:?}, frame is {frame_size}",
            footprint.dim()
        )));
    }
    let usable = mask.usable_steps(target);
    let min_sep_sq = rules.min_target_separation * rules.min_target_separation;
    let target_position = target.position();

    let predictors: Vec<Pixel> = pool
        .iter()
        .copied()
        .filter(|&p| p != target)
        .filter(|p| {
            rules.min_target_separation <= 0.0
                || p.position().distance_squared(target_position) >= min_sep_sq
        })
        .filter(|&p| match rules.mode {
            SelectionMode::AllFrames => !footprint[p.index()],
            SelectionMode::TrainingWindow => !mask.excluded_within(p, &usable),
        })
        .collect();

    if predictors.len() < rules.min_predictors {
        return Err(HsrError::InsufficientPredictors {
            available: predictors.len(),
            required: rules.min_predictors,
        });
    }

    Ok(PredictorSelection {
        target,
        predictors,
        usable,
    })
}
