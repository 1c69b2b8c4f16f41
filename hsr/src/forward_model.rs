//! Forward modeling of a companion's signal.
//!
//! A PSF template placed along a candidate's trajectory gives the time
//! series a companion at that position would leave in every pixel. With
//! `use_forward_model` set, the pipeline appends that series to each
//! target's design matrix and reads the fitted coefficient as a brightness
//! estimate instead of masking the target's contaminated samples.

use ndarray::{Array2, Array3, Axis};

use crate::cube::{FrameSize, ParallacticAngles, Pixel, Position};
use crate::derotation::{Interpolator, ResidualCube};
use crate::error::{HsrError, Result};
use crate::geometry::Trajectory;
use crate::injection::PsfTemplate;

/// Add `contrast * template` to `frames` along `trajectory`
///
/// The template is resampled with `interpolator` so that its center lands
/// on the sub-pixel trajectory position in every frame. Taps outside the
/// template read zero.
pub(crate) fn add_trace(
    frames: &mut Array3<f64>,
    trajectory: &Trajectory,
    template: &PsfTemplate,
    contrast: f64,
    interpolator: &dyn Interpolator,
) {
    let (_, height, width) = frames.dim();
    let stamp = template.data().view();
    let stamp_center = template.center();
    let stamp_size = template.size();

    for (t, detector) in trajectory.positions().iter().enumerate() {
        let row_lo = (detector.y - stamp_center.y - 1.0).floor().max(0.0) as usize;
        let col_lo = (detector.x - stamp_center.x - 1.0).floor().max(0.0) as usize;
        let row_hi = (detector.y + stamp_size.height as f64 - stamp_center.y + 1.0)
            .ceil()
            .min(height as f64);
        let col_hi = (detector.x + stamp_size.width as f64 - stamp_center.x + 1.0)
            .ceil()
            .min(width as f64);
        if row_hi <= 0.0 || col_hi <= 0.0 {
            continue;
        }

        for row in row_lo..row_hi as usize {
            for col in col_lo..col_hi as usize {
                let offset = Position::new(
                    col as f64 - detector.x + stamp_center.x,
                    row as f64 - detector.y + stamp_center.y,
                );
                let value = contrast * interpolator.sample(&stamp, offset, 0.0);
                if value != 0.0 {
                    frames[[t, row, col]] += value;
                }
            }
        }
    }
}

/// Unit-contrast signal of a companion following `trajectory`
pub fn signal_stack(
    trajectory: &Trajectory,
    frame_size: FrameSize,
    template: &PsfTemplate,
    interpolator: &dyn Interpolator,
) -> Array3<f64> {
    let mut stack = Array3::zeros((trajectory.len(), frame_size.height, frame_size.width));
    add_trace(&mut stack, trajectory, template, 1.0, interpolator);
    stack
}

/// Pixels whose signal reaches `fraction` of the template peak at some step
pub fn signal_footprint(stack: &Array3<f64>, template: &PsfTemplate, fraction: f64) -> Array2<bool> {
    let threshold = fraction * template.peak();
    stack
        .map_axis(Axis(0), |series| series.iter().any(|&v| v >= threshold))
}

/// Planet model built from a map of signal coefficients
///
/// Every position with a positive coefficient contributes its signal stack
/// weighted by that coefficient. The sum is rescaled so its maximum equals
/// the largest coefficient. Positions whose trajectory leaves the frame are
/// skipped.
///
/// # Errors
/// `InvalidGeometry` if `angles` is empty.
pub fn best_fit_planet_model(
    coefficients: &Array2<f64>,
    angles: &ParallacticAngles,
    center: Position,
    template: &PsfTemplate,
    interpolator: &dyn Interpolator,
) -> Result<Array3<f64>> {
    if angles.is_empty() {
        return Err(HsrError::InvalidGeometry(
            "planet model needs at least one frame".to_string(),
        ));
    }
    let frame_size = FrameSize::of_array(&coefficients.view());
    let mut model = Array3::zeros((angles.len(), frame_size.height, frame_size.width));

    let positive: Vec<(Pixel, f64)> = coefficients
        .indexed_iter()
        .filter(|(_, &c)| c.is_finite() && c > 0.0)
        .map(|((r, c), &coefficient)| (Pixel::new(r, c), coefficient))
        .collect();
    for &(pixel, coefficient) in &positive {
        match Trajectory::compute(pixel.position(), angles, center, frame_size) {
            Ok(trajectory) => add_trace(&mut model, &trajectory, template, coefficient, interpolator),
            Err(_) => continue,
        }
    }

    let model_peak = model.iter().copied().fold(0.0, f64::max);
    let coefficient_peak = positive.iter().map(|&(_, c)| c).fold(0.0, f64::max);
    if model_peak > 0.0 {
        model.mapv_inplace(|v| v / model_peak * coefficient_peak);
    }
    Ok(model)
}

/// Residual cube with per-pixel residuals taken from chosen hypotheses
///
/// Where `selection` is true and `hypotheses` names a candidate, the
/// pixel's series comes from that entry of `candidates`; everywhere else
/// the `default` residuals are kept.
///
/// # Errors
/// `InvalidGeometry` if any shape differs from `default` or a hypothesis
/// index is out of range.
pub fn assemble_residuals(
    default: &ResidualCube,
    hypotheses: &Array2<Option<usize>>,
    selection: &Array2<bool>,
    candidates: &[ResidualCube],
) -> Result<ResidualCube> {
    let (_, height, width) = default.residuals.dim();
    if hypotheses.dim() != (height, width) || selection.dim() != (height, width) {
        return Err(HsrError::InvalidGeometry(format!(
            "hypothesis map {:?} and selection {:?} must match frame {}x{}",
            hypotheses.dim(),
            selection.dim(),
            width,
            height
        )));
    }
    if let Some(bad) = candidates
        .iter()
        .position(|c| c.residuals.dim() != default.residuals.dim())
    {
        return Err(HsrError::InvalidGeometry(format!(
            "hypothesis {bad} has shape {:?}, default has {:?}",
            candidates[bad].residuals.dim(),
            default.residuals.dim()
        )));
    }

    let mut assembled = default.clone();
    for ((r, c), hypothesis) in hypotheses.indexed_iter() {
        let index = match hypothesis {
            Some(index) if selection[[r, c]] => *index,
            _ => continue,
        };
        let source = candidates.get(index).ok_or_else(|| {
            HsrError::InvalidGeometry(format!(
                "pixel ({r}, {c}) selects hypothesis {index} of {}",
                candidates.len()
            ))
        })?;
        assembled
            .residuals
            .slice_mut(ndarray::s![.., r, c])
            .assign(&source.residuals.slice(ndarray::s![.., r, c]));
    }
    Ok(assembled)
}
