//! Derotation and stacking of residual frames.
//!
//! A residual frame recorded at parallactic angle `angle[t]` is resampled so
//! that a sky-fixed source lands on its candidate position: the derotated
//! frame at `q` reads the raw frame at `rotate_position(q, center,
//! -angle[t])`, the same mapping [`crate::geometry::Trajectory`] uses.
//! Samples that need data from outside the frame or from a NaN pixel are NaN
//! ("no data") and are skipped by every [`CombinationRule`].

pub mod combine;
pub mod interpolate;

use ndarray::{Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;

use crate::cube::{FrameSize, ParallacticAngles, Position};
use crate::error::{HsrError, Result};
use crate::geometry::rotate_position;
pub use combine::{combine_stack, CombinationRule};
pub use interpolate::{Bicubic, Bilinear, InterpolationKind, Interpolator, Nearest};

/// Derotate a single frame recorded at `angle` degrees
pub fn derotate_frame(
    frame: &ArrayView2<f64>,
    angle: f64,
    center: Position,
    interpolator: &dyn Interpolator,
) -> Array2<f64> {
    let size = FrameSize::of_array(frame);
    Array2::from_shape_fn((size.height, size.width), |(r, c)| {
        let source = rotate_position(Position::new(c as f64, r as f64), center, -angle);
        interpolator.sample(frame, source, f64::NAN)
    })
}

/// Derotate every frame of a `(n_frames, height, width)` stack
///
/// # Errors
/// `InvalidGeometry` if the angle series length differs from the frame count
pub fn derotate_cube(
    frames: &Array3<f64>,
    angles: &ParallacticAngles,
    center: Position,
    interpolator: &dyn Interpolator,
) -> Result<Array3<f64>> {
    let n_frames = frames.len_of(Axis(0));
    if angles.len() != n_frames {
        return Err(HsrError::InvalidGeometry(format!(
            "cannot derotate {} frames with {} angles",
            n_frames,
            angles.len()
        )));
    }

    let derotated: Vec<Array2<f64>> = (0..n_frames)
        .into_par_iter()
        .map(|t| derotate_frame(&frames.index_axis(Axis(0), t), angles.get(t), center, interpolator))
        .collect();

    let mut output = Array3::<f64>::from_elem(frames.dim(), f64::NAN);
    for (mut slot, frame) in output.axis_iter_mut(Axis(0)).zip(derotated) {
        slot.assign(&frame);
    }
    Ok(output)
}

/// Per-pixel residual time series for one candidate context
///
/// Same shape as the source cube; NaN marks samples without a valid model.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualCube {
    pub residuals: Array3<f64>,
    pub angles: ParallacticAngles,
    pub center: Position,
}

impl ResidualCube {
    /// Residual cube filled with "no data"
    ///
    /// # Errors
    /// `InvalidGeometry` if `angles` does not have one entry per frame
    pub fn empty(
        shape: (usize, usize, usize),
        angles: ParallacticAngles,
        center: Position,
    ) -> Result<Self> {
        if angles.len() != shape.0 {
            return Err(HsrError::InvalidGeometry(format!(
                "residual cube has {} frames but {} angles",
                shape.0,
                angles.len()
            )));
        }
        Ok(Self {
            residuals: Array3::from_elem(shape, f64::NAN),
            angles,
            center,
        })
    }

    pub fn frame_size(&self) -> FrameSize {
        let (_, height, width) = self.residuals.dim();
        FrameSize::from_width_height(width, height)
    }

    /// Derotate and collapse into a single combined residual frame
    pub fn combine(
        &self,
        interpolator: &dyn Interpolator,
        rule: CombinationRule,
    ) -> Result<Array2<f64>> {
        let derotated = derotate_cube(&self.residuals, &self.angles, self.center, interpolator)?;
        Ok(combine_stack(&derotated.view(), rule))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Trajectory;
    use approx::assert_relative_eq;

    #[test]
    fn test_zero_angle_is_identity() {
        let frame = Array2::from_shape_fn((7, 9), |(r, c)| (r * 9 + c) as f64);
        let size = FrameSize::of_array(&frame.view());
        let out = derotate_frame(&frame.view(), 0.0, size.center(), &Bilinear);
        assert_eq!(out, frame);
    }

    #[test]
    fn test_quarter_turn_moves_trajectory_point_home() {
        let size = FrameSize::from_width_height(11, 11);
        let center = size.center();
        let angles = ParallacticAngles::new(vec![0.0, 90.0]).unwrap();
        let candidate = Position::new(8.0, 5.0);
        let trajectory = Trajectory::compute(candidate, &angles, center, size).unwrap();

        // Put a point source where the candidate sits at t = 1
        let detector = trajectory.position(1).nearest_pixel(size).unwrap();
        let mut frame = Array2::<f64>::zeros((11, 11));
        frame[detector.index()] = 1.0;

        let derotated = derotate_frame(&frame.view(), 90.0, center, &Nearest);
        assert_eq!(derotated[[5, 8]], 1.0);
        assert_relative_eq!(derotated.iter().filter(|v| v.is_finite()).sum::<f64>(), 1.0);
    }

    #[test]
    fn test_rotated_corners_are_no_data() {
        let frame = Array2::<f64>::ones((9, 9));
        let out = derotate_frame(&frame.view(), 45.0, Position::new(4.0, 4.0), &Bilinear);
        assert!(out[[0, 0]].is_nan());
        assert_eq!(out[[4, 4]], 1.0);
    }

    #[test]
    fn test_residual_cube_combine() {
        let angles = ParallacticAngles::new(vec![0.0, 0.0, 0.0]).unwrap();
        let mut cube = ResidualCube::empty((3, 5, 5), angles, Position::new(2.0, 2.0)).unwrap();
        for t in 0..3 {
            cube.residuals.index_axis_mut(Axis(0), t).fill(t as f64);
        }
        cube.residuals[[2, 1, 1]] = f64::NAN;

        let combined = cube.combine(&InterpolationKind::Bilinear, CombinationRule::Mean).unwrap();
        assert_eq!(combined[[0, 0]], 1.0);
        assert_eq!(combined[[1, 1]], 0.5);

        let bad = ResidualCube::empty((2, 5, 5), ParallacticAngles::new(vec![0.0]).unwrap(), Position::new(2.0, 2.0));
        assert!(bad.is_err());
    }
}
