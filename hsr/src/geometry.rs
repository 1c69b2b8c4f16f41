//! Parallactic geometry: where a sky-fixed point lands on the detector.
//!
//! During pupil-tracking observations the field rotates about the frame
//! center by the parallactic angle. A candidate position is expressed in the
//! derotated (sky-aligned) frame; its [`Trajectory`] is the sequence of
//! detector positions obtained by rotating it by `-angle[t]` for every frame.
//! Derotation in [`crate::derotation`] applies the exact inverse mapping.

use serde::{Deserialize, Serialize};

use crate::cube::{FrameSize, ParallacticAngles, Pixel, Position};
use crate::error::{HsrError, Result};

/// Rotate `position` counter-clockwise about `center` by `degrees`
///
/// Counter-clockwise refers to the (x, y) plane with y pointing along rows.
pub fn rotate_position(position: Position, center: Position, degrees: f64) -> Position {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let dx = position.x - center.x;
    let dy = position.y - center.y;
    Position::new(
        center.x + dx * cos - dy * sin,
        center.y + dx * sin + dy * cos,
    )
}

/// Per-frame detector positions of a sky-fixed candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    candidate: Position,
    center: Position,
    angles: Vec<f64>,
    positions: Vec<Position>,
}

impl Trajectory {
    /// Compute the trajectory of `candidate` under the given angle series
    ///
    /// # Errors
    /// `InvalidGeometry` if the angle series is empty or the candidate is
    /// outside the frame at every time step.
    pub fn compute(
        candidate: Position,
        angles: &ParallacticAngles,
        center: Position,
        frame_size: FrameSize,
    ) -> Result<Self> {
        if angles.is_empty() {
            return Err(HsrError::InvalidGeometry(
                "cannot compute a trajectory from an empty angle series".to_string(),
            ));
        }
        if !candidate.x.is_finite() || !candidate.y.is_finite() {
            return Err(HsrError::InvalidGeometry(format!(
                "candidate position {candidate} is not finite"
            )));
        }

        let positions: Vec<Position> = angles
            .as_slice()
            .iter()
            .map(|&angle| rotate_position(candidate, center, -angle))
            .collect();

        if !positions.iter().any(|p| frame_size.contains(*p)) {
            return Err(HsrError::InvalidGeometry(format!(
                "candidate {candidate} lies outside the {frame_size} frame at every time step"
            )));
        }

        Ok(Self {
            candidate,
            center,
            angles: angles.as_slice().to_vec(),
            positions,
        })
    }

    pub fn candidate(&self) -> Position {
        self.candidate
    }

    pub fn center(&self) -> Position {
        self.center
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Detector position at time step `t`
    pub fn position(&self, t: usize) -> Position {
        self.positions[t]
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Map the detector position at `t` back into the sky frame
    pub fn sky_position(&self, t: usize) -> Position {
        rotate_position(self.positions[t], self.center, self.angles[t])
    }

    /// Separation of the candidate from the rotation center
    pub fn separation(&self) -> f64 {
        self.candidate.distance(self.center)
    }
}

/// Length of the path a planet travels while crossing the center of `pixel`
///
/// Between 1 and sqrt(2) depending on the polar angle of the pixel.
pub fn effective_pixel_width(pixel: Pixel, center: Position) -> f64 {
    let phi = pixel
        .position()
        .polar_angle(center)
        .rem_euclid(std::f64::consts::FRAC_PI_2);
    let (sin, cos) = phi.sin_cos();
    let width = (1.0 / cos).min(1.0 / sin);
    if width.is_finite() {
        width
    } else {
        1.0
    }
}

/// Estimate how many frames before and after `signal_time` a planet passing
/// through `pixel` still overlaps it, given the PSF diameter in pixels
///
/// Returns `(frames_before, frames_after)`, each padded by 20%. When the PSF
/// is wider than the circle the pixel moves on, the whole sequence counts.
///
/// # Errors
/// `InvalidGeometry` if the angle series is not monotonic or `signal_time`
/// is out of range.
pub fn expected_signal_length(
    pixel: Pixel,
    signal_time: usize,
    center: Position,
    angles: &ParallacticAngles,
    psf_diameter: f64,
) -> Result<(usize, usize)> {
    let n_frames = angles.len();
    if signal_time >= n_frames {
        return Err(HsrError::InvalidGeometry(format!(
            "signal time {signal_time} is outside the {n_frames}-frame sequence"
        )));
    }
    if !angles.is_monotonic() {
        return Err(HsrError::InvalidGeometry(
            "parallactic angles must be monotonic to estimate signal lengths".to_string(),
        ));
    }

    let radius = pixel.position().distance(center);
    let side_length = effective_pixel_width(pixel, center) + psf_diameter;
    if side_length > 2.0 * radius {
        return Ok((signal_time, n_frames - signal_time));
    }

    let gamma = (1.0 - side_length * side_length / (2.0 * radius * radius))
        .acos()
        .to_degrees();
    let parang = angles.as_slice();
    let value_1 = parang[signal_time] - gamma / 2.0;
    let value_2 = parang[signal_time] + gamma / 2.0;

    let ascending = parang[n_frames - 1] >= parang[0];
    let (start, end) = if ascending {
        (
            parang.partition_point(|&a| a < value_1),
            parang.partition_point(|&a| a <= value_2),
        )
    } else {
        (
            parang.partition_point(|&a| a > value_2),
            parang.partition_point(|&a| a >= value_1),
        )
    };

    let before = (1.2 * signal_time.saturating_sub(start) as f64) as usize;
    let after = (1.2 * end.saturating_sub(signal_time) as f64) as usize;
    Ok((before.min(signal_time), after.min(n_frames - signal_time)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn angles(values: &[f64]) -> ParallacticAngles {
        ParallacticAngles::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_rotate_quarter_turn() {
        let center = Position::new(10.0, 10.0);
        let rotated = rotate_position(Position::new(15.0, 10.0), center, 90.0);
        assert_relative_eq!(rotated.x, 10.0, epsilon = 1e-12);
        assert_relative_eq!(rotated.y, 15.0, epsilon = 1e-12);
    }

    #[test]
    fn test_trajectory_round_trip() {
        let size = FrameSize::from_width_height(41, 41);
        let center = size.center();
        let series = angles(&[-37.3, -12.0, 0.0, 4.5, 88.8, 179.0, 301.2]);
        let candidate = Position::new(27.3, 14.9);

        let trajectory = Trajectory::compute(candidate, &series, center, size).unwrap();
        for t in 0..trajectory.len() {
            let back = trajectory.sky_position(t);
            assert_relative_eq!(back.x, candidate.x, epsilon = 1e-9);
            assert_relative_eq!(back.y, candidate.y, epsilon = 1e-9);
            assert_relative_eq!(
                trajectory.position(t).distance(center),
                candidate.distance(center),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_trajectory_center_is_fixed() {
        let size = FrameSize::from_width_height(21, 21);
        let center = size.center();
        let trajectory =
            Trajectory::compute(center, &angles(&[0.0, 30.0, 60.0]), center, size).unwrap();
        assert!(trajectory.positions().iter().all(|p| *p == center));
        assert_eq!(trajectory.separation(), 0.0);
    }

    #[test]
    fn test_trajectory_errors() {
        let size = FrameSize::from_width_height(21, 21);
        let center = size.center();
        let err = Trajectory::compute(Position::new(500.0, 500.0), &angles(&[0.0, 10.0]), center, size);
        assert!(matches!(err, Err(HsrError::InvalidGeometry(_))));

        let nan = Trajectory::compute(Position::new(f64::NAN, 1.0), &angles(&[0.0]), center, size);
        assert!(nan.is_err());
    }

    #[test]
    fn test_trajectory_partially_outside_is_valid() {
        // A corner position rotates off the frame for part of the sequence
        let size = FrameSize::from_width_height(21, 21);
        let center = size.center();
        let trajectory =
            Trajectory::compute(Position::new(0.0, 0.0), &angles(&[0.0, 45.0]), center, size)
                .unwrap();
        assert!(size.contains(trajectory.position(0)));
        assert!(!size.contains(trajectory.position(1)));
    }

    #[test]
    fn test_effective_pixel_width_range() {
        let center = Position::new(0.0, 0.0);
        assert_relative_eq!(effective_pixel_width(Pixel::new(0, 5), center), 1.0);
        assert_relative_eq!(
            effective_pixel_width(Pixel::new(5, 5), center),
            std::f64::consts::SQRT_2,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_expected_signal_length() {
        let series = angles(&(0..100).map(|i| i as f64).collect::<Vec<_>>());
        let center = Position::new(20.0, 20.0);

        // Far from the center a small PSF covers only a few degrees
        let (before, after) =
            expected_signal_length(Pixel::new(20, 40), 50, center, &series, 2.0).unwrap();
        assert!(before > 0 && before < 20);
        assert!(after > 0 && after < 20);

        // Close to the center the PSF covers the whole sequence
        let (before, after) =
            expected_signal_length(Pixel::new(20, 21), 50, center, &series, 4.0).unwrap();
        assert_eq!((before, after), (50, 50));

        let unsorted = angles(&[0.0, 3.0, 1.0]);
        assert!(expected_signal_length(Pixel::new(0, 0), 1, center, &unsorted, 1.0).is_err());
    }
}
