//! Exclusion masks around a candidate trajectory.
//!
//! An [`ExclusionMask`] marks, for every time step, the pixels within
//! `radius` of the candidate's detector position. Membership is computed on
//! demand from the trajectory, so a mask can never go stale: changing the
//! candidate or the radius means building a new mask.

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::cube::{FrameSize, Pixel};
use crate::geometry::Trajectory;

/// How much of the candidate signal is excluded from the predictor pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskMode {
    /// Disk of `masking_radius` around the trajectory at every time step
    #[default]
    Full,
    /// Nothing is excluded (null/no-planet baseline)
    None,
}

/// Time-resolved disk mask following a trajectory
#[derive(Debug, Clone)]
pub struct ExclusionMask<'a> {
    trajectory: Option<&'a Trajectory>,
    n_frames: usize,
    radius: f64,
    mode: MaskMode,
    frame_size: FrameSize,
}

impl<'a> ExclusionMask<'a> {
    pub fn new(
        trajectory: &'a Trajectory,
        radius: f64,
        mode: MaskMode,
        frame_size: FrameSize,
    ) -> Self {
        Self {
            trajectory: Some(trajectory),
            n_frames: trajectory.len(),
            radius: radius.max(0.0),
            mode,
            frame_size,
        }
    }

    /// Mask that excludes nothing, independent of any candidate
    pub fn empty(n_frames: usize, frame_size: FrameSize) -> Self {
        Self {
            trajectory: None,
            n_frames,
            radius: 0.0,
            mode: MaskMode::None,
            frame_size,
        }
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn mode(&self) -> MaskMode {
        self.mode
    }

    pub fn frame_size(&self) -> FrameSize {
        self.frame_size
    }

    fn covers_full_frame(&self) -> bool {
        self.radius >= self.frame_size.diagonal()
    }

    /// Whether `pixel` is considered contaminated at time step `t`
    pub fn is_excluded(&self, t: usize, pixel: Pixel) -> bool {
        let trajectory = match (self.mode, self.trajectory) {
            (MaskMode::Full, Some(trajectory)) => trajectory,
            _ => return false,
        };
        if self.radius <= 0.0 {
            false
        } else if self.covers_full_frame() {
            true
        } else {
            let center = trajectory.position(t);
            pixel.position().distance_squared(center) <= self.radius * self.radius
        }
    }

    /// Whether `pixel` is excluded at any time step
    pub fn excluded_anywhere(&self, pixel: Pixel) -> bool {
        (0..self.n_frames()).any(|t| self.is_excluded(t, pixel))
    }

    /// Whether `pixel` is excluded at any time step for which `window` is true
    pub fn excluded_within(&self, pixel: Pixel, window: &[bool]) -> bool {
        window
            .iter()
            .enumerate()
            .any(|(t, &active)| active && self.is_excluded(t, pixel))
    }

    /// Boolean mask of excluded pixels at time step `t`
    pub fn frame(&self, t: usize) -> Array2<bool> {
        Array2::from_shape_fn((self.frame_size.height, self.frame_size.width), |(r, c)| {
            self.is_excluded(t, Pixel::new(r, c))
        })
    }

    /// Boolean cube `(n_frames, height, width)` of excluded pixels
    pub fn to_cube(&self) -> Array3<bool> {
        Array3::from_shape_fn(
            (self.n_frames(), self.frame_size.height, self.frame_size.width),
            |(t, r, c)| self.is_excluded(t, Pixel::new(r, c)),
        )
    }

    /// Per-pixel flags for exclusion at one or more time steps
    ///
    /// Built from the trajectory disks, so the cost scales with the number of
    /// steps times the disk area rather than with the frame size.
    pub fn footprint(&self) -> Array2<bool> {
        let mut footprint = self.frame_size.filled(false);
        let trajectory = match (self.mode, self.trajectory) {
            (MaskMode::Full, Some(trajectory)) if self.radius > 0.0 => trajectory,
            _ => return footprint,
        };
        if self.covers_full_frame() {
            footprint.fill(true);
            return footprint;
        }

        let (height, width) = footprint.dim();
        let radius_sq = self.radius * self.radius;
        for center in trajectory.positions() {
            let row_lo = (center.y - self.radius).ceil().max(0.0);
            let col_lo = (center.x - self.radius).ceil().max(0.0);
            let row_hi = (center.y + self.radius).floor().min(height as f64 - 1.0);
            let col_hi = (center.x + self.radius).floor().min(width as f64 - 1.0);
            if row_hi < row_lo || col_hi < col_lo {
                continue;
            }
            for row in row_lo as usize..=row_hi as usize {
                for col in col_lo as usize..=col_hi as usize {
                    let pixel = Pixel::new(row, col);
                    if pixel.position().distance_squared(*center) <= radius_sq {
                        footprint[pixel.index()] = true;
                    }
                }
            }
        }
        footprint
    }

    /// Pixels excluded at one or more time steps (the "collection region")
    pub fn collection_region(&self) -> Vec<Pixel> {
        self.footprint()
            .indexed_iter()
            .filter(|(_, &excluded)| excluded)
            .map(|((r, c), _)| Pixel::new(r, c))
            .collect()
    }

    /// Per-time-step flags: whether `pixel` is usable (not excluded)
    pub fn usable_steps(&self, pixel: Pixel) -> Vec<bool> {
        (0..self.n_frames())
            .map(|t| !self.is_excluded(t, pixel))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::{ParallacticAngles, Position};

    fn trajectory(candidate: Position, size: FrameSize) -> Trajectory {
        let angles = ParallacticAngles::new((0..12).map(|i| i as f64 * 15.0).collect()).unwrap();
        Trajectory::compute(candidate, &angles, size.center(), size).unwrap()
    }

    #[test]
    fn test_zero_radius_excludes_nothing() {
        let size = FrameSize::from_width_height(15, 15);
        for candidate in [Position::new(7.0, 7.0), Position::new(11.0, 4.0), Position::new(2.5, 9.5)] {
            let traj = trajectory(candidate, size);
            let mask = ExclusionMask::new(&traj, 0.0, MaskMode::Full, size);
            for t in 0..mask.n_frames() {
                assert!(!mask.frame(t).iter().any(|&x| x));
            }
        }
    }

    #[test]
    fn test_diagonal_radius_excludes_everything() {
        let size = FrameSize::from_width_height(15, 11);
        let traj = trajectory(Position::new(12.0, 5.0), size);
        let mask = ExclusionMask::new(&traj, size.diagonal(), MaskMode::Full, size);
        for t in 0..mask.n_frames() {
            assert!(mask.frame(t).iter().all(|&x| x));
        }
        let huge = ExclusionMask::new(&traj, 1.0e6, MaskMode::Full, size);
        assert!(huge.to_cube().iter().all(|&x| x));
    }

    #[test]
    fn test_none_mode_is_empty() {
        let size = FrameSize::from_width_height(15, 15);
        let traj = trajectory(Position::new(10.0, 7.0), size);
        let mask = ExclusionMask::new(&traj, 4.0, MaskMode::None, size);
        assert!(!mask.to_cube().iter().any(|&x| x));
        assert!(mask.collection_region().is_empty());

        let empty = ExclusionMask::empty(12, size);
        assert_eq!(empty.n_frames(), 12);
        assert!(!empty.excluded_anywhere(Pixel::new(7, 10)));
        assert_eq!(empty.usable_steps(Pixel::new(7, 10)), vec![true; 12]);
    }

    #[test]
    fn test_disk_follows_trajectory() {
        let size = FrameSize::from_width_height(21, 21);
        let traj = trajectory(Position::new(16.0, 10.0), size);
        let mask = ExclusionMask::new(&traj, 2.0, MaskMode::Full, size);

        // At t = 0 the angle is zero, so the disk sits on the candidate itself
        assert!(mask.is_excluded(0, Pixel::new(10, 16)));
        assert!(mask.is_excluded(0, Pixel::new(10, 18)));
        assert!(!mask.is_excluded(0, Pixel::new(10, 19)));
        assert_eq!(mask.frame(0).iter().filter(|&&x| x).count(), 13);

        // The disk moves with the trajectory
        let later = traj.position(6).nearest_pixel(size).unwrap();
        assert!(mask.is_excluded(6, later));
        assert!(!mask.is_excluded(0, later));
        assert!(mask.excluded_anywhere(later));
    }

    #[test]
    fn test_usable_steps_and_window() {
        let size = FrameSize::from_width_height(21, 21);
        let traj = trajectory(Position::new(16.0, 10.0), size);
        let mask = ExclusionMask::new(&traj, 1.5, MaskMode::Full, size);
        let target = Pixel::new(10, 16);

        let usable = mask.usable_steps(target);
        assert!(!usable[0]);
        assert!(usable[11]);

        let only_late = (0..12).map(|t| t >= 6).collect::<Vec<_>>();
        assert!(!mask.excluded_within(target, &only_late));
        assert!(mask.excluded_within(target, &vec![true; 12]));
    }

    #[test]
    fn test_footprint_matches_per_pixel_scan() {
        let size = FrameSize::from_width_height(21, 17);
        for (candidate, radius) in [
            (Position::new(16.0, 8.0), 2.0),
            (Position::new(3.3, 12.7), 1.5),
            (Position::new(20.0, 0.0), 3.0),
            (Position::new(10.0, 8.0), 0.0),
        ] {
            let traj = trajectory(candidate, size);
            let mask = ExclusionMask::new(&traj, radius, MaskMode::Full, size);
            let footprint = mask.footprint();
            for pixel in size.pixels() {
                assert_eq!(footprint[pixel.index()], mask.excluded_anywhere(pixel), "{pixel:?}");
            }
        }

        let traj = trajectory(Position::new(16.0, 8.0), size);
        let off = ExclusionMask::new(&traj, 2.0, MaskMode::None, size);
        assert!(!off.footprint().iter().any(|&x| x));
        let full = ExclusionMask::new(&traj, size.diagonal(), MaskMode::Full, size);
        assert!(full.footprint().iter().all(|&x| x));
    }
}
