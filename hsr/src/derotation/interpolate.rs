//! Sub-pixel sampling kernels.
//!
//! Every kernel is separable and evaluated directly on the pixel grid. A
//! sample whose kernel support touches a NaN pixel is NaN; taps falling off
//! the frame read the caller-provided `outside` value (NaN for derotation,
//! zero when placing a PSF template).

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::cube::Position;

/// Strategy for reading a frame at a continuous position
pub trait Interpolator: Send + Sync {
    fn sample(&self, frame: &ArrayView2<f64>, position: Position, outside: f64) -> f64;
}

fn read(frame: &ArrayView2<f64>, row: isize, col: isize, outside: f64) -> f64 {
    let (height, width) = frame.dim();
    if row < 0 || col < 0 || row as usize >= height || col as usize >= width {
        outside
    } else {
        frame[[row as usize, col as usize]]
    }
}

/// Apply a separable kernel with half-width `support` around `position`
///
/// Taps with zero weight are skipped so that an exact grid position never
/// reads its neighbours.
fn separable<K: Fn(f64) -> f64>(
    frame: &ArrayView2<f64>,
    position: Position,
    outside: f64,
    support: isize,
    kernel: K,
) -> f64 {
    if !position.x.is_finite() || !position.y.is_finite() {
        return f64::NAN;
    }
    let base_col = position.x.floor() as isize;
    let base_row = position.y.floor() as isize;

    let mut total = 0.0;
    for dr in (1 - support)..=support {
        let row = base_row + dr;
        let wy = kernel(position.y - row as f64);
        if wy == 0.0 {
            continue;
        }
        for dc in (1 - support)..=support {
            let col = base_col + dc;
            let wx = kernel(position.x - col as f64);
            if wx == 0.0 {
                continue;
            }
            total += wy * wx * read(frame, row, col, outside);
        }
    }
    total
}

/// Value of the nearest pixel
#[derive(Debug, Clone, Copy, Default)]
pub struct Nearest;

impl Interpolator for Nearest {
    fn sample(&self, frame: &ArrayView2<f64>, position: Position, outside: f64) -> f64 {
        if !position.x.is_finite() || !position.y.is_finite() {
            return f64::NAN;
        }
        read(
            frame,
            position.y.round() as isize,
            position.x.round() as isize,
            outside,
        )
    }
}

/// Bilinear interpolation between the four surrounding pixels
#[derive(Debug, Clone, Copy, Default)]
pub struct Bilinear;

impl Interpolator for Bilinear {
    fn sample(&self, frame: &ArrayView2<f64>, position: Position, outside: f64) -> f64 {
        separable(frame, position, outside, 1, |d| (1.0 - d.abs()).max(0.0))
    }
}

/// Keys cubic convolution with a = -0.5 over a 4x4 neighbourhood
#[derive(Debug, Clone, Copy, Default)]
pub struct Bicubic;

const KEYS_A: f64 = -0.5;

fn keys_kernel(d: f64) -> f64 {
    let d = d.abs();
    if d <= 1.0 {
        (KEYS_A + 2.0) * d.powi(3) - (KEYS_A + 3.0) * d * d + 1.0
    } else if d < 2.0 {
        KEYS_A * d.powi(3) - 5.0 * KEYS_A * d * d + 8.0 * KEYS_A * d - 4.0 * KEYS_A
    } else {
        0.0
    }
}

impl Interpolator for Bicubic {
    fn sample(&self, frame: &ArrayView2<f64>, position: Position, outside: f64) -> f64 {
        separable(frame, position, outside, 2, keys_kernel)
    }
}

/// Configurable choice of interpolation kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationKind {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
}

impl Interpolator for InterpolationKind {
    fn sample(&self, frame: &ArrayView2<f64>, position: Position, outside: f64) -> f64 {
        match self {
            InterpolationKind::Nearest => Nearest.sample(frame, position, outside),
            InterpolationKind::Bilinear => Bilinear.sample(frame, position, outside),
            InterpolationKind::Bicubic => Bicubic.sample(frame, position, outside),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn ramp() -> Array2<f64> {
        Array2::from_shape_fn((6, 6), |(r, c)| 2.0 * c as f64 + 3.0 * r as f64)
    }

    #[test]
    fn test_grid_positions_are_exact() {
        let frame = ramp();
        for kind in [
            InterpolationKind::Nearest,
            InterpolationKind::Bilinear,
            InterpolationKind::Bicubic,
        ] {
            for (r, c) in [(0usize, 0usize), (2, 3), (5, 5)] {
                let value = kind.sample(&frame.view(), Position::new(c as f64, r as f64), f64::NAN);
                assert_eq!(value, frame[[r, c]], "{kind:?} at ({r}, {c})");
            }
        }
    }

    #[test]
    fn test_linear_surfaces_are_reproduced() {
        let frame = ramp();
        let position = Position::new(2.25, 1.5);
        let expected = 2.0 * 2.25 + 3.0 * 1.5;
        assert_relative_eq!(Bilinear.sample(&frame.view(), position, f64::NAN), expected, epsilon = 1e-12);
        assert_relative_eq!(Bicubic.sample(&frame.view(), position, f64::NAN), expected, epsilon = 1e-12);
        assert_eq!(Nearest.sample(&frame.view(), position, f64::NAN), frame[[2, 2]]);
    }

    #[test]
    fn test_nan_propagates() {
        let mut frame = ramp();
        frame[[2, 2]] = f64::NAN;
        assert!(Bilinear.sample(&frame.view(), Position::new(2.5, 2.5), 0.0).is_nan());
        assert!(Bicubic.sample(&frame.view(), Position::new(3.5, 3.5), 0.0).is_nan());
        // Far enough away the NaN is outside the kernel support
        assert!(!Bilinear.sample(&frame.view(), Position::new(3.5, 3.5), 0.0).is_nan());
    }

    #[test]
    fn test_outside_value() {
        let frame = ramp();
        let position = Position::new(-0.5, 1.0);
        assert!(Bilinear.sample(&frame.view(), position, f64::NAN).is_nan());
        let partial = Bilinear.sample(&frame.view(), position, 0.0);
        assert_relative_eq!(partial, 0.5 * frame[[1, 0]], epsilon = 1e-12);
        assert_eq!(Nearest.sample(&frame.view(), Position::new(9.0, 0.0), -1.0), -1.0);
    }

    #[test]
    fn test_keys_kernel_partition_of_unity() {
        for offset in [0.0, 0.1, 0.37, 0.5, 0.99] {
            let sum: f64 = (-1..=2).map(|k| keys_kernel(offset - k as f64)).sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-12);
        }
    }
}
