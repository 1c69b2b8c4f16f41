//! Synthetic data for tests and demonstrations.
//!
//! Toy cubes combine white noise, a detector-fixed systematic pattern whose
//! amplitude drifts from frame to frame (the structure half-sibling
//! regression learns from neighbouring pixels), and optional fake planets
//! that follow the parallactic rotation.

use ndarray::{Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::cube::{FrameSize, ImageCube, ParallacticAngles, Position};
use crate::error::{HsrError, Result};
use crate::geometry::rotate_position;

fn normal(mean: f64, std_dev: f64) -> Result<Normal<f64>> {
    Normal::new(mean, std_dev).map_err(|e| {
        HsrError::InvalidConfig(format!("invalid normal distribution ({mean}, {std_dev}): {e}"))
    })
}

/// Seeded `(n_frames, height, width)` cube of normally distributed values
///
/// # Panics
/// If `std_dev` is negative or not finite.
pub fn simple_normal_cube(
    shape: (usize, usize, usize),
    mean: f64,
    std_dev: f64,
    seed: u64,
) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal_dist = Normal::new(mean, std_dev).unwrap();
    Array3::from_shape_fn(shape, |_| normal_dist.sample(&mut rng))
}

/// Add a circular Gaussian of peak `amplitude` centered at (`center_x`,
/// `center_y`), truncated at 4 sigma
pub fn add_gaussian(image: &mut Array2<f64>, center_x: f64, center_y: f64, amplitude: f64, sigma: f64) {
    let (height, width) = image.dim();
    if width == 0 || height == 0 {
        return;
    }
    let x_lo = center_x - 4.0 * sigma;
    let x_hi = center_x + 4.0 * sigma;
    let y_lo = center_y - 4.0 * sigma;
    let y_hi = center_y + 4.0 * sigma;
    if x_hi < 0.0 || y_hi < 0.0 || x_lo > (width - 1) as f64 || y_lo > (height - 1) as f64 {
        return;
    }
    let x_min = x_lo.max(0.0).ceil() as usize;
    let x_max = x_hi.min(width as f64 - 1.0).floor() as usize;
    let y_min = y_lo.max(0.0).ceil() as usize;
    let y_max = y_hi.min(height as f64 - 1.0).floor() as usize;

    for y in y_min..=y_max {
        for x in x_min..=x_max {
            let dx = x as f64 - center_x;
            let dy = y as f64 - center_y;
            let exponent = -(dx * dx + dy * dy) / (2.0 * sigma * sigma);
            image[[y, x]] += amplitude * exponent.exp();
        }
    }
}

/// Centered, peak-normalised Gaussian PSF template of odd side length
pub fn gaussian_psf(side: usize, sigma: f64) -> Array2<f64> {
    let side = side | 1;
    let mut psf = Array2::<f64>::zeros((side, side));
    let c = (side / 2) as f64;
    add_gaussian(&mut psf, c, c, 1.0, sigma);
    psf
}

/// Evenly spaced parallactic angles from `start` to `end` degrees
pub fn linear_angles(n_frames: usize, start: f64, end: f64) -> Result<ParallacticAngles> {
    let step = if n_frames > 1 {
        (end - start) / (n_frames - 1) as f64
    } else {
        0.0
    };
    ParallacticAngles::new((0..n_frames).map(|t| start + step * t as f64).collect())
}

/// Sky-fixed point source added to a toy cube
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FakePlanet {
    /// Position in the derotated frame
    pub position: Position,
    /// Peak value of the Gaussian PSF
    pub amplitude: f64,
}

/// Parameters of a toy observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToyObservation {
    pub n_frames: usize,
    pub frame_size: FrameSize,
    /// Total field rotation in degrees, starting from zero
    pub field_rotation: f64,
    /// Standard deviation of the white noise
    pub noise_std: f64,
    /// Standard deviation of the per-frame systematic amplitude
    pub systematic_std: f64,
    /// PSF standard deviation in pixels
    pub psf_sigma: f64,
    pub seed: u64,
}

impl Default for ToyObservation {
    fn default() -> Self {
        Self {
            n_frames: 50,
            frame_size: FrameSize::from_width_height(21, 21),
            field_rotation: 90.0,
            noise_std: 1.0,
            systematic_std: 0.0,
            psf_sigma: 1.0,
            seed: 42,
        }
    }
}

/// Detector-fixed pattern shared by all frames: a stellar halo with a ring
fn systematic_pattern(size: FrameSize) -> Array2<f64> {
    let center = size.center();
    let scale = size.width.min(size.height) as f64 / 4.0;
    Array2::from_shape_fn((size.height, size.width), |(r, c)| {
        let d = Position::new(c as f64, r as f64).distance(center);
        (-d / scale).exp() + 0.5 * (-(d - scale).powi(2) / 2.0).exp()
    })
}

/// Generate a toy cube and its noise-free planet signal
///
/// # Errors
/// `InvalidConfig` for negative noise levels or an empty observation.
pub fn make_toy_cube(
    observation: &ToyObservation,
    planets: &[FakePlanet],
) -> Result<(ImageCube, Array3<f64>)> {
    let size = observation.frame_size;
    if observation.n_frames == 0 || size.pixel_count() == 0 {
        return Err(HsrError::InvalidConfig(
            "toy observation needs at least one frame and pixel".to_string(),
        ));
    }
    let white = normal(0.0, observation.noise_std)?;
    let drift = normal(0.0, observation.systematic_std)?;
    let angles = linear_angles(observation.n_frames, 0.0, observation.field_rotation)?;
    let center = size.center();

    let mut rng = StdRng::seed_from_u64(observation.seed);
    let pattern = systematic_pattern(size);
    let mut frames = Array3::<f64>::zeros((observation.n_frames, size.height, size.width));
    for mut frame in frames.axis_iter_mut(Axis(0)) {
        let amplitude = 1.0 + drift.sample(&mut rng);
        frame.zip_mut_with(&pattern, |v, &p| *v = amplitude * p + white.sample(&mut rng));
    }

    let mut signal = Array3::<f64>::zeros(frames.dim());
    for (t, mut frame) in signal.axis_iter_mut(Axis(0)).enumerate() {
        let mut planar = frame.to_owned();
        for planet in planets {
            let detector = rotate_position(planet.position, center, -angles.get(t));
            add_gaussian(&mut planar, detector.x, detector.y, planet.amplitude, observation.psf_sigma);
        }
        frame.assign(&planar);
    }
    frames += &signal;

    Ok((ImageCube::new(frames, angles)?, signal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_simple_normal_reproducible() {
        let a = simple_normal_cube((2, 8, 8), 0.0, 1.0, 3);
        let b = simple_normal_cube((2, 8, 8), 0.0, 1.0, 3);
        assert_eq!(a, b);
        let cube = simple_normal_cube((4, 8, 8), 10.0, 0.5, 3);
        assert_eq!(cube.dim(), (4, 8, 8));
        let mean = cube.mean().unwrap();
        assert!((mean - 10.0).abs() < 0.2);
    }

    #[test]
    fn test_gaussian_psf() {
        let psf = gaussian_psf(8, 1.0);
        assert_eq!(psf.dim(), (9, 9));
        assert_eq!(psf[[4, 4]], 1.0);
        assert_relative_eq!(psf[[4, 5]], (-0.5f64).exp(), epsilon = 1e-12);
        assert!(psf[[0, 0]] < 1e-6);
    }

    #[test]
    fn test_add_gaussian_clips_at_edges() {
        let mut image = Array2::<f64>::zeros((5, 5));
        add_gaussian(&mut image, 0.0, 0.0, 2.0, 1.0);
        assert_eq!(image[[0, 0]], 2.0);
        add_gaussian(&mut image, -50.0, 2.0, 2.0, 1.0);
        assert_eq!(image.sum(), {
            let mut reference = Array2::<f64>::zeros((5, 5));
            add_gaussian(&mut reference, 0.0, 0.0, 2.0, 1.0);
            reference.sum()
        });
    }

    #[test]
    fn test_linear_angles() {
        let angles = linear_angles(5, 0.0, 40.0).unwrap();
        assert_eq!(angles.as_slice(), &[0.0, 10.0, 20.0, 30.0, 40.0]);
        assert!(linear_angles(0, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_toy_cube_planet_follows_rotation() {
        let observation = ToyObservation {
            n_frames: 3,
            noise_std: 0.0,
            ..Default::default()
        };
        let planet = FakePlanet {
            position: Position::new(16.0, 10.0),
            amplitude: 5.0,
        };
        let (cube, signal) = make_toy_cube(&observation, &[planet]).unwrap();
        assert_eq!(cube.n_frames(), 3);
        // Frame 0 has angle zero, the last frame is rotated by 90 degrees
        assert_relative_eq!(signal[[0, 10, 16]], 5.0, epsilon = 1e-12);
        assert_relative_eq!(signal[[2, 4, 10]], 5.0, epsilon = 1e-9);
        assert!(signal[[2, 10, 16]] < 1e-6);
    }
}
