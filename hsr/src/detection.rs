//! Small-sample signal-to-noise statistic for combined residual frames.
//!
//! Implements the aperture photometry test of Mawet et al. (2014), "Fundamental
//! limitations of high contrast imaging set by small sample statistics",
//! ApJ 792, 97. The flux in a signal aperture is compared against reference
//! apertures placed at the same separation from the star:
//!
//! ```text
//! signal = F_sig - mean(F_ref)
//! noise  = std(F_ref, ddof = 1) * sqrt(1 + 1 / n)
//! snr    = signal / noise
//! ```
//!
//! The false positive fraction follows from a Student-t distribution with
//! `n - 1` degrees of freedom, where `n` is the number of reference apertures
//! that contributed a flux.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::f64::consts::PI;
use thiserror::Error;

use crate::cube::{FrameSize, Pixel, Position};
use crate::pipeline::PixelStatus;

/// Reasons a statistic cannot be computed at a position
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidSnr {
    #[error("signal aperture has no data")]
    SignalNoData,

    #[error("only {available} usable reference apertures")]
    TooFewReferences { available: usize },

    #[error("reference apertures have zero dispersion")]
    ZeroNoise,
}

/// Flux of the pixels whose centers lie within `radius` of `position`
///
/// NaN pixels are not counted as zero: the sum over the finite pixels is
/// scaled up by `total / finite`. Returns `None` when no pixel center falls
/// inside the disk or when more than half of those pixels are NaN.
pub fn aperture_flux(frame: &ArrayView2<f64>, position: Position, radius: f64) -> Option<f64> {
    let (height, width) = frame.dim();
    let row_min = (position.y - radius).ceil().max(0.0) as usize;
    let col_min = (position.x - radius).ceil().max(0.0) as usize;
    let row_max = (position.y + radius).floor();
    let col_max = (position.x + radius).floor();
    if row_max < 0.0 || col_max < 0.0 {
        return None;
    }
    let row_max = (row_max as usize).min(height.saturating_sub(1));
    let col_max = (col_max as usize).min(width.saturating_sub(1));

    let radius_sq = radius * radius;
    let mut sum = 0.0;
    let mut total = 0usize;
    let mut missing = 0usize;
    for row in row_min..=row_max {
        for col in col_min..=col_max {
            let pixel = Pixel::new(row, col);
            if pixel.position().distance_squared(position) > radius_sq {
                continue;
            }
            total += 1;
            let value = frame[[row, col]];
            if value.is_finite() {
                sum += value;
            } else {
                missing += 1;
            }
        }
    }

    if total == 0 || 2 * missing > total {
        None
    } else {
        Some(sum * total as f64 / (total - missing) as f64)
    }
}

/// Centers of the reference apertures for a signal aperture at `position`
///
/// `n = floor(pi * r / a)` slots are spaced evenly on the ring through
/// `position`; the signal slot and `ignore_neighbors` slots on either side
/// are dropped. Positions closer than `2a` to the star use the ring at `2a`
/// and keep every slot, since the signal aperture does not lie on that ring.
pub fn reference_positions(
    center: Position,
    position: Position,
    aperture_radius: f64,
    ignore_neighbors: usize,
) -> Vec<Position> {
    let separation = position.distance(center);
    let on_ring = separation >= 2.0 * aperture_radius;
    let ring_radius = if on_ring {
        separation
    } else {
        2.0 * aperture_radius
    };
    let phase = if separation > 0.0 {
        position.polar_angle(center)
    } else {
        0.0
    };

    let n_slots = (PI * ring_radius / aperture_radius).floor() as usize;
    (0..n_slots)
        .filter(|&k| {
            if !on_ring {
                return true;
            }
            let distance = k.min(n_slots - k);
            distance > ignore_neighbors
        })
        .map(|k| {
            let angle = phase + 2.0 * PI * k as f64 / n_slots as f64;
            Position::new(
                center.x + ring_radius * angle.cos(),
                center.y + ring_radius * angle.sin(),
            )
        })
        .collect()
}

/// Figures of merit at one position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnrMeasurement {
    pub position: Position,
    /// Integrated flux in the signal aperture
    pub signal_flux: f64,
    /// Signal flux minus the mean reference flux
    pub signal: f64,
    /// Small-sample corrected reference dispersion
    pub noise: f64,
    pub snr: f64,
    /// Two-sided false positive fraction
    pub fpf: f64,
    /// One-sided false positive fraction, eq. (10) of Mawet et al.
    pub fpf_one_sided: f64,
    pub n_reference: usize,
}

/// Compute the Mawet SNR and false positive fraction at `position`
pub fn compute_snr(
    frame: &ArrayView2<f64>,
    position: Position,
    center: Position,
    aperture_radius: f64,
    ignore_neighbors: usize,
) -> Result<SnrMeasurement, InvalidSnr> {
    let signal_flux =
        aperture_flux(frame, position, aperture_radius).ok_or(InvalidSnr::SignalNoData)?;

    let reference: Vec<f64> = reference_positions(center, position, aperture_radius, ignore_neighbors)
        .into_iter()
        .filter_map(|p| aperture_flux(frame, p, aperture_radius))
        .collect();
    let n = reference.len();
    if n < 2 {
        return Err(InvalidSnr::TooFewReferences { available: n });
    }

    let mean = reference.iter().sum::<f64>() / n as f64;
    let variance = reference.iter().map(|f| (f - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let noise = variance.sqrt() * (1.0 + 1.0 / n as f64).sqrt();
    if !(noise > 0.0) {
        return Err(InvalidSnr::ZeroNoise);
    }

    let signal = signal_flux - mean;
    let snr = signal / noise;
    let (fpf, fpf_one_sided) = false_positive_fractions(snr, n - 1);

    Ok(SnrMeasurement {
        position,
        signal_flux,
        signal,
        noise,
        snr,
        fpf,
        fpf_one_sided,
        n_reference: n,
    })
}

/// Two-sided and one-sided tail probabilities of a Student-t with `dof`
/// degrees of freedom
pub fn false_positive_fractions(snr: f64, dof: usize) -> (f64, f64) {
    match StudentsT::new(0.0, 1.0, dof as f64) {
        Ok(dist) => ((2.0 * dist.sf(snr.abs())).min(1.0), dist.sf(snr)),
        Err(_) => (f64::NAN, f64::NAN),
    }
}

/// Quantity maximised by [`compute_optimized_snr`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationTarget {
    #[default]
    SignalFlux,
    Signal,
    Snr,
}

impl OptimizationTarget {
    fn score(&self, m: &SnrMeasurement) -> f64 {
        match self {
            OptimizationTarget::SignalFlux => m.signal_flux,
            OptimizationTarget::Signal => m.signal,
            OptimizationTarget::Snr => m.snr,
        }
    }
}

/// Result of a local position search
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizedSnr {
    pub old_position: Position,
    pub new_position: Position,
    pub measurement: SnrMeasurement,
}

/// Settings for [`compute_optimized_snr`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSearch {
    pub target: OptimizationTarget,
    /// Largest allowed offset from the starting position in pixels
    pub max_distance: f64,
    /// Grid points per axis
    pub grid_size: usize,
}

impl Default for PositionSearch {
    fn default() -> Self {
        Self {
            target: OptimizationTarget::SignalFlux,
            max_distance: 1.0,
            grid_size: 16,
        }
    }
}

/// Brute-force search near `position` for the best-scoring aperture
/// placement, then report the figures of merit there
///
/// Absorbs small astrometric offsets between the hypothesised and the true
/// planet position. The starting position is always a candidate.
pub fn compute_optimized_snr(
    frame: &ArrayView2<f64>,
    position: Position,
    center: Position,
    aperture_radius: f64,
    ignore_neighbors: usize,
    search: &PositionSearch,
) -> Result<OptimizedSnr, InvalidSnr> {
    let steps = search.grid_size.max(1);
    let offsets: Vec<f64> = if steps == 1 {
        vec![0.0]
    } else {
        (0..steps)
            .map(|i| -search.max_distance + 2.0 * search.max_distance * i as f64 / (steps - 1) as f64)
            .collect()
    };

    let mut best = compute_snr(frame, position, center, aperture_radius, ignore_neighbors).ok();
    let mut last_error = None;
    for &dy in &offsets {
        for &dx in &offsets {
            if dx.hypot(dy) > search.max_distance {
                continue;
            }
            let candidate = Position::new(position.x + dx, position.y + dy);
            match compute_snr(frame, candidate, center, aperture_radius, ignore_neighbors) {
                Ok(m) => {
                    let better = best
                        .as_ref()
                        .map(|b| search.target.score(&m) > search.target.score(b))
                        .unwrap_or(true);
                    if better {
                        best = Some(m);
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }
    }

    best.map(|measurement| OptimizedSnr {
        old_position: position,
        new_position: measurement.position,
        measurement,
    })
    .ok_or_else(|| last_error.unwrap_or(InvalidSnr::SignalNoData))
}

/// Per-position SNR, false positive fraction and validity marker
///
/// `coefficient` holds the median fitted signal coefficient of each
/// candidate when the forward model is used, and NaN otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionMap {
    pub snr: Array2<f64>,
    pub fpf: Array2<f64>,
    pub coefficient: Array2<f64>,
    pub status: Array2<PixelStatus>,
}

impl DetectionMap {
    /// Map with every position unevaluated
    pub fn new(frame_size: FrameSize) -> Self {
        Self {
            snr: frame_size.filled(f64::NAN),
            fpf: frame_size.filled(f64::NAN),
            coefficient: frame_size.filled(f64::NAN),
            status: frame_size.filled(PixelStatus::NotEvaluated),
        }
    }

    pub fn frame_size(&self) -> FrameSize {
        FrameSize::of_array(&self.snr.view())
    }

    pub fn record(&mut self, pixel: Pixel, measurement: &SnrMeasurement) {
        self.snr[pixel.index()] = measurement.snr;
        self.fpf[pixel.index()] = measurement.fpf;
        self.status[pixel.index()] = PixelStatus::Valid;
    }

    /// Store the signal coefficient of a candidate; `None` leaves NaN
    pub fn record_coefficient(&mut self, pixel: Pixel, coefficient: Option<f64>) {
        self.coefficient[pixel.index()] = coefficient.unwrap_or(f64::NAN);
    }

    /// Mark a position as having no valid statistic; values stay NaN
    pub fn mark(&mut self, pixel: Pixel, status: PixelStatus) {
        self.snr[pixel.index()] = f64::NAN;
        self.fpf[pixel.index()] = f64::NAN;
        self.coefficient[pixel.index()] = f64::NAN;
        self.status[pixel.index()] = status;
    }

    pub fn get(&self, pixel: Pixel) -> Option<f64> {
        (self.status[pixel.index()] == PixelStatus::Valid).then(|| self.snr[pixel.index()])
    }

    pub fn count(&self, status: PixelStatus) -> usize {
        self.status.iter().filter(|&&s| s == status).count()
    }

    /// Position and value of the largest valid SNR
    pub fn peak(&self) -> Option<(Pixel, f64)> {
        self.snr
            .indexed_iter()
            .filter(|((r, c), _)| self.status[[*r, *c]] == PixelStatus::Valid)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|((r, c), &v)| (Pixel::new(r, c), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn noise_frame(size: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((size, size), |_| normal.sample(&mut rng))
    }

    #[test]
    fn test_aperture_flux() {
        let frame = Array2::<f64>::ones((9, 9));
        let flux = aperture_flux(&frame.view(), Position::new(4.0, 4.0), 1.0).unwrap();
        assert_eq!(flux, 5.0);
        let flux = aperture_flux(&frame.view(), Position::new(4.0, 4.0), 1.5).unwrap();
        assert_eq!(flux, 9.0);
        // Off the frame
        assert!(aperture_flux(&frame.view(), Position::new(-5.0, 4.0), 1.0).is_none());
        // Clipped at the edge
        assert_eq!(aperture_flux(&frame.view(), Position::new(0.0, 0.0), 1.0), Some(3.0));
    }

    #[test]
    fn test_aperture_flux_nan_threshold() {
        let mut frame = Array2::<f64>::ones((9, 9));
        frame[[4, 4]] = f64::NAN;
        frame[[4, 5]] = f64::NAN;
        assert_eq!(aperture_flux(&frame.view(), Position::new(4.0, 4.0), 1.0), Some(5.0));
        frame[[3, 4]] = f64::NAN;
        assert!(aperture_flux(&frame.view(), Position::new(4.0, 4.0), 1.0).is_none());
    }

    #[test]
    fn test_partial_aperture_not_biased_low() {
        let mut frame = Array2::<f64>::from_elem((9, 9), 10.0);
        let full = aperture_flux(&frame.view(), Position::new(4.0, 4.0), 1.0).unwrap();
        assert_eq!(full, 50.0);
        frame[[4, 4]] = f64::NAN;
        frame[[3, 4]] = f64::NAN;
        let partial = aperture_flux(&frame.view(), Position::new(4.0, 4.0), 1.0).unwrap();
        assert_relative_eq!(partial, full, epsilon = 1e-12);
    }

    #[test]
    fn test_reference_positions_count() {
        let center = Position::new(20.0, 20.0);
        let position = Position::new(26.0, 20.0);
        // floor(pi * 6 / 1) = 18 slots, minus the signal slot
        let refs = reference_positions(center, position, 1.0, 0);
        assert_eq!(refs.len(), 17);
        for p in &refs {
            assert_relative_eq!(p.distance(center), 6.0, epsilon = 1e-9);
            assert!(p.distance(position) > 1.0);
        }
        assert_eq!(reference_positions(center, position, 1.0, 2).len(), 13);
    }

    #[test]
    fn test_reference_positions_near_center() {
        let center = Position::new(10.0, 10.0);
        let refs = reference_positions(center, center, 1.0, 3);
        // Ring at 2a keeps all floor(2 pi) = 6 slots
        assert_eq!(refs.len(), 6);
        assert!(refs.iter().all(|p| (p.distance(center) - 2.0).abs() < 1e-9));
    }

    #[test]
    fn test_bright_source_is_significant() {
        let mut frame = noise_frame(41, 7);
        let center = Position::new(20.0, 20.0);
        let position = Position::new(30.0, 20.0);
        frame[[20, 30]] += 50.0;

        let m = compute_snr(&frame.view(), position, center, 1.0, 0).unwrap();
        assert!(m.snr > 5.0);
        assert!(m.fpf < 1e-3);
        assert!(m.fpf_one_sided < m.fpf);
        assert_eq!(m.n_reference, 30);
    }

    #[test]
    fn test_noise_only_snr_is_small() {
        let frame = noise_frame(41, 8);
        let m = compute_snr(&frame.view(), Position::new(28.0, 20.0), Position::new(20.0, 20.0), 1.0, 0).unwrap();
        assert!(m.snr.abs() < 5.0);
        assert!(m.fpf > 0.0 && m.fpf <= 1.0);
    }

    #[test]
    fn test_invalid_cases() {
        let flat = Array2::<f64>::zeros((21, 21));
        let center = Position::new(10.0, 10.0);
        assert_eq!(
            compute_snr(&flat.view(), Position::new(15.0, 10.0), center, 1.0, 0),
            Err(InvalidSnr::ZeroNoise)
        );

        let nan = Array2::<f64>::from_elem((21, 21), f64::NAN);
        assert_eq!(
            compute_snr(&nan.view(), Position::new(15.0, 10.0), center, 1.0, 0),
            Err(InvalidSnr::SignalNoData)
        );

        // Seven slots on the ring, all within three of the signal slot
        let noise = noise_frame(21, 1);
        assert!(matches!(
            compute_snr(&noise.view(), Position::new(17.0, 10.0), center, 3.0, 3),
            Err(InvalidSnr::TooFewReferences { .. })
        ));
    }

    #[test]
    fn test_fpf_symmetry() {
        let (two, one) = false_positive_fractions(0.0, 10);
        assert_relative_eq!(two, 1.0, epsilon = 1e-12);
        assert_relative_eq!(one, 0.5, epsilon = 1e-12);
        let (pos, _) = false_positive_fractions(3.0, 10);
        let (neg, _) = false_positive_fractions(-3.0, 10);
        assert_relative_eq!(pos, neg, epsilon = 1e-15);
    }

    #[test]
    fn test_optimized_snr_finds_offset_source() {
        let mut frame = noise_frame(41, 11);
        let center = Position::new(20.0, 20.0);
        frame[[21, 31]] += 40.0;

        let search = PositionSearch {
            target: OptimizationTarget::SignalFlux,
            max_distance: 1.5,
            grid_size: 7,
        };
        let result =
            compute_optimized_snr(&frame.view(), Position::new(30.0, 20.0), center, 0.5, 0, &search)
                .unwrap();
        assert_eq!(result.old_position, Position::new(30.0, 20.0));
        assert!(result.new_position.distance(Position::new(31.0, 21.0)) <= 0.5);
        assert!(result.measurement.snr > 5.0);
    }

    #[test]
    fn test_detection_map_markers() {
        let mut map = DetectionMap::new(FrameSize::from_width_height(5, 5));
        assert_eq!(map.count(PixelStatus::NotEvaluated), 25);
        map.mark(Pixel::new(1, 1), PixelStatus::InsufficientPredictors);
        assert!(map.snr[[1, 1]].is_nan());
        assert_eq!(map.get(Pixel::new(1, 1)), None);

        let frame = noise_frame(21, 3);
        let m = compute_snr(&frame.view(), Position::new(15.0, 10.0), Position::new(10.0, 10.0), 1.0, 0).unwrap();
        map.record(Pixel::new(2, 3), &m);
        assert_eq!(map.get(Pixel::new(2, 3)), Some(m.snr));
        assert_eq!(map.peak(), Some((Pixel::new(2, 3), m.snr)));
    }
}
