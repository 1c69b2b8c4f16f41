//! Image cube, parallactic angle series and pixel positions.
//!
//! Frames are stored row-major as `(n_frames, height, width)`. Positions use
//! continuous pixel coordinates where `x` is the column and `y` the row, so a
//! pixel `[[row, col]]` has its center at `Position { x: col, y: row }`.

use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{HsrError, Result};

/// Frame dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    /// Frame width in pixels
    pub width: usize,
    /// Frame height in pixels
    pub height: usize,
}

impl FrameSize {
    pub fn from_width_height(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Frame size of an array with shape (height, width)
    pub fn of_array<T>(frame: &ArrayView2<T>) -> Self {
        let (height, width) = frame.dim();
        Self { width, height }
    }

    /// Array of `value` with shape (height, width)
    pub fn filled<T: Clone>(&self, value: T) -> Array2<T> {
        Array2::from_elem((self.height, self.width), value)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Length of the frame diagonal in pixels
    pub fn diagonal(&self) -> f64 {
        (self.width as f64).hypot(self.height as f64)
    }

    /// Geometric center of the frame in pixel coordinates
    pub fn center(&self) -> Position {
        Position::new(
            (self.width as f64 - 1.0) / 2.0,
            (self.height as f64 - 1.0) / 2.0,
        )
    }

    /// Whether a continuous position falls on a pixel of this frame
    pub fn contains(&self, position: Position) -> bool {
        position.x > -0.5
            && position.y > -0.5
            && position.x < self.width as f64 - 0.5
            && position.y < self.height as f64 - 0.5
    }

    /// Iterate over all pixel coordinates in row-major order
    pub fn pixels(&self) -> impl Iterator<Item = Pixel> + '_ {
        (0..self.height).flat_map(move |row| (0..self.width).map(move |col| Pixel::new(row, col)))
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Integer pixel coordinate (row, col)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pixel {
    pub row: usize,
    pub col: usize,
}

impl Pixel {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    /// Continuous position of the pixel center
    pub fn position(&self) -> Position {
        Position::new(self.col as f64, self.row as f64)
    }

    pub fn index(&self) -> [usize; 2] {
        [self.row, self.col]
    }
}

/// Continuous pixel-grid position (x = column, y = row)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: Position) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn distance_squared(&self, other: Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    /// Nearest pixel, if the position lies on the frame
    pub fn nearest_pixel(&self, size: FrameSize) -> Option<Pixel> {
        if !size.contains(*self) {
            return None;
        }
        let col = self.x.round().clamp(0.0, (size.width - 1) as f64) as usize;
        let row = self.y.round().clamp(0.0, (size.height - 1) as f64) as usize;
        Some(Pixel::new(row, col))
    }

    /// Polar angle around `center` in radians, measured from +x toward +y
    pub fn polar_angle(&self, center: Position) -> f64 {
        (self.y - center.y).atan2(self.x - center.x)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({:.2}, {:.2})", self.x, self.y)
    }
}

/// Parallactic angle series in degrees, one per frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallacticAngles(Vec<f64>);

impl ParallacticAngles {
    /// Validate and wrap an angle series
    ///
    /// # Errors
    /// `InvalidGeometry` if the series is empty or contains non-finite values
    pub fn new(degrees: Vec<f64>) -> Result<Self> {
        if degrees.is_empty() {
            return Err(HsrError::InvalidGeometry(
                "parallactic angle series is empty".to_string(),
            ));
        }
        if let Some(idx) = degrees.iter().position(|a| !a.is_finite()) {
            return Err(HsrError::InvalidGeometry(format!(
                "parallactic angle at index {idx} is not finite"
            )));
        }
        Ok(Self(degrees))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn get(&self, t: usize) -> f64 {
        self.0[t]
    }

    /// Total field rotation |last - first| in degrees
    pub fn field_rotation(&self) -> f64 {
        (self.0[self.0.len() - 1] - self.0[0]).abs()
    }

    /// Angles shifted so that the first frame has angle zero
    pub fn relative_to_first(&self) -> Self {
        let first = self.0[0];
        Self(self.0.iter().map(|a| a - first).collect())
    }

    /// Whether the series is monotonic (either direction)
    pub fn is_monotonic(&self) -> bool {
        let ascending = self.0.windows(2).all(|w| w[1] >= w[0]);
        let descending = self.0.windows(2).all(|w| w[1] <= w[0]);
        ascending || descending
    }
}

/// Time-resolved stack of frames with its matched angle series
///
/// Read-only once constructed; shared by reference across all workers.
#[derive(Debug, Clone)]
pub struct ImageCube {
    frames: Array3<f64>,
    angles: ParallacticAngles,
    center: Position,
    pixel_scale: Option<f64>,
}

impl ImageCube {
    /// Build a cube centered on the geometric frame center
    ///
    /// # Errors
    /// `InvalidGeometry` if there are no frames, a spatial axis is empty, or
    /// the angle series length differs from the number of frames.
    pub fn new(frames: Array3<f64>, angles: ParallacticAngles) -> Result<Self> {
        let (n_frames, height, width) = frames.dim();
        if n_frames == 0 || height == 0 || width == 0 {
            return Err(HsrError::InvalidGeometry(format!(
                "cube shape ({n_frames}, {height}, {width}) has an empty axis"
            )));
        }
        if angles.len() != n_frames {
            return Err(HsrError::InvalidGeometry(format!(
                "angle series has {} entries but cube has {} frames",
                angles.len(),
                n_frames
            )));
        }
        let center = FrameSize::from_width_height(width, height).center();
        Ok(Self {
            frames,
            angles,
            center,
            pixel_scale: None,
        })
    }

    /// Override the rotation center
    pub fn with_center(mut self, center: Position) -> Self {
        self.center = center;
        self
    }

    /// Attach a pixel scale in arcsec per pixel
    pub fn with_pixel_scale(mut self, arcsec_per_pixel: f64) -> Self {
        self.pixel_scale = Some(arcsec_per_pixel);
        self
    }

    pub fn frames(&self) -> &Array3<f64> {
        &self.frames
    }

    pub fn angles(&self) -> &ParallacticAngles {
        &self.angles
    }

    pub fn center(&self) -> Position {
        self.center
    }

    pub fn pixel_scale(&self) -> Option<f64> {
        self.pixel_scale
    }

    pub fn n_frames(&self) -> usize {
        self.frames.len_of(Axis(0))
    }

    pub fn frame_size(&self) -> FrameSize {
        let (_, height, width) = self.frames.dim();
        FrameSize::from_width_height(width, height)
    }

    pub fn frame(&self, t: usize) -> ArrayView2<'_, f64> {
        self.frames.index_axis(Axis(0), t)
    }

    /// Time series of a single pixel
    pub fn time_series(&self, pixel: Pixel) -> ArrayView1<'_, f64> {
        self.frames.slice(ndarray::s![.., pixel.row, pixel.col])
    }

    /// Same geometry, different pixel data (e.g. after injection)
    ///
    /// # Errors
    /// `InvalidGeometry` if the shape differs from this cube's shape
    pub fn with_frames(&self, frames: Array3<f64>) -> Result<Self> {
        if frames.dim() != self.frames.dim() {
            return Err(HsrError::InvalidGeometry(format!(
                "replacement frames have shape {:?}, expected {:?}",
                frames.dim(),
                self.frames.dim()
            )));
        }
        Ok(Self {
            frames,
            angles: self.angles.clone(),
            center: self.center,
            pixel_scale: self.pixel_scale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_angles_rejected() {
        assert!(matches!(
            ParallacticAngles::new(vec![]),
            Err(HsrError::InvalidGeometry(_))
        ));
        assert!(ParallacticAngles::new(vec![0.0, f64::NAN]).is_err());
    }

    #[test]
    fn test_cube_angle_length_mismatch() {
        let frames = Array3::<f64>::zeros((5, 4, 4));
        let angles = ParallacticAngles::new(vec![0.0; 4]).unwrap();
        assert!(matches!(
            ImageCube::new(frames, angles),
            Err(HsrError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_center_and_time_series() {
        let frames = Array3::from_shape_fn((3, 5, 7), |(t, r, c)| (t * 100 + r * 10 + c) as f64);
        let angles = ParallacticAngles::new(vec![0.0, 1.0, 2.0]).unwrap();
        let cube = ImageCube::new(frames, angles).unwrap();

        assert_eq!(cube.center(), Position::new(3.0, 2.0));
        assert_eq!(cube.frame_size(), FrameSize::from_width_height(7, 5));
        let series = cube.time_series(Pixel::new(1, 2));
        assert_eq!(series.to_vec(), vec![12.0, 112.0, 212.0]);
    }

    #[test]
    fn test_nearest_pixel_bounds() {
        let size = FrameSize::from_width_height(4, 4);
        assert_eq!(
            Position::new(2.4, 0.6).nearest_pixel(size),
            Some(Pixel::new(1, 2))
        );
        assert_eq!(Position::new(-0.6, 1.0).nearest_pixel(size), None);
        assert_eq!(Position::new(1.0, 3.6).nearest_pixel(size), None);
    }

    #[test]
    fn test_angle_helpers() {
        let angles = ParallacticAngles::new(vec![10.0, 20.0, 45.0]).unwrap();
        assert_eq!(angles.field_rotation(), 35.0);
        assert_eq!(angles.relative_to_first().as_slice(), &[0.0, 10.0, 35.0]);
        assert!(angles.is_monotonic());
        let zigzag = ParallacticAngles::new(vec![0.0, 5.0, 2.0]).unwrap();
        assert!(!zigzag.is_monotonic());
    }
}
