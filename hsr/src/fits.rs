//! FITS persistence for cubes, residual cubes and single frames.
//!
//! Arrays are written as double-precision image extensions (`BITPIX = -64`)
//! so NaN "no data" samples survive unchanged. Array row `r` is FITS row
//! `r + 1` and no vertical flip is applied, so pixel coordinates match the
//! detector convention used throughout the crate.
//!
//! Layout of a file written here:
//! * `DATA` - the image, frame or cube (`NAXIS1` = width)
//! * `ANGLES` - 1-D parallactic angles in degrees, one per frame
//! * `GEOMETRY` - `[center_x, center_y, pixel_scale]`, NaN scale if unknown
//!
//! `DATA` carries `HSRDESC` (free text) and `DATE` (UTC creation time).
//! When reading foreign files, the first 3-D (or 2-D) image stands in for a
//! missing `DATA` extension.

use chrono::Utc;
use fitsio::compat::fitsfile::FitsFile;
use fitsio::compat::hdu::FitsHdu;
use fitsio::compat::images::{ImageDescription, ImageType, ReadImage, WriteImage};
use log::debug;
use ndarray::{Array2, Array3};
use std::collections::HashMap;
use std::path::Path;

use crate::cube::{FrameSize, ImageCube, ParallacticAngles, Position};
use crate::derotation::ResidualCube;
use crate::error::{HsrError, Result};

const DATA_HDU: &str = "DATA";
const ANGLES_HDU: &str = "ANGLES";
const GEOMETRY_HDU: &str = "GEOMETRY";
const DESCRIPTION_KEY: &str = "HSRDESC";

/// One image HDU read back from a file
#[derive(Debug, Clone)]
struct FitsImage {
    /// Axis lengths in array order (slowest first)
    shape: Vec<usize>,
    data: Vec<f64>,
    description: Option<String>,
}

/// Provenance stored next to the data
#[derive(Debug, Clone, PartialEq)]
pub struct FitsHeader {
    pub description: String,
    pub angles: Option<ParallacticAngles>,
    pub center: Option<Position>,
    /// Arcsec per pixel
    pub pixel_scale: Option<f64>,
}

impl FitsHeader {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            angles: None,
            center: None,
            pixel_scale: None,
        }
    }

    pub fn with_geometry(mut self, angles: &ParallacticAngles, center: Position) -> Self {
        self.angles = Some(angles.clone());
        self.center = Some(center);
        self
    }
}

fn create_image(
    fptr: &mut FitsFile,
    name: &str,
    shape: &[usize],
    data: Vec<f64>,
) -> Result<FitsHdu> {
    let image_description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: shape.iter().rev().copied().collect(),
    };
    let hdu = fptr.create_image(name, &image_description)?;
    f64::write_image(fptr, &hdu, &data)?;
    hdu.write_key(fptr, "EXTNAME", &name.to_string())?;
    Ok(hdu)
}

/// Write `data` with shape `shape` (array order) and its header
fn write_fits(path: &Path, shape: &[usize], data: Vec<f64>, header: &FitsHeader) -> Result<()> {
    let mut fptr = FitsFile::create(path).overwrite().open()?;

    let hdu = create_image(&mut fptr, DATA_HDU, shape, data)?;
    hdu.write_key(&mut fptr, DESCRIPTION_KEY, &header.description.clone())?;
    let created = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
    hdu.write_key(&mut fptr, "DATE", &created)?;

    if let Some(angles) = &header.angles {
        create_image(&mut fptr, ANGLES_HDU, &[angles.len()], angles.as_slice().to_vec())?;
    }
    if let Some(center) = header.center {
        let geometry = vec![center.x, center.y, header.pixel_scale.unwrap_or(f64::NAN)];
        create_image(&mut fptr, GEOMETRY_HDU, &[3], geometry)?;
    }
    debug!("wrote {:?} array to {}", shape, path.display());
    Ok(())
}

/// Every image HDU of a file keyed by `EXTNAME` (`HDU_<index>` if unnamed)
fn read_images(path: &Path) -> Result<(HashMap<String, FitsImage>, Vec<String>)> {
    let fptr = FitsFile::open(path)?;
    let mut images = HashMap::new();
    let mut order = Vec::new();

    let mut hdu_idx = 0;
    while let Ok(hdu) = fptr.hdu(hdu_idx) {
        let index = hdu_idx;
        hdu_idx += 1;

        let naxis = hdu.read_key::<i64>(&fptr, "NAXIS").unwrap_or(0);
        if naxis <= 0 {
            continue;
        }
        let name = hdu
            .read_key::<String>(&fptr, "EXTNAME")
            .unwrap_or_else(|_| format!("HDU_{index}"));

        let mut shape = Vec::with_capacity(naxis as usize);
        for axis in 1..=naxis {
            let length = hdu.read_key::<i64>(&fptr, &format!("NAXIS{axis}"))?;
            shape.push(length.max(0) as usize);
        }
        shape.reverse();

        let data = f64::read_image(&fptr, &hdu)?;
        if data.len() != shape.iter().product::<usize>() {
            return Err(HsrError::InvalidGeometry(format!(
                "HDU '{name}' holds {} values for shape {shape:?}",
                data.len()
            )));
        }
        let description = hdu.read_key::<String>(&fptr, DESCRIPTION_KEY).ok();
        order.push(name.clone());
        images.insert(
            name,
            FitsImage {
                shape,
                data,
                description,
            },
        );
    }
    Ok((images, order))
}

/// The `DATA` image, or the first image with `ndim` axes
fn take_data(
    images: &mut HashMap<String, FitsImage>,
    order: &[String],
    ndim: usize,
    path: &Path,
) -> Result<FitsImage> {
    if let Some(image) = images.remove(DATA_HDU) {
        return Ok(image);
    }
    order
        .iter()
        .find(|name| images.get(*name).is_some_and(|image| image.shape.len() == ndim))
        .and_then(|name| images.remove(name))
        .ok_or_else(|| {
            HsrError::InvalidGeometry(format!(
                "{} has no {ndim}-D image extension",
                path.display()
            ))
        })
}

fn read_header(images: &HashMap<String, FitsImage>, description: Option<String>) -> Result<FitsHeader> {
    let angles = match images.get(ANGLES_HDU) {
        Some(image) => Some(ParallacticAngles::new(image.data.clone())?),
        None => None,
    };
    let (center, pixel_scale) = match images.get(GEOMETRY_HDU) {
        Some(image) if image.data.len() == 3 => {
            let scale = image.data[2];
            (
                Some(Position::new(image.data[0], image.data[1])),
                scale.is_finite().then_some(scale),
            )
        }
        Some(image) => {
            return Err(HsrError::InvalidGeometry(format!(
                "GEOMETRY extension has {} values, expected 3",
                image.data.len()
            )))
        }
        None => (None, None),
    };
    Ok(FitsHeader {
        description: description.unwrap_or_default(),
        angles,
        center,
        pixel_scale,
    })
}

fn into_array3(image: FitsImage) -> Result<Array3<f64>> {
    match image.shape.as_slice() {
        &[frames, rows, cols] => Array3::from_shape_vec((frames, rows, cols), image.data)
            .map_err(|e| HsrError::InvalidGeometry(format!("corrupt cube data: {e}"))),
        other => Err(HsrError::InvalidGeometry(format!(
            "expected a 3-D image, found shape {other:?}"
        ))),
    }
}

/// Read a 3-D stack and its header
pub fn load_stack(path: &Path) -> Result<(Array3<f64>, FitsHeader)> {
    let (mut images, order) = read_images(path)?;
    let image = take_data(&mut images, &order, 3, path)?;
    let header = read_header(&images, image.description.clone())?;
    Ok((into_array3(image)?, header))
}

/// Write a 3-D stack, e.g. a planet model
pub fn save_stack(path: &Path, stack: &Array3<f64>, header: &FitsHeader) -> Result<()> {
    write_fits(path, stack.shape(), stack.iter().copied().collect(), header)
}

/// Write an image cube with its angles, center and pixel scale
pub fn save_cube(path: &Path, cube: &ImageCube, description: &str) -> Result<()> {
    let mut header = FitsHeader::new(description).with_geometry(cube.angles(), cube.center());
    header.pixel_scale = cube.pixel_scale();
    save_stack(path, cube.frames(), &header)
}

/// Read an image cube
///
/// # Errors
/// `InvalidGeometry` if the file has no angle extension or the angles do
/// not match the frame count; `Fits` for unreadable files.
pub fn load_cube(path: &Path) -> Result<ImageCube> {
    let (frames, header) = load_stack(path)?;
    let angles = header.angles.ok_or_else(|| {
        HsrError::InvalidGeometry(format!("{} has no {ANGLES_HDU} extension", path.display()))
    })?;
    let mut cube = ImageCube::new(frames, angles)?;
    if let Some(center) = header.center {
        cube = cube.with_center(center);
    }
    if let Some(scale) = header.pixel_scale {
        cube = cube.with_pixel_scale(scale);
    }
    Ok(cube)
}

/// Write per-pixel residual time series
pub fn save_residuals(path: &Path, residuals: &ResidualCube, description: &str) -> Result<()> {
    let header = FitsHeader::new(description).with_geometry(&residuals.angles, residuals.center);
    save_stack(path, &residuals.residuals, &header)
}

pub fn load_residuals(path: &Path) -> Result<ResidualCube> {
    let (stack, header) = load_stack(path)?;
    let angles = header.angles.ok_or_else(|| {
        HsrError::InvalidGeometry(format!("{} has no {ANGLES_HDU} extension", path.display()))
    })?;
    let (_, height, width) = stack.dim();
    let center = header
        .center
        .unwrap_or_else(|| FrameSize::from_width_height(width, height).center());
    let mut residuals = ResidualCube::empty(stack.dim(), angles, center)?;
    residuals.residuals = stack;
    Ok(residuals)
}

/// Write a single frame, e.g. the combined residual or a map layer
pub fn save_frame(path: &Path, frame: &Array2<f64>, header: &FitsHeader) -> Result<()> {
    write_fits(path, frame.shape(), frame.iter().copied().collect(), header)
}

pub fn load_frame(path: &Path) -> Result<(Array2<f64>, FitsHeader)> {
    let (mut images, order) = read_images(path)?;
    let image = take_data(&mut images, &order, 2, path)?;
    let header = read_header(&images, image.description.clone())?;
    let frame = match image.shape.as_slice() {
        &[rows, cols] => Array2::from_shape_vec((rows, cols), image.data)
            .map_err(|e| HsrError::InvalidGeometry(format!("corrupt frame data: {e}")))?,
        other => {
            return Err(HsrError::InvalidGeometry(format!(
                "expected a 2-D image, found shape {other:?}"
            )))
        }
    };
    Ok((frame, header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::simple_normal_cube;
    use tempfile::tempdir;

    #[test]
    fn test_cube_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cube.fits");
        let angles = ParallacticAngles::new(vec![0.0, 1.5, 3.0]).unwrap();
        let cube = ImageCube::new(simple_normal_cube((3, 5, 4), 0.0, 1.0, 9), angles)
            .unwrap()
            .with_center(Position::new(1.25, 2.0))
            .with_pixel_scale(0.0272);

        save_cube(&path, &cube, "toy").unwrap();
        let restored = load_cube(&path).unwrap();
        assert_eq!(restored.frames(), cube.frames());
        assert_eq!(restored.angles(), cube.angles());
        assert_eq!(restored.center(), cube.center());
        assert_eq!(restored.pixel_scale(), Some(0.0272));

        let (_, header) = load_stack(&path).unwrap();
        assert_eq!(header.description, "toy");
    }

    #[test]
    fn test_residual_nan_survives() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("residuals.fits");
        let angles = ParallacticAngles::new(vec![0.0, 10.0]).unwrap();
        let mut residuals = ResidualCube::empty((2, 3, 4), angles, Position::new(1.5, 1.0)).unwrap();
        residuals.residuals[[0, 1, 2]] = 2.5;
        residuals.residuals[[1, 2, 3]] = -1.0;

        save_residuals(&path, &residuals, "baseline").unwrap();
        let restored = load_residuals(&path).unwrap();
        assert_eq!(restored.residuals.dim(), (2, 3, 4));
        assert_eq!(restored.residuals[[0, 1, 2]], 2.5);
        assert_eq!(restored.residuals[[1, 2, 3]], -1.0);
        assert!(restored.residuals[[0, 0, 0]].is_nan());
        assert_eq!(restored.angles, residuals.angles);
        assert_eq!(restored.center, residuals.center);
    }

    #[test]
    fn test_frame_keeps_row_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        let frame = Array2::from_shape_fn((3, 5), |(r, c)| (r * 10 + c) as f64);
        save_frame(&path, &frame, &FitsHeader::new("combined")).unwrap();

        let (restored, header) = load_frame(&path).unwrap();
        assert_eq!(restored, frame);
        assert_eq!(restored[[2, 4]], 24.0);
        assert_eq!(header.description, "combined");
        assert_eq!(header.angles, None);
        assert_eq!(header.center, None);
    }

    #[test]
    fn test_cube_without_angles_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bare.fits");
        let stack = Array3::<f64>::zeros((2, 3, 3));
        save_stack(&path, &stack, &FitsHeader::new("no angles")).unwrap();
        assert!(matches!(load_cube(&path), Err(HsrError::InvalidGeometry(_))));
        assert_eq!(load_stack(&path).unwrap().0, stack);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(load_cube(&dir.path().join("absent.fits")).is_err());
    }
}
