//! JSON artifacts for detection maps.
//!
//! Image data (cubes, residuals, combined frames) is written as FITS by
//! [`crate::fits`]. Every artifact here carries an [`ArtifactMetadata`] block with its shape,
//! angle series, rotation center and creation time. Floating point arrays
//! are stored as row-major value lists where `null` stands for a missing
//! (non-finite) sample, since residual products use NaN as "no data".

use chrono::{DateTime, Utc};
use ndarray::{Array2, Array3, ArrayBase, Data, Dimension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::cube::{ParallacticAngles, Position};
use crate::detection::DetectionMap;
use crate::error::{HsrError, Result};
use crate::pipeline::PixelStatus;

/// Save/load as pretty-printed JSON
pub trait JsonArtifact: Serialize + DeserializeOwned {
    fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Row-major array values with non-finite samples stored as `None`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayData {
    pub shape: Vec<usize>,
    pub values: Vec<Option<f64>>,
}

impl ArrayData {
    pub fn from_array<S, D>(array: &ArrayBase<S, D>) -> Self
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        Self {
            shape: array.shape().to_vec(),
            values: array.iter().map(|v| v.is_finite().then_some(*v)).collect(),
        }
    }

    fn decoded(&self) -> Vec<f64> {
        self.values.iter().map(|v| v.unwrap_or(f64::NAN)).collect()
    }

    pub fn to_array2(&self) -> Result<Array2<f64>> {
        match self.shape.as_slice() {
            &[rows, cols] => Array2::from_shape_vec((rows, cols), self.decoded())
                .map_err(|e| HsrError::InvalidGeometry(format!("corrupt 2-D array data: {e}"))),
            other => Err(HsrError::InvalidGeometry(format!(
                "expected a 2-D array, found shape {other:?}"
            ))),
        }
    }

    pub fn to_array3(&self) -> Result<Array3<f64>> {
        match self.shape.as_slice() {
            &[frames, rows, cols] => Array3::from_shape_vec((frames, rows, cols), self.decoded())
                .map_err(|e| HsrError::InvalidGeometry(format!("corrupt 3-D array data: {e}"))),
            other => Err(HsrError::InvalidGeometry(format!(
                "expected a 3-D array, found shape {other:?}"
            ))),
        }
    }
}

/// Provenance shared by every artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub created: DateTime<Utc>,
    pub shape: Vec<usize>,
    /// Parallactic angles in degrees, one per frame
    pub angles: Vec<f64>,
    pub center: Position,
    /// Arcsec per pixel
    pub pixel_scale: Option<f64>,
    pub description: String,
}

impl ArtifactMetadata {
    fn new(shape: &[usize], angles: &ParallacticAngles, center: Position, description: &str) -> Self {
        Self {
            created: Utc::now(),
            shape: shape.to_vec(),
            angles: angles.as_slice().to_vec(),
            center,
            pixel_scale: None,
            description: description.to_string(),
        }
    }
}

/// SNR, false positive fraction and signal coefficient maps with validity markers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionMapArtifact {
    pub metadata: ArtifactMetadata,
    pub snr: ArrayData,
    pub fpf: ArrayData,
    pub coefficient: ArrayData,
    pub status: Array2<PixelStatus>,
}

impl JsonArtifact for DetectionMapArtifact {}

impl DetectionMapArtifact {
    pub fn from_map(
        map: &DetectionMap,
        angles: &ParallacticAngles,
        center: Position,
        description: &str,
    ) -> Self {
        Self {
            metadata: ArtifactMetadata::new(map.snr.shape(), angles, center, description),
            snr: ArrayData::from_array(&map.snr),
            fpf: ArrayData::from_array(&map.fpf),
            coefficient: ArrayData::from_array(&map.coefficient),
            status: map.status.clone(),
        }
    }

    pub fn to_map(&self) -> Result<DetectionMap> {
        let snr = self.snr.to_array2()?;
        let fpf = self.fpf.to_array2()?;
        let coefficient = self.coefficient.to_array2()?;
        if snr.dim() != fpf.dim() || snr.dim() != coefficient.dim() || snr.dim() != self.status.dim() {
            return Err(HsrError::InvalidGeometry(format!(
                "detection map layers disagree: snr {:?}, fpf {:?}, coefficient {:?}, status {:?}",
                snr.dim(),
                fpf.dim(),
                coefficient.dim(),
                self.status.dim()
            )));
        }
        Ok(DetectionMap {
            snr,
            fpf,
            coefficient,
            status: self.status.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::{FrameSize, Pixel};
    use tempfile::tempdir;

    #[test]
    fn test_nan_survives_json() {
        let mut frame = Array2::<f64>::zeros((2, 3));
        frame[[1, 2]] = f64::NAN;
        frame[[0, 1]] = 2.5;
        let data = ArrayData::from_array(&frame);
        let json = serde_json::to_string(&data).unwrap();
        let back: ArrayData = serde_json::from_str(&json).unwrap();
        let restored = back.to_array2().unwrap();
        assert!(restored[[1, 2]].is_nan());
        assert_eq!(restored[[0, 1]], 2.5);
        assert!(back.to_array3().is_err());
    }

    #[test]
    fn test_detection_map_artifact() {
        let mut map = DetectionMap::new(FrameSize::from_width_height(4, 3));
        map.mark(Pixel::new(1, 1), PixelStatus::Cancelled);
        map.record_coefficient(Pixel::new(2, 3), Some(4.25));
        let angles = ParallacticAngles::new(vec![0.0]).unwrap();
        let artifact = DetectionMapArtifact::from_map(&map, &angles, Position::new(1.5, 1.0), "map");

        let dir = tempdir().unwrap();
        let path = dir.path().join("map.json");
        artifact.save_to_file(&path).unwrap();
        let back = DetectionMapArtifact::load_from_file(&path).unwrap();
        assert_eq!(back.metadata.shape, vec![3, 4]);
        let restored = back.to_map().unwrap();
        assert_eq!(restored.status, map.status);
        assert!(restored.snr.iter().all(|v| v.is_nan()));
        assert_eq!(restored.coefficient[[2, 3]], 4.25);
        assert!(restored.coefficient[[1, 1]].is_nan());
    }

    #[test]
    fn test_layer_mismatch_rejected() {
        let map = DetectionMap::new(FrameSize::from_width_height(4, 3));
        let angles = ParallacticAngles::new(vec![0.0]).unwrap();
        let mut artifact = DetectionMapArtifact::from_map(&map, &angles, Position::new(1.5, 1.0), "map");
        artifact.coefficient = ArrayData::from_array(&Array2::<f64>::zeros((2, 2)));
        assert!(matches!(artifact.to_map(), Err(HsrError::InvalidGeometry(_))));
    }
}
