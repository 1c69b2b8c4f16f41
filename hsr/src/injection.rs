//! Injection-retrieval calibration.
//!
//! A scaled PSF template is added along a candidate's trajectory, the full
//! chain is rerun on the injected cube with fresh models, and the recovered
//! statistic is recorded. Batches of (position, contrast) requests run in
//! parallel; their records are funnelled through a channel to one writer
//! that appends them to an [`InjectionLedger`] in submission order.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::{info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::HsrConfig;
use crate::cube::{FrameSize, ImageCube, Position};
use crate::derotation::Interpolator;
use crate::detection::aperture_flux;
use crate::error::{HsrError, Result};
use crate::forward_model::add_trace;
use crate::geometry::Trajectory;
use crate::pipeline::{CancellationToken, HsrPipeline, PixelStatus};

/// Validated point-spread-function template
#[derive(Debug, Clone, PartialEq)]
pub struct PsfTemplate {
    data: Array2<f64>,
}

impl PsfTemplate {
    /// # Errors
    /// `CalibrationInput` if the template is empty, contains non-finite
    /// values, or has no positive peak.
    pub fn new(data: Array2<f64>) -> Result<Self> {
        if data.is_empty() {
            return Err(HsrError::CalibrationInput(
                "PSF template is empty".to_string(),
            ));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(HsrError::CalibrationInput(
                "PSF template contains non-finite values".to_string(),
            ));
        }
        let peak = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if peak <= 0.0 {
            return Err(HsrError::CalibrationInput(format!(
                "PSF template peak must be positive, got {peak}"
            )));
        }
        Ok(Self { data })
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn size(&self) -> FrameSize {
        FrameSize::of_array(&self.data.view())
    }

    /// Largest template value
    pub fn peak(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Position of the template center within the template
    pub fn center(&self) -> Position {
        self.size().center()
    }

    /// Template flux inside an aperture at its center
    pub fn aperture_flux(&self, radius: f64) -> Option<f64> {
        aperture_flux(&self.data.view(), self.center(), radius)
    }
}

fn validate_contrast(contrast: f64) -> Result<()> {
    if !contrast.is_finite() || contrast < 0.0 {
        return Err(HsrError::CalibrationInput(format!(
            "contrast must be finite and non-negative, got {contrast}"
        )));
    }
    Ok(())
}

/// Add `contrast * template` along the trajectory of `position`
///
/// The template is resampled with `interpolator` so that its center lands
/// on the sub-pixel trajectory position in every frame.
///
/// # Errors
/// `CalibrationInput` for an invalid contrast, `InvalidGeometry` if the
/// position never lies on the frame.
pub fn inject_signal(
    cube: &ImageCube,
    template: &PsfTemplate,
    position: Position,
    contrast: f64,
    interpolator: &dyn Interpolator,
) -> Result<ImageCube> {
    validate_contrast(contrast)?;
    let trajectory = Trajectory::compute(position, cube.angles(), cube.center(), cube.frame_size())?;
    let mut frames = cube.frames().clone();
    add_trace(&mut frames, &trajectory, template, contrast, interpolator);
    cube.with_frames(frames)
}

/// One (position, contrast) pair to inject
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InjectionRequest {
    pub position: Position,
    pub contrast: f64,
}

/// Outcome class of an injection run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionStatus {
    /// The statistic was computed at the injection position
    Completed,
    NoData,
    Cancelled,
    InvalidInput,
    InvalidGeometry,
}

/// Result of one injection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionRecord {
    pub position: Position,
    /// Distance from the frame center in pixels
    pub separation: f64,
    pub contrast: f64,
    pub snr: Option<f64>,
    pub fpf: Option<f64>,
    /// Recovered over injected aperture flux
    pub throughput: Option<f64>,
    pub status: InjectionStatus,
    pub message: Option<String>,
}

impl InjectionRecord {
    fn failed(request: &InjectionRequest, separation: f64, status: InjectionStatus, message: Option<String>) -> Self {
        Self {
            position: request.position,
            separation,
            contrast: request.contrast,
            snr: None,
            fpf: None,
            throughput: None,
            status,
            message,
        }
    }

    /// Whether the source counts as detected at `threshold`
    pub fn is_recovered(&self, threshold: f64) -> bool {
        self.status == InjectionStatus::Completed && self.snr.is_some_and(|snr| snr >= threshold)
    }
}

/// Append-only collection of injection records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionLedger {
    pub created: DateTime<Utc>,
    records: Vec<InjectionRecord>,
}

impl Default for InjectionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InjectionLedger {
    pub fn new() -> Self {
        Self {
            created: Utc::now(),
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: InjectionRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[InjectionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Per separation, the faintest contrast recovered at `threshold`
    pub fn contrast_curve(&self, threshold: f64) -> ContrastCurve {
        let points = self
            .records
            .iter()
            .sorted_by(|a, b| a.separation.total_cmp(&b.separation))
            .group_by(|r| (r.separation * 1e6).round() as i64)
            .into_iter()
            .map(|(_, group)| {
                let group: Vec<&InjectionRecord> = group.collect();
                let separation = group[0].separation;
                let detection_limit = group
                    .iter()
                    .filter(|r| r.is_recovered(threshold))
                    .map(|r| r.contrast)
                    .min_by(|a, b| a.total_cmp(b));
                ContrastPoint {
                    separation,
                    detection_limit,
                    n_injections: group.len(),
                }
            })
            .collect();
        ContrastCurve { threshold, points }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Detection limit at one separation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContrastPoint {
    pub separation: f64,
    /// Smallest recovered contrast, `None` if nothing was recovered
    pub detection_limit: Option<f64>,
    pub n_injections: usize,
}

/// Detection limit as a function of separation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastCurve {
    pub threshold: f64,
    pub points: Vec<ContrastPoint>,
}

/// Runs injections against one clean cube
pub struct InjectionCalibrator<'a> {
    cube: &'a ImageCube,
    template: PsfTemplate,
    config: HsrConfig,
    cancel: CancellationToken,
}

impl<'a> InjectionCalibrator<'a> {
    /// # Errors
    /// `CalibrationInput` for an invalid template, `InvalidConfig` for an
    /// invalid configuration.
    pub fn new(cube: &'a ImageCube, template: Array2<f64>, config: HsrConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cube,
            template: PsfTemplate::new(template)?,
            config,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn template(&self) -> &PsfTemplate {
        &self.template
    }

    /// Inject one source and measure it; failures become records
    pub fn run(&self, request: &InjectionRequest) -> InjectionRecord {
        let separation = request.position.distance(self.cube.center());
        if self.cancel.is_cancelled() {
            return InjectionRecord::failed(request, separation, InjectionStatus::Cancelled, None);
        }
        match self.try_run(request, separation) {
            Ok(record) => record,
            Err(e) => {
                let status = match e {
                    HsrError::CalibrationInput(_) => InjectionStatus::InvalidInput,
                    HsrError::InvalidGeometry(_) => InjectionStatus::InvalidGeometry,
                    _ => InjectionStatus::NoData,
                };
                warn!("injection at {} failed: {}", request.position, e);
                InjectionRecord::failed(request, separation, status, Some(e.to_string()))
            }
        }
    }

    fn try_run(&self, request: &InjectionRequest, separation: f64) -> Result<InjectionRecord> {
        let injected = inject_signal(
            self.cube,
            &self.template,
            request.position,
            request.contrast,
            &self.config.interpolation,
        )?;

        let pipeline = HsrPipeline::new(&injected, self.config.clone())?
            .with_psf_template(self.template.clone())
            .with_cancellation(self.cancel.clone());
        let baseline = pipeline.baseline()?;
        let evaluation = pipeline.evaluate_candidate(&baseline, request.position)?;

        let status = match evaluation.candidate_status() {
            PixelStatus::Valid => InjectionStatus::Completed,
            PixelStatus::Cancelled => InjectionStatus::Cancelled,
            _ => InjectionStatus::NoData,
        };
        let measurement = evaluation.snr.ok().filter(|_| status == InjectionStatus::Completed);
        let injected_flux = self
            .template
            .aperture_flux(self.config.aperture_radius)
            .map(|f| f * request.contrast)
            .filter(|f| *f > 0.0);
        let throughput = match (&measurement, injected_flux) {
            (Some(m), Some(flux)) => Some(m.signal_flux / flux),
            _ => None,
        };

        Ok(InjectionRecord {
            position: request.position,
            separation,
            contrast: request.contrast,
            snr: measurement.as_ref().map(|m| m.snr),
            fpf: measurement.as_ref().map(|m| m.fpf),
            throughput,
            status,
            message: None,
        })
    }

    /// Run every request and collect the records in submission order
    pub fn run_batch(&self, requests: &[InjectionRequest]) -> InjectionLedger {
        info!("Running {} injections", requests.len());
        let (sender, receiver) = crossbeam_channel::unbounded::<(usize, InjectionRecord)>();

        let writer = std::thread::spawn(move || {
            let mut pending = BTreeMap::new();
            while let Ok((index, record)) = receiver.recv() {
                pending.insert(index, record);
            }
            let mut ledger = InjectionLedger::new();
            for (_, record) in pending {
                ledger.push(record);
            }
            ledger
        });

        requests
            .par_iter()
            .enumerate()
            .for_each_with(sender, |sender, (index, request)| {
                let record = self.run(request);
                if sender.send((index, record)).is_err() {
                    warn!("injection writer closed before record {index} arrived");
                }
            });

        match writer.join() {
            Ok(ledger) => ledger,
            Err(_) => {
                warn!("injection writer panicked; returning an empty ledger");
                InjectionLedger::new()
            }
        }
    }
}
