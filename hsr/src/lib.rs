//! Half-sibling regression for high-contrast imaging
//!
//! This crate removes the stellar point-spread function from pupil-tracking
//! image cubes by predicting every pixel's time series from causally
//! independent pixels elsewhere on the detector, then derotates and combines
//! the residuals and scores candidate companions with a small-sample
//! signal-to-noise statistic. Injection-retrieval calibration measures how
//! faithfully the chain recovers known sources.

pub mod artifact;
pub mod cli_args;
pub mod config;
pub mod cube;
pub mod derotation;
pub mod detection;
pub mod error;
pub mod fits;
pub mod forward_model;
pub mod geometry;
pub mod injection;
pub mod masking;
pub mod pipeline;
pub mod regression;
pub mod selection;
pub mod synthetic;

pub use config::{HsrConfig, RefitScope};
pub use cube::{FrameSize, ImageCube, ParallacticAngles, Pixel, Position};
pub use derotation::{CombinationRule, InterpolationKind, ResidualCube};
pub use detection::{compute_snr, DetectionMap, InvalidSnr, SnrMeasurement};
pub use error::{HsrError, Result};
pub use geometry::Trajectory;
pub use injection::{InjectionCalibrator, InjectionLedger, InjectionRecord, InjectionRequest};
pub use masking::{ExclusionMask, MaskMode};
pub use pipeline::{CancellationToken, HsrPipeline, PixelStatus};
pub use selection::{Annulus, PredictorRegion};
