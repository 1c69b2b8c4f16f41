use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::{HsrConfig, RefitScope};
use crate::cube::Position;
use crate::derotation::{CombinationRule, InterpolationKind};
use crate::error::Result;
use crate::fits::load_frame;
use crate::injection::PsfTemplate;
use crate::synthetic::gaussian_psf;

/// Parse a position string in format "x,y" (pixels)
pub fn parse_position(s: &str) -> std::result::Result<Position, String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 2 {
        return Err("Position must be in format 'x,y'".to_string());
    }

    let x = parts[0]
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("Invalid x value: {}", parts[0].trim()))?;
    let y = parts[1]
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("Invalid y value: {}", parts[1].trim()))?;

    if !x.is_finite() || !y.is_finite() {
        return Err("Position coordinates must be finite".to_string());
    }
    Ok(Position::new(x, y))
}

/// Wrapper for Position parsed from "x,y" with a matching Display
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionArg(pub Position);

impl std::str::FromStr for PositionArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_position(s).map(PositionArg)
    }
}

impl std::fmt::Display for PositionArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.0.x, self.0.y)
    }
}

/// Resampling kernel used for derotation and injection
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum InterpolationArg {
    Nearest,
    Bilinear,
    Bicubic,
}

impl From<InterpolationArg> for InterpolationKind {
    fn from(arg: InterpolationArg) -> Self {
        match arg {
            InterpolationArg::Nearest => InterpolationKind::Nearest,
            InterpolationArg::Bilinear => InterpolationKind::Bilinear,
            InterpolationArg::Bicubic => InterpolationKind::Bicubic,
        }
    }
}

/// Temporal combination of derotated residual frames
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CombinationArg {
    Mean,
    Median,
    /// Mean after discarding `--trim-fraction` of samples at each end
    TrimmedMean,
}

/// Common arguments shared by the subcommands that run the pipeline
#[derive(Parser, Debug, Clone)]
pub struct SharedRunArgs {
    /// JSON configuration file; command line options override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Exclusion radius around the candidate trajectory in pixels
    #[arg(long)]
    pub masking_radius: Option<f64>,

    /// Aperture radius for the detection statistic in pixels
    #[arg(long)]
    pub aperture_radius: Option<f64>,

    /// Ridge strengths to cross-validate (e.g., "0.1,1,10,100")
    #[arg(long, value_delimiter = ',')]
    pub alphas: Option<Vec<f64>>,

    #[arg(long, value_enum)]
    pub interpolation: Option<InterpolationArg>,

    #[arg(long, value_enum)]
    pub combine: Option<CombinationArg>,

    /// Fraction trimmed at each end for the trimmed mean
    #[arg(long, default_value_t = 0.1)]
    pub trim_fraction: f64,

    /// Refit every region-of-interest pixel for each candidate
    #[arg(long, default_value_t = false)]
    pub full_refit: bool,

    /// Fit the candidate's PSF trace as an extra predictor
    #[arg(long, default_value_t = false)]
    pub forward_model: bool,

    /// Show progress bars
    #[arg(long, default_value_t = false)]
    pub progress: bool,
}

impl SharedRunArgs {
    /// Load the configuration file (or defaults) and apply overrides
    ///
    /// # Errors
    /// I/O or parse errors for the file, `InvalidConfig` if the result
    /// does not validate.
    pub fn resolve_config(&self) -> Result<HsrConfig> {
        let mut config = match &self.config {
            Some(path) => HsrConfig::load_from_file(path)?,
            None => HsrConfig::default(),
        };
        if let Some(radius) = self.masking_radius {
            config.masking_radius = radius;
        }
        if let Some(radius) = self.aperture_radius {
            config.aperture_radius = radius;
        }
        if let Some(alphas) = &self.alphas {
            config.regularization_grid = alphas.clone();
        }
        if let Some(interpolation) = self.interpolation {
            config.interpolation = interpolation.into();
        }
        if let Some(combine) = self.combine {
            config.combination_rule = match combine {
                CombinationArg::Mean => CombinationRule::Mean,
                CombinationArg::Median => CombinationRule::Median,
                CombinationArg::TrimmedMean => CombinationRule::TrimmedMean {
                    fraction: self.trim_fraction,
                },
            };
        }
        if self.full_refit {
            config.refit_scope = RefitScope::Full;
        }
        if self.forward_model {
            config.use_forward_model = true;
        }
        config.validate()?;
        Ok(config)
    }
}

/// PSF template source shared by injection and forward modeling
#[derive(Parser, Debug, Clone)]
pub struct PsfArgs {
    /// PSF template as a 2-D FITS image; a Gaussian of `--psf-sigma` if omitted
    #[arg(long)]
    pub psf: Option<PathBuf>,

    /// Gaussian template sigma in pixels
    #[arg(long, default_value_t = 1.0)]
    pub psf_sigma: f64,
}

impl PsfArgs {
    /// # Errors
    /// FITS errors for an unreadable file, `CalibrationInput` for an
    /// unusable template.
    pub fn template(&self) -> Result<PsfTemplate> {
        let data = match &self.psf {
            Some(path) => load_frame(path)?.0,
            None => gaussian_psf((8.0 * self.psf_sigma).ceil() as usize, self.psf_sigma),
        };
        PsfTemplate::new(data)
    }
}
