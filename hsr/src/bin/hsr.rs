//! Half-sibling regression command line tool
//!
//! ```bash
//! # Toy cube with one fake planet
//! cargo run --release --bin hsr -- synth --output cube.fits --planet 16,10 --amplitude 20
//!
//! # Score a single candidate, or every ROI pixel when no candidate is given
//! cargo run --release --bin hsr -- detect --cube cube.fits --candidate 16,10 --refine 1.0
//! cargo run --release --bin hsr -- detect --cube cube.fits --output map.json --progress
//!
//! # Forward-model coefficients and the best-fit planet model
//! cargo run --release --bin hsr -- detect --cube cube.fits --forward-model --planet-model model.fits
//!
//! # Injection-retrieval contrast curve
//! cargo run --release --bin hsr -- calibrate --cube cube.fits --separations 4,6,8 --contrasts 2,5,10,20
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};

use hsr::artifact::{DetectionMapArtifact, JsonArtifact};
use hsr::cli_args::{PositionArg, PsfArgs, SharedRunArgs};
use hsr::cube::{FrameSize, Position};
use hsr::detection::{compute_optimized_snr, PositionSearch};
use hsr::fits::{self, FitsHeader};
use hsr::forward_model::best_fit_planet_model;
use hsr::injection::{InjectionCalibrator, InjectionRequest};
use hsr::synthetic::{make_toy_cube, FakePlanet, ToyObservation};
use hsr::{HsrConfig, HsrPipeline};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a toy cube with optional fake planets
    Synth {
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value_t = 50)]
        frames: usize,

        /// Frame side length in pixels
        #[arg(long, default_value_t = 41)]
        size: usize,

        /// Total field rotation in degrees
        #[arg(long, default_value_t = 90.0)]
        rotation: f64,

        #[arg(long, default_value_t = 1.0)]
        noise: f64,

        /// Standard deviation of the per-frame systematic amplitude
        #[arg(long, default_value_t = 0.2)]
        systematic: f64,

        /// Planet position in the derotated frame ("x,y"), repeatable
        #[arg(long)]
        planet: Vec<PositionArg>,

        /// Peak amplitude of every planet
        #[arg(long, default_value_t = 20.0)]
        amplitude: f64,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Run the pipeline on a cube
    Detect {
        #[arg(long)]
        cube: PathBuf,

        /// Candidate position ("x,y"), repeatable; omit for a full map
        #[arg(long)]
        candidate: Vec<PositionArg>,

        /// Detection map output (full map mode)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory for residual and combined-frame FITS files of candidates
        #[arg(long)]
        artifacts: Option<PathBuf>,

        /// Best-fit planet model FITS output (full map with --forward-model)
        #[arg(long)]
        planet_model: Option<PathBuf>,

        /// Search this many pixels around each candidate for the brightest
        /// aperture placement
        #[arg(long)]
        refine: Option<f64>,

        #[command(flatten)]
        psf: PsfArgs,

        #[command(flatten)]
        run: SharedRunArgs,
    },

    /// Injection-retrieval calibration
    Calibrate {
        #[arg(long)]
        cube: PathBuf,

        /// Separations from the center in pixels (e.g., "4,6,8")
        #[arg(long, value_delimiter = ',', required = true)]
        separations: Vec<f64>,

        /// Contrasts relative to the template peak (e.g., "1,5,10")
        #[arg(long, value_delimiter = ',', required = true)]
        contrasts: Vec<f64>,

        #[command(flatten)]
        psf: PsfArgs,

        #[arg(short, long, default_value = "injections.json")]
        output: PathBuf,

        #[command(flatten)]
        run: SharedRunArgs,
    },

    /// Write the default configuration as JSON
    InitConfig {
        #[arg(short, long, default_value = "hsr_config.json")]
        output: PathBuf,
    },
}

fn load_cube(path: &Path) -> anyhow::Result<hsr::ImageCube> {
    fits::load_cube(path).with_context(|| format!("Failed to load cube from {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Synth {
            output,
            frames,
            size,
            rotation,
            noise,
            systematic,
            planet,
            amplitude,
            seed,
        } => {
            let observation = ToyObservation {
                n_frames: frames,
                frame_size: FrameSize::from_width_height(size, size),
                field_rotation: rotation,
                noise_std: noise,
                systematic_std: systematic,
                seed,
                ..Default::default()
            };
            let planets: Vec<FakePlanet> = planet
                .iter()
                .map(|p| FakePlanet {
                    position: p.0,
                    amplitude,
                })
                .collect();
            let (cube, _) = make_toy_cube(&observation, &planets)?;
            fits::save_cube(&output, &cube, "toy cube")?;
            println!(
                "Wrote {} frames of {} with {} planet(s) to {}",
                frames,
                cube.frame_size(),
                planets.len(),
                output.display()
            );
        }

        Commands::Detect {
            cube,
            candidate,
            output,
            artifacts,
            planet_model,
            refine,
            psf,
            run,
        } => {
            let cube = load_cube(&cube)?;
            let config = run.resolve_config()?;
            let template = psf.template()?;
            let interpolation = config.interpolation;
            let pipeline = HsrPipeline::new(&cube, config)?
                .with_psf_template(template.clone())
                .with_progress(run.progress);
            let baseline = pipeline.baseline()?;

            if candidate.is_empty() {
                let map = pipeline.detection_map_with_baseline(&baseline, None)?;
                match map.peak() {
                    Some((pixel, snr)) => {
                        println!("Peak SNR {:.2} at x={}, y={}", snr, pixel.col, pixel.row)
                    }
                    None => println!("No valid detection statistic in the map"),
                }
                if let Some(path) = output {
                    DetectionMapArtifact::from_map(&map, cube.angles(), cube.center(), "detection map")
                        .save_to_file(&path)?;
                    info!("Saved detection map to {}", path.display());
                }
                if let Some(path) = planet_model {
                    if !pipeline.config().use_forward_model {
                        bail!("--planet-model needs --forward-model");
                    }
                    let model = best_fit_planet_model(
                        &map.coefficient,
                        cube.angles(),
                        cube.center(),
                        &template,
                        &interpolation,
                    )?;
                    let header = FitsHeader::new("best-fit planet model")
                        .with_geometry(cube.angles(), cube.center());
                    fits::save_stack(&path, &model, &header)?;
                    info!("Saved best-fit planet model to {}", path.display());
                }
            } else {
                if let Some(dir) = &artifacts {
                    std::fs::create_dir_all(dir)?;
                }
                for (index, position) in candidate.iter().enumerate() {
                    let evaluation = pipeline.evaluate_candidate(&baseline, position.0)?;
                    match &evaluation.snr {
                        Ok(m) => println!(
                            "{}: SNR {:.2}, FPF {:.3e} ({} reference apertures, {} pixels refit)",
                            position, m.snr, m.fpf, m.n_reference, evaluation.n_refit
                        ),
                        Err(e) => println!("{}: {:?} ({})", position, evaluation.candidate_status(), e),
                    }
                    if let Some(coefficient) = evaluation.signal_coefficient {
                        println!("  signal coefficient {coefficient:.4}");
                    }
                    if let Some(max_distance) = refine {
                        let search = PositionSearch {
                            max_distance,
                            ..Default::default()
                        };
                        let config = pipeline.config();
                        match compute_optimized_snr(
                            &evaluation.combined.view(),
                            position.0,
                            cube.center(),
                            config.aperture_radius,
                            config.ignore_neighbors,
                            &search,
                        ) {
                            Ok(best) => println!(
                                "  refined to x={:.2}, y={:.2}: SNR {:.2}, FPF {:.3e}",
                                best.new_position.x,
                                best.new_position.y,
                                best.measurement.snr,
                                best.measurement.fpf
                            ),
                            Err(e) => println!("  refinement failed ({e})"),
                        }
                    }
                    if let Some(dir) = &artifacts {
                        let description = position.to_string();
                        fits::save_residuals(
                            &dir.join(format!("residuals_{index}.fits")),
                            &evaluation.residuals,
                            &description,
                        )?;
                        let header = FitsHeader::new(&description).with_geometry(cube.angles(), cube.center());
                        fits::save_frame(&dir.join(format!("combined_{index}.fits")), &evaluation.combined, &header)?;
                    }
                }
            }
        }

        Commands::Calibrate {
            cube,
            separations,
            contrasts,
            psf,
            output,
            run,
        } => {
            if separations.is_empty() || contrasts.is_empty() {
                bail!("At least one separation and one contrast are required");
            }
            let cube = load_cube(&cube)?;
            let config = run.resolve_config()?;
            let threshold = config.detection_threshold;
            let template = psf.template().context("Failed to load PSF template")?;
            let calibrator = InjectionCalibrator::new(&cube, template.data().clone(), config)?;

            let center = cube.center();
            let requests: Vec<InjectionRequest> = separations
                .iter()
                .flat_map(|&sep| {
                    contrasts.iter().map(move |&contrast| InjectionRequest {
                        position: Position::new(center.x + sep, center.y),
                        contrast,
                    })
                })
                .collect();

            let ledger = calibrator.run_batch(&requests);
            ledger.save_to_file(&output)?;
            info!("Saved {} injection records to {}", ledger.len(), output.display());

            println!("Separation\tDetection limit (SNR >= {threshold})");
            for point in ledger.contrast_curve(threshold).points {
                match point.detection_limit {
                    Some(limit) => println!("{:.2}\t{}", point.separation, limit),
                    None => println!("{:.2}\tnot recovered", point.separation),
                }
            }
        }

        Commands::InitConfig { output } => {
            HsrConfig::default().save_to_file(&output)?;
            println!("Wrote default configuration to {}", output.display());
        }
    }

    Ok(())
}
