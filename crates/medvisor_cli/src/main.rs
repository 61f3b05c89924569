//! medvisor CLI: classify images, write Grad-CAM overlays, inspect and
//! import models.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use medvisor::models::checkpoint::sidecar_path;
use medvisor::prelude::*;

#[derive(Parser)]
#[command(name = "medvisor")]
#[command(author, version)]
#[command(about = "Classify images and explain the prediction with a Grad-CAM heatmap")]
#[command(long_about = "medvisor: image classification with Grad-CAM explanations.

Results are printed as one JSON object per line on stdout; logs go to stderr.

EXAMPLES:
  # Classify with the ImageNet MobileNetV2 fallback
  # (models/mobilenet_v2.safetensors, torchvision or timm layout)
  medvisor predict chest.png

  # Convert published weights into a checkpoint with labels
  medvisor import mobilenetv2_100.safetensors --labels imagenet_labels.txt \\
      --output models/mobilenet_v2.mpk
  medvisor predict --model models/mobilenet_v2.mpk chest.png

  # Use a custom checkpoint and save overlays
  medvisor predict --model models/xray.mpk --overlay-dir out/ scans/*.png

  # Show the layers Grad-CAM can target
  medvisor layers --model models/xray.mpk

  # Print the effective configuration
  medvisor --config medvisor.toml config

ENVIRONMENT:
  MEDVISOR_<SECTION>__<KEY>   override a config value, e.g. MEDVISOR_HEATMAP__INTENSITY=0.3
  RUST_LOG                    log filter, overrides -v")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify images and print one JSON result per image
    Predict {
        /// Image files
        #[arg(required = true, value_name = "IMAGES")]
        images: Vec<PathBuf>,

        /// Custom checkpoint (*.mpk with a .json sidecar)
        #[arg(long, value_name = "FILE")]
        model: Option<PathBuf>,

        /// Write <stem>_gradcam.png overlays to this directory
        #[arg(long, value_name = "DIR")]
        overlay_dir: Option<PathBuf>,

        /// Skip saliency computation
        #[arg(long)]
        no_saliency: bool,

        /// Identity recorded in each result
        #[arg(long, value_name = "ID")]
        principal: Option<String>,
    },
    /// List the layers the loaded model exposes as saliency targets
    Layers {
        /// Custom checkpoint (*.mpk with a .json sidecar)
        #[arg(long, value_name = "FILE")]
        model: Option<PathBuf>,
    },
    /// Convert a torchvision or timm MobileNetV2 state dict into a checkpoint
    Import {
        /// State dict (*.safetensors)
        #[arg(value_name = "WEIGHTS")]
        weights: PathBuf,

        /// Output checkpoint; a .json sidecar is written next to it
        #[arg(short, long, value_name = "FILE", default_value = "models/mobilenet_v2.mpk")]
        output: PathBuf,

        /// Class labels, one per line
        #[arg(long, value_name = "FILE")]
        labels: Option<PathBuf>,

        /// Classes in the classifier head
        #[arg(long, default_value_t = 1000)]
        num_classes: usize,

        /// Width multiplier the weights were trained with
        #[arg(long, default_value_t = 1.0)]
        width_multiplier: f32,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Predict {
            images,
            model,
            overlay_dir,
            no_saliency,
            principal,
        } => handle_predict(
            cli.config.as_deref(),
            model,
            &images,
            overlay_dir,
            no_saliency,
            principal,
        ),
        Commands::Layers { model } => handle_layers(cli.config.as_deref(), model),
        Commands::Import {
            weights,
            output,
            labels,
            num_classes,
            width_multiplier,
        } => handle_import(
            &weights,
            &output,
            labels.as_deref(),
            num_classes,
            width_multiplier,
        ),
        Commands::Config => handle_config(cli.config.as_deref()),
    }
}

fn init_logging(verbose: u8, json: bool) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load(config_path: Option<&Path>, model: Option<PathBuf>) -> Result<MedvisorConfig> {
    let mut config = load_config(config_path).context("Failed to load configuration")?;
    if let Some(model) = model {
        config.model.path = Some(model);
    }
    Ok(config)
}

fn build_engine(config: &MedvisorConfig) -> Result<DiagnosticEngine<ExplainBackend>> {
    let engine = DiagnosticEngine::<ExplainBackend>::from_config(config, &Default::default());
    if !engine.is_available() {
        bail!(
            "No model available: checkpoint {:?} and fallback weights {} could not be loaded",
            config.model.path,
            config.model.fallback_weights.display()
        );
    }
    Ok(engine)
}

fn handle_predict(
    config_path: Option<&Path>,
    model: Option<PathBuf>,
    images: &[PathBuf],
    overlay_dir: Option<PathBuf>,
    no_saliency: bool,
    principal: Option<String>,
) -> Result<()> {
    let config = load(config_path, model)?;
    let engine = build_engine(&config)?.with_saliency(config.saliency.enabled && !no_saliency);

    if let Some(dir) = &overlay_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create overlay directory {}", dir.display()))?;
    }

    let outcomes: Vec<Result<String>> = images
        .par_iter()
        .map(|path| predict_one(&engine, path, overlay_dir.as_deref(), principal.clone()))
        .collect();

    let mut failed = 0usize;
    for (path, outcome) in images.iter().zip(outcomes) {
        match outcome {
            Ok(line) => println!("{}", line),
            Err(err) => {
                failed += 1;
                tracing::error!("{}: {:#}", path.display(), err);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} images failed", failed, images.len());
    }
    Ok(())
}

fn predict_one(
    engine: &DiagnosticEngine<ExplainBackend>,
    path: &Path,
    overlay_dir: Option<&Path>,
    principal: Option<String>,
) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let result = engine
        .predict(&bytes, principal)
        .with_context(|| format!("Prediction failed for {}", path.display()))?;

    let mut json: serde_json::Value = serde_json::from_str(&result.to_json()?)?;
    json["file"] = serde_json::Value::String(path.display().to_string());

    if let (Some(dir), Some(overlay)) = (overlay_dir, result.overlay()) {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let out = dir.join(format!("{}_gradcam.png", stem));
        overlay
            .save(&out)
            .with_context(|| format!("Failed to write overlay {}", out.display()))?;
        json["overlay"] = serde_json::Value::String(out.display().to_string());
    }

    Ok(serde_json::to_string(&json)?)
}

fn handle_layers(config_path: Option<&Path>, model: Option<PathBuf>) -> Result<()> {
    let config = load(config_path, model)?;
    let engine = build_engine(&config)?;

    println!("Architecture: {}", engine.architecture().unwrap_or("unknown"));
    if let Some(target) = engine.target() {
        println!("Target spec:  {}", target.candidates().join(" -> "));
    }
    println!(
        "Resolved:     {}",
        engine.resolved_target().as_deref().unwrap_or("<none>")
    );
    println!();

    let resolved = engine.resolved_target();
    for layer in engine.layers().unwrap_or_default() {
        let marker = if resolved.as_deref() == Some(layer.as_str()) {
            "*"
        } else {
            " "
        };
        println!("  {} {}", marker, layer);
    }
    Ok(())
}

fn handle_import(
    weights: &Path,
    output: &Path,
    labels: Option<&Path>,
    num_classes: usize,
    width_multiplier: f32,
) -> Result<()> {
    if !(width_multiplier.is_finite() && width_multiplier > 0.0) {
        bail!("--width-multiplier must be positive, got {}", width_multiplier);
    }
    let arch = MobileNetV2Config::new(num_classes)
        .with_width_multiplier(width_multiplier)
        .with_bn_epsilon(PYTORCH_BN_EPSILON);
    let device = Default::default();
    let model = import_mobilenet_v2::<InferenceBackend>(&arch, weights, &device)
        .with_context(|| format!("Failed to import {}", weights.display()))?;

    let mut metadata = CheckpointMetadata::new("mobilenet_v2")
        .with_config(&arch)?
        .with_input(InputSpec::imagenet());
    if let Some(path) = labels {
        let labels = Labels::from_file(path)
            .with_context(|| format!("Failed to read labels {}", path.display()))?;
        if labels.len() != num_classes {
            bail!(
                "{} holds {} labels, the model has {} classes",
                path.display(),
                labels.len(),
                num_classes
            );
        }
        metadata = metadata.with_labels(labels.as_slice().iter().cloned());
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    save_checkpoint::<InferenceBackend, _>(&model, &metadata, output)?;
    println!(
        "Wrote {} and {}",
        output.display(),
        sidecar_path(output).display()
    );
    Ok(())
}

fn handle_config(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path, None)?;
    print!("{}", config.to_toml()?);
    Ok(())
}
