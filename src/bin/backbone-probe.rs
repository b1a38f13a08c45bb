//! Build a backbone from a JSON config and run one forward pass on random
//! features.
//!
//! Prints a one-line JSON summary of the resulting pyramid to stdout:
//!
//! ```json
//! {"backbone":"convTransformer","levels":[{"shape":[1,512,256],"valid":256},...]}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use temporal_backbones::config::{read_json, ConvConfig, ConvTransformerConfig};
use temporal_backbones::registry::WeightInit;
use temporal_backbones::BackboneRegistry;

#[derive(Parser, Debug)]
#[command(
    name = "backbone-probe",
    about = "Run a temporal backbone once and report pyramid shapes"
)]
struct Args {
    /// Registered backbone name ("convTransformer" or "conv").
    #[arg(long, short = 'b', default_value = "convTransformer")]
    backbone: String,

    /// JSON file with the backbone config. Missing fields take defaults.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Batch size.
    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Sequence length. Must divide by scale_factor^branch_stages.
    #[arg(long, short = 't', default_value_t = 256)]
    length: usize,

    /// Number of valid steps per sequence; the rest is padding.
    #[arg(long)]
    valid: Option<usize>,

    /// Run in training mode (dropout, drop-path, strict length check).
    #[arg(long)]
    train: bool,
}

fn input_channels(name: &str, config: &serde_json::Value) -> anyhow::Result<usize> {
    let widths = match name {
        "convTransformer" => {
            serde_json::from_value::<ConvTransformerConfig>(config.clone())?.validate()?
        }
        "conv" => serde_json::from_value::<ConvConfig>(config.clone())?.validate()?,
        other => anyhow::bail!("unknown backbone {other:?}"),
    };
    Ok(widths.input_channels)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config: serde_json::Value = match &args.config {
        Some(path) => {
            read_json(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => serde_json::json!({}),
    };

    let valid = args.valid.unwrap_or(args.length);
    if valid == 0 || valid > args.length {
        anyhow::bail!("--valid must be in 1..={}, got {valid}", args.length);
    }

    let device = Device::Cpu;
    let registry = BackboneRegistry::with_builtin();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let backbone = registry.build(&args.backbone, &config, vb, WeightInit::Fresh)?;
    let channels = input_channels(&args.backbone, &config)?;

    tracing::info!(
        backbone = backbone.name(),
        channels,
        batch = args.batch,
        length = args.length,
        valid,
        "running forward pass"
    );

    let x = Tensor::randn(0f32, 1.0, (args.batch, channels, args.length), &device)?;
    let steps: Vec<u8> = (0..args.length).map(|t| u8::from(t < valid)).collect();
    let mask = Tensor::from_vec(steps, (1, 1, args.length), &device)?
        .repeat((args.batch, 1, 1))?;

    let start = std::time::Instant::now();
    let pyramid = backbone.forward_t(&x, &mask, args.train)?;
    tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "forward done");

    let levels = pyramid
        .iter()
        .map(|(feat, mask)| {
            let valid = mask
                .narrow(0, 0, 1)?
                .to_dtype(DType::U32)?
                .sum_all()?
                .to_scalar::<u32>()?;
            Ok(serde_json::json!({ "shape": feat.dims(), "valid": valid }))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    println!(
        "{}",
        serde_json::json!({ "backbone": backbone.name(), "levels": levels })
    );

    Ok(())
}
