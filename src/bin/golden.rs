use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::info;

use eegnet_golden::stimuli::{random_input, synthetic_network};
use eegnet_golden::{compare, Clip, GoldenModel, ModelOptions, NamedTensors, NetParams, Tensor, FUSED_TOLERANCE};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ClipArg {
    Balanced,
    Unbalanced,
    Off,
}

impl From<ClipArg> for Clip {
    fn from(c: ClipArg) -> Self {
        match c {
            ClipArg::Balanced => Clip::Balanced,
            ClipArg::Unbalanced => Clip::Unbalanced,
            ClipArg::Off => Clip::Off,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "golden", about = "Run the fixed-point EEGNet golden model on one input")]
struct Args {
    /// QuantLab config.json; overrides the dimension flags
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 22)]
    c: usize,
    #[arg(long, default_value_t = 1125)]
    t: usize,
    #[arg(long, default_value_t = 8)]
    f1: usize,
    #[arg(long, default_value_t = 2)]
    d: usize,
    #[arg(long, default_value_t = 4)]
    n: usize,
    /// Named-tensor JSON export; a synthetic network is generated when absent
    #[arg(long)]
    net: Option<PathBuf>,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long)]
    fuse: bool,
    #[arg(long)]
    reorder_bn: bool,
    #[arg(long)]
    no_round: bool,
    #[arg(long, value_enum, default_value_t = ClipArg::Balanced)]
    clip: ClipArg,
    /// Also run the other layer 1+2 variant and report the difference
    #[arg(long)]
    compare_fused: bool,
}

fn load_params(a: &Args) -> Result<NetParams> {
    match &a.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            NetParams::from_quantlab_json(&text).with_context(|| format!("parse {}", path.display()))
        }
        None => Ok(NetParams::new(a.c, a.t, a.f1, a.d, a.n)),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let a = Args::parse();
    let params = load_params(&a)?;
    let options = ModelOptions {
        round: !a.no_round,
        clip: a.clip.into(),
        reorder_bn: a.reorder_bn,
        fuse_layer_1_2: a.fuse,
    };
    if a.compare_fused && a.reorder_bn {
        bail!("--compare-fused needs the pool-first ordering (drop --reorder-bn)");
    }

    let (net, calibration): (NamedTensors, Option<Tensor<f64>>) = match &a.net {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            (NamedTensors::from_json(&text).with_context(|| format!("parse {}", path.display()))?, None)
        }
        None => {
            info!("generating synthetic network (seed {})", a.seed);
            let (net, x) = synthetic_network(&params, a.seed).context("synthetic network")?;
            (net, Some(x))
        }
    };

    let model = GoldenModel::new(&net, params, options).context("build golden model")?;
    println!("{}\n", model);

    let input = match &calibration {
        Some(x) => model.quantize_input(x)?,
        None => random_input(model.input_shape(), -60, 60, a.seed)?,
    };
    let output = model.infer(&input)?;
    println!("class scores: {:?}", output.data());

    if a.compare_fused {
        let other = GoldenModel::new(&net, params, ModelOptions { fuse_layer_1_2: !a.fuse, ..options })?;
        let mine = model.trace(&input)?;
        let theirs = other.trace(&input)?;
        // both pipelines end layer 2 at the same activation point
        let offset = if a.fuse { 0 } else { 1 };
        let (ours, other_l2) = (&mine[offset], &theirs[1 - offset]);
        let result = compare(other_l2, ours, FUSED_TOLERANCE)?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}
