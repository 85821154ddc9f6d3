#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::Parser;
use serde_json::json;
use tg_conformance::{PRESET_NAMES, RunConfig, generate_vectors, parse_value_range};
use tg_core::ChannelStep;
use tg_serialize::Encoding;

#[derive(Parser)]
#[command(name = "gen_vectors")]
#[command(about = "Generate tiled convolution test vectors for accelerator testbenches")]
#[command(version)]
struct Cli {
    /// JSON run configuration
    #[arg(long, conflicts_with = "preset")]
    config: Option<PathBuf>,

    /// Built-in layer shape: tiny, layer1, layer2 or layer3
    #[arg(long)]
    preset: Option<String>,

    /// Artifact prefix, e.g. `layer2` for `layer2_ifmap.txt`
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// `unsigned`, `signed` or an explicit `LOW..HIGH`
    #[arg(long, allow_hyphen_values = true)]
    range: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    /// Skip the hex16 `.mem` images
    #[arg(long)]
    no_mem: bool,

    /// Also write `<name>_ofmap.mem` as hex16 or hex32
    #[arg(long)]
    ofmap_mem: Option<String>,

    /// Output channel as `oc1 * OC1 + oc0`, accepted only where it covers every channel once
    #[arg(long)]
    legacy_channel_step: bool,
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();

    let mut config = match (cli.config.as_deref(), cli.preset.as_deref()) {
        (Some(path), _) => RunConfig::load(path).map_err(|error| error.to_string())?,
        (None, preset) => RunConfig::preset(preset.unwrap_or("tiny")).map_err(|error| {
            format!(
                "{error}. usage: gen_vectors [--config FILE | --preset {}]",
                PRESET_NAMES.join("|")
            )
        })?,
    };
    if let Some(name) = cli.name {
        config.name = name;
    }
    if let Some(output_dir) = cli.output_dir {
        config.output_dir = output_dir;
    }
    if let Some(range) = cli.range.as_deref() {
        config.value_range = parse_value_range(range).map_err(|error| error.to_string())?;
    }
    if let Some(seed) = cli.seed {
        config.seed = Some(seed);
    }
    if cli.no_mem {
        config.emit_mem = false;
    }
    if let Some(raw) = cli.ofmap_mem.as_deref() {
        let encoding = Encoding::from_label(raw)
            .filter(|encoding| *encoding != Encoding::Decimal)
            .ok_or_else(|| format!("--ofmap-mem expects hex16 or hex32, got '{raw}'"))?;
        config.emit_ofmap_mem = true;
        config.ofmap_mem_encoding = encoding;
    }
    if cli.legacy_channel_step {
        config.space.channel_step = ChannelStep::TileCount;
    }

    let summary = generate_vectors(&config).map_err(|error| error.to_string())?;

    let artifacts: Vec<_> = summary
        .artifacts
        .iter()
        .map(|record| {
            json!({
                "file": record.file,
                "encoding": record.encoding.label(),
                "tokens": record.token_count,
                "hash": record.source_hash,
            })
        })
        .collect();
    let report = json!({
        "name": summary.name,
        "run_id": summary.run_id,
        "seed": summary.seed,
        "output_dir": summary.output_dir.display().to_string(),
        "artifacts": artifacts,
        "run_log": summary.run_log_path.display().to_string(),
        "manifest": summary.manifest_path.display().to_string(),
        "replay": format!("gen_vectors --config {}", summary.config_path.display()),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(|error| error.to_string())?
    );
    Ok(())
}
