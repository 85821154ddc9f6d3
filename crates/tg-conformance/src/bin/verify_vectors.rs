#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::Parser;
use tg_conformance::{RunConfig, load_manifest, verify_vectors};
use tg_core::{ChannelStep, TensorSpace};

#[derive(Parser)]
#[command(name = "verify_vectors")]
#[command(about = "Recompute a generated ofmap and compare it with the stored gold")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "data")]
    dir: PathBuf,

    /// Artifact prefix used at generation time
    #[arg(long)]
    name: String,

    /// Take the layer shape from a run configuration instead of the manifest
    #[arg(long, conflicts_with = "preset")]
    config: Option<PathBuf>,

    /// Take the layer shape from a built-in preset instead of the manifest
    #[arg(long)]
    preset: Option<String>,

    #[arg(long)]
    legacy_channel_step: bool,
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();

    let mut params = match (cli.config.as_deref(), cli.preset.as_deref()) {
        (Some(path), _) => RunConfig::load(path).map_err(|error| error.to_string())?.space,
        (None, Some(preset)) => RunConfig::preset(preset).map_err(|error| error.to_string())?.space,
        (None, None) => {
            load_manifest(&cli.dir, &cli.name)
                .map_err(|error| {
                    format!("{error}. pass --config or --preset when no manifest is present")
                })?
                .space
        }
    };
    if cli.legacy_channel_step {
        params.channel_step = ChannelStep::TileCount;
    }
    let space = TensorSpace::new(params).map_err(|error| error.to_string())?;

    let report = verify_vectors(&cli.dir, &cli.name, &space).map_err(|error| error.to_string())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(|error| error.to_string())?
    );
    if !report.passed() {
        return Err(format!(
            "verification failed for {}: ofmap_mismatches={} mem_checks_failed={} \
             manifest_findings={}",
            report.name,
            report.mismatch_count,
            report
                .mem_checks
                .iter()
                .filter(|check| check.mismatched_lines > 0)
                .count(),
            report.manifest_findings.len()
        ));
    }
    Ok(())
}
