#![forbid(unsafe_code)]

mod logging;
mod sink;
mod source;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tg_core::{
    COMPUTE_ORDER, ChannelStep, IndexError, IntTensor, LoopNest, SpaceError, SpaceParams,
    TensorKind, TensorSpace, ValueRange,
};
use tg_kernel_cpu::{KernelError, reference_convolution};
use tg_runtime::{EvidenceKind, RunContext};
use tg_serialize::{
    ArtifactRecord, Encoding, RunManifest, SerializeError, decode_manifest, deserialize,
    encode_manifest, hash_lines, serialize,
};

pub use logging::{RUN_LOG_SCHEMA_VERSION, StructuredRunLog, reason_code, run_log_lines};
pub use sink::{ArtifactSink, SinkReceipt};
pub use source::{ConstantSource, ElementSource, SeededSource, generate_tensor};

pub const PRESET_NAMES: [&str; 4] = ["tiny", "layer1", "layer2", "layer3"];
pub const MAX_REPORTED_MISMATCHES: usize = 64;
const MAX_CONFIG_BYTES: u64 = 1_048_576;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    Config { reason: String },
    Space(SpaceError),
    Kernel(KernelError),
    Serialize(SerializeError),
    Io { path: PathBuf, diagnostic: String },
}

impl HarnessError {
    pub(crate) fn io(path: &Path, error: &impl fmt::Display) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            diagnostic: error.to_string(),
        }
    }

    fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Ledger stage a failure of this kind is attributed to.
    #[must_use]
    pub fn evidence_stage(&self) -> EvidenceKind {
        match self {
            Self::Config { .. } | Self::Space(_) => EvidenceKind::Policy,
            Self::Kernel(_) => EvidenceKind::Compute,
            Self::Serialize(_) => EvidenceKind::Serialize,
            Self::Io { .. } => EvidenceKind::Write,
        }
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { reason } => write!(f, "invalid run configuration: {reason}"),
            Self::Space(error) => write!(f, "tensor space error: {error}"),
            Self::Kernel(error) => write!(f, "reference convolution failed: {error}"),
            Self::Serialize(error) => write!(f, "serialization failed: {error}"),
            Self::Io { path, diagnostic } => {
                write!(f, "i/o failure on {}: {diagnostic}", path.display())
            }
        }
    }
}

impl std::error::Error for HarnessError {}

impl From<SpaceError> for HarnessError {
    fn from(value: SpaceError) -> Self {
        Self::Space(value)
    }
}

impl From<KernelError> for HarnessError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<SerializeError> for HarnessError {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

impl From<IndexError> for HarnessError {
    fn from(value: IndexError) -> Self {
        Self::Serialize(SerializeError::Index(value))
    }
}

/// Everything one generation run needs. Loaded from JSON or built from a
/// preset, then adjusted by CLI flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub name: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    pub space: SpaceParams,
    #[serde(default)]
    pub value_range: ValueRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default = "default_emit_mem")]
    pub emit_mem: bool,
    #[serde(default)]
    pub emit_ofmap_mem: bool,
    #[serde(default = "default_ofmap_mem_encoding")]
    pub ofmap_mem_encoding: Encoding,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_emit_mem() -> bool {
    true
}

fn default_ofmap_mem_encoding() -> Encoding {
    Encoding::Hex16
}

impl RunConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, space: SpaceParams) -> Self {
        Self {
            name: name.into(),
            output_dir: default_output_dir(),
            space,
            value_range: ValueRange::default(),
            seed: None,
            emit_mem: default_emit_mem(),
            emit_ofmap_mem: false,
            ofmap_mem_encoding: default_ofmap_mem_encoding(),
        }
    }

    pub fn preset(name: &str) -> Result<Self, HarnessError> {
        let space = space_preset(name).ok_or_else(|| {
            HarnessError::config(format!(
                "unknown preset '{name}', expected one of {}",
                PRESET_NAMES.join("|")
            ))
        })?;
        Ok(Self::new(name, space))
    }

    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let metadata = fs::metadata(path).map_err(|error| HarnessError::io(path, &error))?;
        let size = metadata.len();
        if size > MAX_CONFIG_BYTES {
            return Err(HarnessError::config(format!(
                "config {} exceeds max bytes: actual={size} max={MAX_CONFIG_BYTES}",
                path.display()
            )));
        }
        let raw = fs::read_to_string(path).map_err(|error| HarnessError::io(path, &error))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, HarnessError> {
        serde_json::from_str(raw).map_err(|error| {
            HarnessError::config(format!(
                "config parse failure: {}",
                bounded(&error.to_string(), 200)
            ))
        })
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks everything that can be rejected before any file is touched.
    pub fn validate(&self) -> Result<TensorSpace, HarnessError> {
        validate_name(&self.name)?;
        self.value_range.validate()?;
        if self.emit_ofmap_mem && self.ofmap_mem_encoding == Encoding::Decimal {
            return Err(HarnessError::config(
                "ofmap_mem_encoding must be hex16 or hex32",
            ));
        }
        Ok(TensorSpace::new(self.space)?)
    }

    /// Artifacts this configuration produces, in write order.
    #[must_use]
    pub fn artifact_plan(&self) -> Vec<ArtifactPlan> {
        let mut plan: Vec<ArtifactPlan> = TensorKind::ALL
            .into_iter()
            .map(|kind| ArtifactPlan {
                kind,
                encoding: Encoding::Decimal,
            })
            .collect();
        if self.emit_mem {
            plan.push(ArtifactPlan {
                kind: TensorKind::Ifmap,
                encoding: Encoding::Hex16,
            });
            plan.push(ArtifactPlan {
                kind: TensorKind::Weight,
                encoding: Encoding::Hex16,
            });
        }
        if self.emit_ofmap_mem {
            plan.push(ArtifactPlan {
                kind: TensorKind::Ofmap,
                encoding: self.ofmap_mem_encoding,
            });
        }
        plan
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactPlan {
    pub kind: TensorKind,
    pub encoding: Encoding,
}

impl ArtifactPlan {
    /// `<name>_ifmap.txt`, `<name>_weights.mem`, ...
    #[must_use]
    pub fn file_name(&self, name: &str) -> String {
        format!(
            "{name}_{}.{}",
            self.kind.file_stem(),
            self.encoding.file_extension()
        )
    }
}

#[must_use]
pub fn manifest_file_name(name: &str) -> String {
    format!("{name}_manifest.json")
}

#[must_use]
pub fn run_log_file_name(name: &str) -> String {
    format!("{name}_run.jsonl")
}

#[must_use]
pub fn config_file_name(name: &str) -> String {
    format!("{name}_config.json")
}

/// Layer shapes used by the accelerator testbenches.
#[must_use]
pub fn space_preset(name: &str) -> Option<SpaceParams> {
    let (layer, tiles) = match name {
        "tiny" => ([3, 3, 2, 2, 2, 2, 1], [3, 3, 2, 2]),
        "layer1" => ([112, 112, 64, 3, 7, 7, 2], [4, 4, 4, 3]),
        "layer2" => ([56, 56, 64, 64, 3, 3, 1], [4, 4, 4, 4]),
        "layer3" => ([28, 28, 128, 128, 3, 3, 1], [4, 4, 4, 4]),
        _ => return None,
    };
    let [oy, ox, oc, ic, fy, fx, stride] = layer;
    let [oy0, ox0, oc0, ic0] = tiles;
    Some(SpaceParams {
        oy,
        ox,
        oc,
        ic,
        fy,
        fx,
        stride,
        oy0,
        ox0,
        oc0,
        ic0,
        channel_step: ChannelStep::TileFactor,
    })
}

/// Accepts `unsigned`, `signed`, or an explicit half-open `LOW..HIGH`.
pub fn parse_value_range(raw: &str) -> Result<ValueRange, HarnessError> {
    match raw.trim() {
        "unsigned" => Ok(ValueRange::UNSIGNED_DIGIT),
        "signed" => Ok(ValueRange::SIGNED_DIGIT),
        other => {
            let (low, high) = other.split_once("..").ok_or_else(|| {
                HarnessError::config(format!(
                    "value range '{other}' must be unsigned, signed, or LOW..HIGH"
                ))
            })?;
            let parse = |part: &str| {
                part.trim().parse::<i64>().map_err(|error| {
                    HarnessError::config(format!("value range bound '{part}' is invalid: {error}"))
                })
            };
            Ok(ValueRange::new(parse(low)?, parse(high)?)?)
        }
    }
}

fn validate_name(name: &str) -> Result<(), HarnessError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(HarnessError::config(format!(
            "artifact name '{}' must be non-empty ascii [A-Za-z0-9_.-] and not start with '.'",
            bounded(name, 64)
        )))
    }
}

fn bounded(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub name: String,
    pub run_id: String,
    pub seed: u64,
    pub output_dir: PathBuf,
    pub config_path: PathBuf,
    pub run_log_path: PathBuf,
    pub manifest_path: PathBuf,
    pub artifacts: Vec<ArtifactRecord>,
    pub ledger_entries: usize,
}

impl RunSummary {
    #[must_use]
    pub fn artifact(&self, kind: TensorKind, encoding: Encoding) -> Option<&ArtifactRecord> {
        self.artifacts
            .iter()
            .find(|record| record.kind == kind && record.encoding == encoding)
    }
}

/// Generates one full set of vectors. A seed missing from `config` is drawn
/// from the thread rng and recorded in the resolved config and manifest.
pub fn generate_vectors(config: &RunConfig) -> Result<RunSummary, HarnessError> {
    let seed = config.seed.unwrap_or_else(|| rand::rng().random());
    let resolved = config.clone().with_seed(seed);
    resolved.validate()?;
    let mut source = SeededSource::new(seed, resolved.value_range);
    generate_vectors_with_source(&resolved, &mut source, seed)
}

/// Generation pipeline with an explicit element source. `seed` is only
/// recorded; `source` decides the values. Ifmap elements are drawn first,
/// then weights, each in row-major order of its natural layout.
///
/// Once the configuration validates, `<name>_run.jsonl` is written whether
/// or not the run succeeds; a failed run logs a `fail` line and writes no
/// manifest.
pub fn generate_vectors_with_source(
    config: &RunConfig,
    source: &mut dyn ElementSource,
    seed: u64,
) -> Result<RunSummary, HarnessError> {
    let space = config.validate()?;
    let mut ctx = RunContext::new(
        format!("{}-{seed:016x}", config.name),
        space.channel_step(),
    );
    let config_path = config.output_dir.join(config_file_name(&config.name));
    let run_log_path = config.output_dir.join(run_log_file_name(&config.name));

    let outcome = run_generation(&mut ctx, config, &space, source, seed, &config_path);
    if let Err(error) = &outcome {
        ctx.record_failure(error.evidence_stage(), "generation", error);
    }
    let replay_command = format!("gen_vectors --config {}", config_path.display());
    write_run_log(&ctx, config, &run_log_path, &replay_command)?;
    let manifest = outcome?;

    // The manifest marks a complete run, so it goes last.
    let manifest_path = config.output_dir.join(manifest_file_name(&config.name));
    let mut manifest_sink = ArtifactSink::create(&manifest_path)?;
    manifest_sink.write_line(&encode_manifest(&manifest)?)?;
    manifest_sink.commit()?;

    Ok(RunSummary {
        name: config.name.clone(),
        run_id: ctx.run_id().to_string(),
        seed,
        output_dir: config.output_dir.clone(),
        config_path,
        run_log_path,
        manifest_path,
        artifacts: manifest.artifacts,
        ledger_entries: ctx.ledger().len(),
    })
}

fn run_generation(
    ctx: &mut RunContext,
    config: &RunConfig,
    space: &TensorSpace,
    source: &mut dyn ElementSource,
    seed: u64,
    config_path: &Path,
) -> Result<RunManifest, HarnessError> {
    let ifmap = generate_tensor(source, space, TensorKind::Ifmap);
    ctx.record_generated(TensorKind::Ifmap, ifmap.numel(), seed);
    let weight = generate_tensor(source, space, TensorKind::Weight);
    ctx.record_generated(TensorKind::Weight, weight.numel(), seed);

    let ofmap = reference_convolution(&ifmap, &weight, space)?;
    ctx.ledger_mut().record(
        EvidenceKind::Compute,
        format!(
            "ofmap {:?} accumulated over {} tiled multiply-accumulates",
            ofmap.shape(),
            LoopNest::new(space, &COMPUTE_ORDER).point_count()
        ),
    );

    let mut manifest = RunManifest::new(
        config.name.clone(),
        config.space,
        config.value_range,
        seed,
    );
    for plan in config.artifact_plan() {
        let tensor = match plan.kind {
            TensorKind::Ifmap => &ifmap,
            TensorKind::Weight => &weight,
            TensorKind::Ofmap => &ofmap,
        };
        let record = write_tensor_artifact(ctx, config, space, tensor, plan)?;
        manifest.artifacts.push(record);
    }

    let resolved = serde_json::to_string_pretty(&config.clone().with_seed(seed)).map_err(|error| {
        HarnessError::config(format!("failed to encode resolved config: {error}"))
    })?;
    write_document(ctx, config_path, &resolved)?;
    Ok(manifest)
}

fn write_run_log(
    ctx: &RunContext,
    config: &RunConfig,
    path: &Path,
    replay_command: &str,
) -> Result<(), HarnessError> {
    let space_json = serde_json::to_value(config.space)
        .map_err(|error| HarnessError::config(format!("failed to encode space: {error}")))?;
    let mut sink = ArtifactSink::create(path)?;
    for line in run_log_lines(ctx, replay_command, &space_json)? {
        sink.write_line(&line)?;
    }
    sink.commit()?;
    Ok(())
}

fn write_tensor_artifact(
    ctx: &mut RunContext,
    config: &RunConfig,
    space: &TensorSpace,
    tensor: &IntTensor,
    plan: ArtifactPlan,
) -> Result<ArtifactRecord, HarnessError> {
    let file = plan.file_name(&config.name);
    let mut sink = ArtifactSink::create(config.output_dir.join(&file))?;
    for token in serialize(tensor, space, plan.kind, plan.encoding)? {
        sink.write_line(&token?)?;
    }
    let expected = space.traversal_len(plan.kind);
    if sink.line_count() != expected {
        return Err(SerializeError::TokenCountMismatch {
            kind: plan.kind,
            expected,
            found: sink.line_count(),
        }
        .into());
    }
    let receipt = sink.commit()?;
    ctx.ledger_mut().record_artifact(
        EvidenceKind::Serialize,
        file.clone(),
        receipt.line_count,
        format!(
            "{} serialized in tile order as {} ({})",
            plan.kind, plan.encoding, receipt.source_hash
        ),
    );
    ctx.ledger_mut().record_artifact(
        EvidenceKind::Write,
        file.clone(),
        receipt.line_count,
        format!("persisted {}", receipt.path.display()),
    );
    Ok(ArtifactRecord {
        file,
        kind: plan.kind,
        encoding: plan.encoding,
        token_count: receipt.line_count,
        source_hash: receipt.source_hash,
    })
}

fn write_document(ctx: &mut RunContext, path: &Path, body: &str) -> Result<(), HarnessError> {
    let mut sink = ArtifactSink::create(path)?;
    sink.write_line(body)?;
    let receipt = sink.commit()?;
    ctx.ledger_mut().record_artifact(
        EvidenceKind::Write,
        path.file_name()
            .map_or_else(|| path.display().to_string(), |file| file.to_string_lossy().into_owned()),
        receipt.line_count,
        format!("persisted {}", receipt.path.display()),
    );
    Ok(())
}

pub fn load_manifest(dir: &Path, name: &str) -> Result<RunManifest, HarnessError> {
    validate_name(name)?;
    let path = dir.join(manifest_file_name(name));
    let raw = fs::read_to_string(&path).map_err(|error| HarnessError::io(&path, &error))?;
    Ok(decode_manifest(&raw)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfmapMismatch {
    pub ox: usize,
    pub oy: usize,
    pub oc: usize,
    pub gold: i64,
    pub computed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemCheck {
    pub file: String,
    pub encoding: Encoding,
    pub mismatched_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub name: String,
    pub ofmap_elements: usize,
    pub mismatch_count: usize,
    /// First [`MAX_REPORTED_MISMATCHES`] differences in ofmap row-major order.
    pub mismatches: Vec<OfmapMismatch>,
    pub mem_checks: Vec<MemCheck>,
    pub manifest_checked: bool,
    pub manifest_findings: Vec<String>,
    pub evidence: Vec<String>,
}

impl VerifyReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatch_count == 0
            && self.mem_checks.iter().all(|check| check.mismatched_lines == 0)
            && self.manifest_findings.is_empty()
    }
}

/// Re-reads a directory of vectors, recomputes the ofmap from the decimal
/// ifmap and weights, and compares it with the stored gold. Any `.mem`
/// images and the manifest, when present, are cross-checked as well.
pub fn verify_vectors(
    dir: &Path,
    name: &str,
    space: &TensorSpace,
) -> Result<VerifyReport, HarnessError> {
    validate_name(name)?;
    let mut ctx = RunContext::new(format!("verify-{name}"), space.channel_step());
    let manifest = if dir.join(manifest_file_name(name)).exists() {
        Some(load_manifest(dir, name)?)
    } else {
        None
    };

    let mut decimal_lines: BTreeMap<TensorKind, Vec<String>> = BTreeMap::new();
    let mut tensors: BTreeMap<TensorKind, IntTensor> = BTreeMap::new();
    for kind in TensorKind::ALL {
        let plan = ArtifactPlan {
            kind,
            encoding: Encoding::Decimal,
        };
        let path = dir.join(plan.file_name(name));
        let lines = read_lines(&path)?;
        let tensor = deserialize(&lines, space, kind, Encoding::Decimal)?;
        ctx.ledger_mut().record_artifact(
            EvidenceKind::Verify,
            plan.file_name(name),
            lines.len(),
            format!("decoded {kind} from decimal tokens"),
        );
        decimal_lines.insert(kind, lines);
        tensors.insert(kind, tensor);
    }

    let (Some(ifmap), Some(weight), Some(gold)) = (
        tensors.get(&TensorKind::Ifmap),
        tensors.get(&TensorKind::Weight),
        tensors.get(&TensorKind::Ofmap),
    ) else {
        return Err(HarnessError::config("verification inputs incomplete"));
    };
    let computed = reference_convolution(ifmap, weight, space)?;

    let mut mismatch_count = 0usize;
    let mut mismatches = Vec::new();
    for ox in 0..space.ox() {
        for oy in 0..space.oy() {
            for oc in 0..space.oc() {
                let index = [ox, oy, oc];
                let gold_value = gold.get(&index)?;
                let computed_value = computed.get(&index)?;
                if gold_value != computed_value {
                    mismatch_count += 1;
                    if mismatches.len() < MAX_REPORTED_MISMATCHES {
                        mismatches.push(OfmapMismatch {
                            ox,
                            oy,
                            oc,
                            gold: gold_value,
                            computed: computed_value,
                        });
                    }
                }
            }
        }
    }
    if mismatch_count == 0 {
        ctx.ledger_mut().record(
            EvidenceKind::Verify,
            format!("ofmap matches recomputation over {} elements", gold.numel()),
        );
    } else {
        ctx.record_failure(
            EvidenceKind::Verify,
            "ofmap compare",
            &format!("{mismatch_count} of {} elements differ", gold.numel()),
        );
    }

    let mut mem_checks = Vec::new();
    for kind in TensorKind::ALL {
        let encoding = manifest
            .as_ref()
            .and_then(|manifest| {
                manifest
                    .artifacts
                    .iter()
                    .find(|record| record.kind == kind && record.encoding != Encoding::Decimal)
            })
            .map(|record| record.encoding);
        let file = format!("{name}_{}.mem", kind.file_stem());
        let path = dir.join(&file);
        if !path.exists() {
            continue;
        }
        let mem_lines = read_lines(&path)?;
        let encoding = encoding.unwrap_or_else(|| infer_mem_encoding(&mem_lines));
        let decimal = decimal_lines.get(&kind).map_or(&[][..], Vec::as_slice);
        let mismatched_lines = mem_lines.len().abs_diff(decimal.len())
            + mem_lines
                .iter()
                .zip(decimal)
                .filter(|(mem, dec)| {
                    let expected = Encoding::Decimal
                        .decode(dec.trim())
                        .map(|value| encoding.wrap(value));
                    encoding.decode(mem.trim()) != expected
                })
                .count();
        if mismatched_lines == 0 {
            ctx.ledger_mut().record_artifact(
                EvidenceKind::Verify,
                file.clone(),
                mem_lines.len(),
                format!("{encoding} image agrees with decimal tokens"),
            );
        } else {
            ctx.record_failure(
                EvidenceKind::Verify,
                &format!("{file} compare"),
                &format!("{mismatched_lines} lines disagree with decimal tokens"),
            );
        }
        mem_checks.push(MemCheck {
            file,
            encoding,
            mismatched_lines,
        });
    }

    let mut manifest_findings = Vec::new();
    if let Some(manifest) = manifest.as_ref() {
        manifest_findings = check_manifest(dir, manifest, space)?;
        for finding in &manifest_findings {
            ctx.record_failure(EvidenceKind::Verify, "manifest check", finding);
        }
    }

    Ok(VerifyReport {
        name: name.to_string(),
        ofmap_elements: gold.numel(),
        mismatch_count,
        mismatches,
        mem_checks,
        manifest_checked: manifest.is_some(),
        manifest_findings,
        evidence: ctx
            .ledger()
            .entries()
            .iter()
            .map(|entry| format!("{}: {}", entry.kind.label(), entry.summary))
            .collect(),
    })
}

fn check_manifest(
    dir: &Path,
    manifest: &RunManifest,
    space: &TensorSpace,
) -> Result<Vec<String>, HarnessError> {
    let mut findings = Vec::new();
    if manifest.space != *space.params() {
        findings.push(format!(
            "manifest space {:?} differs from verification space {:?}",
            manifest.space,
            space.params()
        ));
    }
    for record in &manifest.artifacts {
        let path = dir.join(&record.file);
        if !path.exists() {
            findings.push(format!("{} listed in manifest but missing", record.file));
            continue;
        }
        let lines = read_lines(&path)?;
        if lines.len() != record.token_count {
            findings.push(format!(
                "{} has {} tokens, manifest records {}",
                record.file,
                lines.len(),
                record.token_count
            ));
        }
        let hash = hash_lines(&lines);
        if hash != record.source_hash {
            findings.push(format!(
                "{} hash {hash} differs from manifest {}",
                record.file, record.source_hash
            ));
        }
    }
    Ok(findings)
}

/// Width of a `.mem` image with no manifest record. Hex16 tokens never
/// exceed four digits, so any longer token marks a hex32 image.
fn infer_mem_encoding(lines: &[String]) -> Encoding {
    if lines.iter().any(|line| line.trim().len() > 4) {
        Encoding::Hex32
    } else {
        Encoding::Hex16
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>, HarnessError> {
    let raw = fs::read_to_string(path).map_err(|error| HarnessError::io(path, &error))?;
    Ok(raw.lines().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use proptest::prelude::*;
    use tg_core::{ChannelStep, SpaceError, TensorKind, TensorSpace, ValueRange};
    use tg_serialize::Encoding;

    use super::{
        ArtifactPlan, HarnessError, PRESET_NAMES, RunConfig, infer_mem_encoding,
        parse_value_range, space_preset,
    };

    #[test]
    fn every_preset_builds_a_valid_space() {
        for name in PRESET_NAMES {
            let params = space_preset(name).expect("preset should exist");
            TensorSpace::new(params).expect("preset space should validate");
        }
        assert!(space_preset("layer9").is_none());
    }

    #[test]
    fn layer1_preset_matches_strided_layer() {
        let space = TensorSpace::new(space_preset("layer1").expect("layer1"))
            .expect("layer1 should validate");
        assert_eq!(space.ix(), 229);
        assert_eq!(space.ic1(), 1);
        assert_eq!(space.stride(), 2);
    }

    #[test]
    fn value_range_parsing() {
        assert_eq!(
            parse_value_range("unsigned").expect("unsigned"),
            ValueRange::UNSIGNED_DIGIT
        );
        assert_eq!(
            parse_value_range("signed").expect("signed"),
            ValueRange::SIGNED_DIGIT
        );
        assert_eq!(
            parse_value_range("-128..128").expect("explicit"),
            ValueRange { low: -128, high: 128 }
        );
        let err = parse_value_range("5..5").expect_err("empty range must fail");
        assert!(matches!(
            err,
            HarnessError::Space(SpaceError::EmptyValueRange { low: 5, high: 5 })
        ));
        assert!(matches!(
            parse_value_range("wide"),
            Err(HarnessError::Config { .. })
        ));
    }

    #[test]
    fn artifact_plan_names_follow_layout() {
        let mut config = RunConfig::preset("tiny").expect("tiny");
        let names: Vec<String> = config
            .artifact_plan()
            .iter()
            .map(|plan| plan.file_name(&config.name))
            .collect();
        assert_eq!(
            names,
            [
                "tiny_ifmap.txt",
                "tiny_weights.txt",
                "tiny_ofmap.txt",
                "tiny_ifmap.mem",
                "tiny_weights.mem"
            ]
        );

        config.emit_mem = false;
        config.emit_ofmap_mem = true;
        config.ofmap_mem_encoding = Encoding::Hex32;
        let plan = config.artifact_plan();
        assert_eq!(plan.len(), 4);
        assert_eq!(
            plan[3],
            ArtifactPlan {
                kind: TensorKind::Ofmap,
                encoding: Encoding::Hex32
            }
        );
    }

    #[test]
    fn config_json_defaults_and_unknown_fields() {
        let raw = r#"{
            "name": "custom",
            "space": {"OY": 4, "OX": 4, "OC": 4, "IC": 2, "FY": 3, "FX": 3, "Stride": 1,
                      "OY0": 2, "OX0": 2, "OC0": 2, "IC0": 2}
        }"#;
        let config = RunConfig::from_json(raw).expect("minimal config should parse");
        assert!(config.emit_mem);
        assert!(!config.emit_ofmap_mem);
        assert_eq!(config.value_range, ValueRange::UNSIGNED_DIGIT);
        assert_eq!(config.space.channel_step, ChannelStep::TileFactor);
        assert!(config.seed.is_none());

        let err = RunConfig::from_json(&raw.replace("\"name\"", "\"bogus\": 1, \"name\""))
            .expect_err("unknown field must fail");
        assert!(err.to_string().contains("unknown field"), "{err}");
    }

    #[test]
    fn load_rejects_oversized_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("huge.json");
        fs::write(&path, " ".repeat(super::MAX_CONFIG_BYTES as usize + 1))
            .expect("oversized config should be writable");
        let err = RunConfig::load(&path).expect_err("oversized config must fail");
        assert!(err.to_string().contains("exceeds max bytes"));
    }

    #[test]
    fn validate_rejects_bad_names_and_decimal_ofmap_mem() {
        let mut config = RunConfig::preset("tiny").expect("tiny");
        config.name = "../escape".to_string();
        assert!(matches!(config.validate(), Err(HarnessError::Config { .. })));

        config.name = "tiny".to_string();
        config.emit_ofmap_mem = true;
        config.ofmap_mem_encoding = Encoding::Decimal;
        assert!(matches!(config.validate(), Err(HarnessError::Config { .. })));
    }

    #[test]
    fn validate_surfaces_space_errors() {
        let mut config = RunConfig::preset("tiny").expect("tiny");
        config.space.ox0 = 2;
        let err = config.validate().expect_err("3 is not divisible by 2");
        assert!(matches!(
            err,
            HarnessError::Space(SpaceError::NotDivisible { .. })
        ));
    }

    #[test]
    fn mem_width_inferred_from_token_length() {
        let short = vec!["fffd".to_string(), "48".to_string()];
        assert_eq!(infer_mem_encoding(&short), Encoding::Hex16);
        let wide = vec!["48".to_string(), "4e200".to_string()];
        assert_eq!(infer_mem_encoding(&wide), Encoding::Hex32);
    }

    #[test]
    fn failures_map_to_ledger_stages() {
        let io = HarnessError::Io {
            path: "out.txt".into(),
            diagnostic: "disk full".to_string(),
        };
        assert_eq!(io.evidence_stage(), tg_runtime::EvidenceKind::Write);
        let space = HarnessError::Space(SpaceError::StrideTooSmall { stride: 0 });
        assert_eq!(space.evidence_stage(), tg_runtime::EvidenceKind::Policy);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn explicit_value_ranges_parse(low in -1000i64..1000, width in 1i64..1000) {
            let high = low + width;
            let range = parse_value_range(&format!("{low}..{high}"))
                .expect("non-empty explicit range should parse");
            prop_assert_eq!(range, ValueRange { low, high });
        }
    }
}
