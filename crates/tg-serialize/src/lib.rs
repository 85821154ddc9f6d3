#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use tg_address::tensor_coords;
use tg_core::{IndexError, IntTensor, LoopNest, SpaceParams, TensorKind, TensorSpace, ValueRange};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;
const MAX_MANIFEST_BYTES: usize = 1_048_576;

/// Text form of one tensor element in an artifact file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Exact base-10 value, e.g. `-3`.
    Decimal,
    /// Low 16 bits as lowercase hex, e.g. `fffd` for `-3`.
    Hex16,
    /// Low 32 bits as lowercase hex, sized for ofmap accumulators.
    Hex32,
}

impl Encoding {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Decimal => "decimal",
            Self::Hex16 => "hex16",
            Self::Hex32 => "hex32",
        }
    }

    #[must_use]
    pub fn from_label(raw: &str) -> Option<Self> {
        match raw {
            "decimal" => Some(Self::Decimal),
            "hex16" => Some(Self::Hex16),
            "hex32" => Some(Self::Hex32),
            _ => None,
        }
    }

    #[must_use]
    pub fn file_extension(self) -> &'static str {
        match self {
            Self::Decimal => "txt",
            Self::Hex16 | Self::Hex32 => "mem",
        }
    }

    /// Encodes `value`. Hex forms mask to their width, so out-of-range
    /// magnitudes wrap instead of failing.
    #[must_use]
    pub fn encode(self, value: i64) -> String {
        match self {
            Self::Decimal => value.to_string(),
            Self::Hex16 => format!("{:x}", value & 0xFFFF),
            Self::Hex32 => format!("{:x}", value & 0xFFFF_FFFF),
        }
    }

    /// Inverse of [`Encoding::encode`]; hex tokens are sign-extended from
    /// their width.
    #[must_use]
    pub fn decode(self, token: &str) -> Option<i64> {
        if self != Self::Decimal && token.starts_with(['+', '-']) {
            return None;
        }
        match self {
            Self::Decimal => token.parse::<i64>().ok(),
            Self::Hex16 => u16::from_str_radix(token, 16)
                .ok()
                .map(|raw| i64::from(raw as i16)),
            Self::Hex32 => u32::from_str_radix(token, 16)
                .ok()
                .map(|raw| i64::from(raw as i32)),
        }
    }

    /// The value a decoded token of this encoding yields for `value`.
    #[must_use]
    pub fn wrap(self, value: i64) -> i64 {
        match self {
            Self::Decimal => value,
            Self::Hex16 => i64::from(value as i16),
            Self::Hex32 => i64::from(value as i32),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    Index(IndexError),
    KindMismatch {
        expected: TensorKind,
        found: TensorKind,
    },
    ShapeMismatch {
        kind: TensorKind,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    InvalidToken {
        line: usize,
        token: String,
        encoding: Encoding,
    },
    TokenCountMismatch {
        kind: TensorKind,
        expected: usize,
        found: usize,
    },
    InconsistentHalo {
        coords: Vec<usize>,
        first: i64,
        second: i64,
    },
    InvalidJson {
        diagnostic: String,
    },
    UnknownField {
        field: String,
    },
    VersionMismatch {
        expected: u32,
        found: u32,
    },
    IncompatiblePayload {
        reason: String,
    },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(error) => write!(f, "index error: {error}"),
            Self::KindMismatch { expected, found } => {
                write!(f, "traversal for {expected} applied to a {found} tensor")
            }
            Self::ShapeMismatch {
                kind,
                expected,
                found,
            } => write!(
                f,
                "{kind} shape mismatch: expected={expected:?} found={found:?}"
            ),
            Self::InvalidToken {
                line,
                token,
                encoding,
            } => write!(
                f,
                "invalid {encoding} token at line {line}: '{}'",
                bounded(token, 32)
            ),
            Self::TokenCountMismatch {
                kind,
                expected,
                found,
            } => write!(
                f,
                "{kind} token count mismatch: expected={expected} found={found}"
            ),
            Self::InconsistentHalo {
                coords,
                first,
                second,
            } => write!(
                f,
                "ifmap halo element {coords:?} emitted with different values: {first} then {second}"
            ),
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "schema version mismatch: expected={expected} found={found}"
                )
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
        }
    }
}

impl std::error::Error for SerializeError {}

impl From<IndexError> for SerializeError {
    fn from(value: IndexError) -> Self {
        Self::Index(value)
    }
}

/// Lazy token stream of one tensor in its tiled traversal order.
///
/// Calling [`serialize`] again yields an identical stream from the first
/// token; a clone resumes from wherever the original stood.
#[derive(Debug, Clone)]
pub struct TileTokens<'a> {
    tensor: &'a IntTensor,
    space: &'a TensorSpace,
    encoding: Encoding,
    nest: LoopNest,
}

impl Iterator for TileTokens<'_> {
    type Item = Result<String, SerializeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let point = self.nest.next()?;
        let token = tensor_coords(self.space, self.tensor.kind(), &point)
            .and_then(|coords| self.tensor.get(&coords))
            .map(|value| self.encoding.encode(value))
            .map_err(SerializeError::from);
        Some(token)
    }
}

/// Streams `tensor` in the traversal order of `kind`, one encoded token per
/// visited point.
pub fn serialize<'a>(
    tensor: &'a IntTensor,
    space: &'a TensorSpace,
    kind: TensorKind,
    encoding: Encoding,
) -> Result<TileTokens<'a>, SerializeError> {
    ensure_layout(tensor, space, kind)?;
    Ok(TileTokens {
        tensor,
        space,
        encoding,
        nest: LoopNest::new(space, kind.traversal_order()),
    })
}

/// Eager form of [`serialize`].
pub fn serialize_to_vec(
    tensor: &IntTensor,
    space: &TensorSpace,
    kind: TensorKind,
    encoding: Encoding,
) -> Result<Vec<String>, SerializeError> {
    serialize(tensor, space, kind, encoding)?.collect()
}

/// Rebuilds a tensor from a token stream produced by [`serialize`].
///
/// Ifmap halo elements appear once per tile that reads them and must agree.
/// Ifmap positions no tile reads (possible when the filter is narrower than
/// the stride) stay zero.
pub fn deserialize<I, S>(
    tokens: I,
    space: &TensorSpace,
    kind: TensorKind,
    encoding: Encoding,
) -> Result<IntTensor, SerializeError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut tensor = IntTensor::zeros(kind, space.shape(kind));
    let mut seen = vec![false; tensor.numel()];
    let expected = space.traversal_len(kind);
    let mut tokens = tokens.into_iter();
    let mut consumed = 0usize;

    for point in LoopNest::new(space, kind.traversal_order()) {
        let Some(raw) = tokens.next() else {
            return Err(SerializeError::TokenCountMismatch {
                kind,
                expected,
                found: consumed,
            });
        };
        consumed += 1;

        let token = raw.as_ref().trim();
        let value = encoding
            .decode(token)
            .ok_or_else(|| SerializeError::InvalidToken {
                line: consumed,
                token: token.to_string(),
                encoding,
            })?;

        let coords = tensor_coords(space, kind, &point)?;
        let linear = tensor.linear_index(&coords)?;
        if seen[linear] {
            let first = tensor.values()[linear];
            if first != value {
                return Err(SerializeError::InconsistentHalo {
                    coords,
                    first,
                    second: value,
                });
            }
            continue;
        }
        seen[linear] = true;
        tensor.set(&coords, value)?;
    }

    let surplus = tokens.count();
    if surplus > 0 {
        return Err(SerializeError::TokenCountMismatch {
            kind,
            expected,
            found: expected + surplus,
        });
    }

    Ok(tensor)
}

fn ensure_layout(
    tensor: &IntTensor,
    space: &TensorSpace,
    kind: TensorKind,
) -> Result<(), SerializeError> {
    if tensor.kind() != kind {
        return Err(SerializeError::KindMismatch {
            expected: kind,
            found: tensor.kind(),
        });
    }
    let expected = space.shape(kind);
    if tensor.shape() != expected.as_slice() {
        return Err(SerializeError::ShapeMismatch {
            kind,
            expected,
            found: tensor.shape().to_vec(),
        });
    }
    Ok(())
}

/// Deterministic 64-bit FNV-1a over a newline-terminated token stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHasher {
    state: u64,
}

impl StreamHasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: 0xcbf2_9ce4_8422_2325,
        }
    }

    pub fn write_line(&mut self, line: &str) {
        for byte in line.bytes().chain(std::iter::once(b'\n')) {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }

    #[must_use]
    pub fn finish(&self) -> String {
        format!("det64:{:016x}", self.state)
    }
}

impl Default for StreamHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use]
pub fn hash_lines<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = StreamHasher::new();
    for line in lines {
        hasher.write_line(line.as_ref());
    }
    hasher.finish()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactRecord {
    pub file: String,
    pub kind: TensorKind,
    pub encoding: Encoding,
    pub token_count: usize,
    pub source_hash: String,
}

/// Index of one generation run. Written after every artifact, so its
/// presence marks a complete set of vectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunManifest {
    pub schema_version: u32,
    pub name: String,
    pub space: SpaceParams,
    pub value_range: ValueRange,
    pub seed: u64,
    pub artifacts: Vec<ArtifactRecord>,
}

impl RunManifest {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        space: SpaceParams,
        value_range: ValueRange,
        seed: u64,
    ) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            name: name.into(),
            space,
            value_range,
            seed,
            artifacts: Vec::new(),
        }
    }

    #[must_use]
    pub fn artifact(&self, kind: TensorKind, encoding: Encoding) -> Option<&ArtifactRecord> {
        self.artifacts
            .iter()
            .find(|record| record.kind == kind && record.encoding == encoding)
    }
}

pub fn encode_manifest(manifest: &RunManifest) -> Result<String, SerializeError> {
    serde_json::to_string_pretty(manifest).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("manifest encoding failed: {error}"),
    })
}

pub fn decode_manifest(input: &str) -> Result<RunManifest, SerializeError> {
    if input.len() > MAX_MANIFEST_BYTES {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!(
                "manifest exceeds max bytes: actual={} max={MAX_MANIFEST_BYTES}",
                input.len()
            ),
        });
    }

    let manifest: RunManifest = serde_json::from_str(input).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            SerializeError::UnknownField { field }
        } else {
            SerializeError::InvalidJson {
                diagnostic: bounded(error.to_string().as_str(), 200),
            }
        }
    })?;

    if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
        return Err(SerializeError::VersionMismatch {
            expected: MANIFEST_SCHEMA_VERSION,
            found: manifest.schema_version,
        });
    }
    Ok(manifest)
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut boundary = max_len.min(input.len());
        while boundary > 0 && !input.is_char_boundary(boundary) {
            boundary -= 1;
        }
        format!("{}...", &input[..boundary])
    }
}
