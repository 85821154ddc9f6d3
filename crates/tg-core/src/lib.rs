#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// How the output-channel tile index is scaled when forming a flat `oc`.
///
/// `TileFactor` is the sound tiling `oc = oc1 * OC0 + oc0`. `TileCount`
/// reproduces the historical `oc = oc1 * OC1 + oc0`, which is only accepted
/// for shapes where it still enumerates `[0, OC)` exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStep {
    #[default]
    TileFactor,
    TileCount,
}

impl ChannelStep {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::TileFactor => "tile_factor",
            Self::TileCount => "tile_count",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorKind {
    Ifmap,
    Weight,
    Ofmap,
}

impl TensorKind {
    pub const ALL: [Self; 3] = [Self::Ifmap, Self::Weight, Self::Ofmap];

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Ifmap => "ifmap",
            Self::Weight => "weight",
            Self::Ofmap => "ofmap",
        }
    }

    /// Suffix used for artifact files, e.g. `layer2_weights.txt`.
    #[must_use]
    pub fn file_stem(self) -> &'static str {
        match self {
            Self::Ifmap => "ifmap",
            Self::Weight => "weights",
            Self::Ofmap => "ofmap",
        }
    }

    /// Serialization order for this tensor, outermost axis first.
    #[must_use]
    pub fn traversal_order(self) -> &'static [LoopAxis] {
        match self {
            Self::Ifmap => &IFMAP_ORDER,
            Self::Weight => &WEIGHT_ORDER,
            Self::Ofmap => &OFMAP_ORDER,
        }
    }

    #[must_use]
    pub fn rank(self) -> usize {
        match self {
            Self::Ifmap | Self::Ofmap => 3,
            Self::Weight => 4,
        }
    }
}

impl fmt::Display for TensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One loop of the tiled nest. `Iy0`/`Ix0` walk the input footprint of an
/// output tile and only appear in the ifmap traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopAxis {
    Oy1,
    Ox1,
    Oc1,
    Ic1,
    Fy,
    Fx,
    Oy0,
    Ox0,
    Oc0,
    Ic0,
    Iy0,
    Ix0,
}

impl LoopAxis {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Oy1 => "oy1",
            Self::Ox1 => "ox1",
            Self::Oc1 => "oc1",
            Self::Ic1 => "ic1",
            Self::Fy => "fy",
            Self::Fx => "fx",
            Self::Oy0 => "oy0",
            Self::Ox0 => "ox0",
            Self::Oc0 => "oc0",
            Self::Ic0 => "ic0",
            Self::Iy0 => "iy0",
            Self::Ix0 => "ix0",
        }
    }
}

impl fmt::Display for LoopAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Canonical compute nest: output-tile loops, then the double-buffer level,
/// then the register-file level.
pub const COMPUTE_ORDER: [LoopAxis; 10] = [
    LoopAxis::Oy1,
    LoopAxis::Ox1,
    LoopAxis::Oc1,
    LoopAxis::Ic1,
    LoopAxis::Fy,
    LoopAxis::Fx,
    LoopAxis::Oy0,
    LoopAxis::Ox0,
    LoopAxis::Oc0,
    LoopAxis::Ic0,
];

pub const IFMAP_ORDER: [LoopAxis; 6] = [
    LoopAxis::Oy1,
    LoopAxis::Ox1,
    LoopAxis::Ic1,
    LoopAxis::Iy0,
    LoopAxis::Ix0,
    LoopAxis::Ic0,
];

pub const WEIGHT_ORDER: [LoopAxis; 6] = [
    LoopAxis::Oc1,
    LoopAxis::Ic1,
    LoopAxis::Fy,
    LoopAxis::Fx,
    LoopAxis::Ic0,
    LoopAxis::Oc0,
];

pub const OFMAP_ORDER: [LoopAxis; 6] = [
    LoopAxis::Oy1,
    LoopAxis::Ox1,
    LoopAxis::Oc1,
    LoopAxis::Oy0,
    LoopAxis::Ox0,
    LoopAxis::Oc0,
];

/// Raw layer and tiling parameters as supplied by a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpaceParams {
    #[serde(rename = "OY")]
    pub oy: usize,
    #[serde(rename = "OX")]
    pub ox: usize,
    #[serde(rename = "OC")]
    pub oc: usize,
    #[serde(rename = "IC")]
    pub ic: usize,
    #[serde(rename = "FY")]
    pub fy: usize,
    #[serde(rename = "FX")]
    pub fx: usize,
    #[serde(rename = "Stride")]
    pub stride: usize,
    #[serde(rename = "OY0")]
    pub oy0: usize,
    #[serde(rename = "OX0")]
    pub ox0: usize,
    #[serde(rename = "OC0")]
    pub oc0: usize,
    #[serde(rename = "IC0")]
    pub ic0: usize,
    #[serde(default)]
    pub channel_step: ChannelStep,
}

impl SpaceParams {
    #[must_use]
    pub fn with_channel_step(mut self, channel_step: ChannelStep) -> Self {
        self.channel_step = channel_step;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceError {
    NonPositive {
        field: &'static str,
    },
    StrideTooSmall {
        stride: usize,
    },
    NotDivisible {
        dim: &'static str,
        size: usize,
        tile: &'static str,
        factor: usize,
    },
    SizeOverflow {
        field: &'static str,
    },
    LegacyChannelStep {
        oc0: usize,
        oc1: usize,
    },
    EmptyValueRange {
        low: i64,
        high: i64,
    },
}

impl fmt::Display for SpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositive { field } => write!(f, "{field} must be positive"),
            Self::StrideTooSmall { stride } => {
                write!(f, "Stride must be at least 1, found {stride}")
            }
            Self::NotDivisible {
                dim,
                size,
                tile,
                factor,
            } => write!(
                f,
                "{dim}={size} is not evenly divisible by tile factor {tile}={factor}"
            ),
            Self::SizeOverflow { field } => write!(f, "derived size {field} overflows usize"),
            Self::LegacyChannelStep { oc0, oc1 } => write!(
                f,
                "tile_count channel step requires OC1 == 1 or OC1 == OC0, found OC0={oc0} OC1={oc1}"
            ),
            Self::EmptyValueRange { low, high } => {
                write!(f, "value range [{low}, {high}) is empty")
            }
        }
    }
}

impl std::error::Error for SpaceError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    AxisOutOfRange {
        axis: LoopAxis,
        index: usize,
        extent: usize,
    },
    CoordOutOfRange {
        kind: TensorKind,
        dim: usize,
        index: usize,
        size: usize,
    },
    RankMismatch {
        kind: TensorKind,
        expected: usize,
        actual: usize,
    },
    LengthMismatch {
        kind: TensorKind,
        expected: usize,
        actual: usize,
    },
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AxisOutOfRange {
                axis,
                index,
                extent,
            } => write!(f, "loop index {axis}={index} outside [0, {extent})"),
            Self::CoordOutOfRange {
                kind,
                dim,
                index,
                size,
            } => write!(
                f,
                "{kind} coordinate out of bounds at dim={dim}: index={index}, size={size}"
            ),
            Self::RankMismatch {
                kind,
                expected,
                actual,
            } => write!(
                f,
                "{kind} index rank mismatch expected={expected}, actual={actual}"
            ),
            Self::LengthMismatch {
                kind,
                expected,
                actual,
            } => write!(
                f,
                "{kind} storage length mismatch expected={expected}, actual={actual}"
            ),
        }
    }
}

impl std::error::Error for IndexError {}

/// Validated dimensions of one convolution layer together with its tiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpace {
    params: SpaceParams,
    oy1: usize,
    ox1: usize,
    oc1: usize,
    ic1: usize,
    ix: usize,
    iy: usize,
    ix0: usize,
    iy0: usize,
}

impl TensorSpace {
    pub fn new(params: SpaceParams) -> Result<Self, SpaceError> {
        if params.stride < 1 {
            return Err(SpaceError::StrideTooSmall {
                stride: params.stride,
            });
        }
        for (field, value) in [
            ("OY", params.oy),
            ("OX", params.ox),
            ("OC", params.oc),
            ("IC", params.ic),
            ("FY", params.fy),
            ("FX", params.fx),
            ("OY0", params.oy0),
            ("OX0", params.ox0),
            ("OC0", params.oc0),
            ("IC0", params.ic0),
        ] {
            if value == 0 {
                return Err(SpaceError::NonPositive { field });
            }
        }

        let oy1 = tile_count("OY", params.oy, "OY0", params.oy0)?;
        let ox1 = tile_count("OX", params.ox, "OX0", params.ox0)?;
        let oc1 = tile_count("OC", params.oc, "OC0", params.oc0)?;
        let ic1 = tile_count("IC", params.ic, "IC0", params.ic0)?;

        if params.channel_step == ChannelStep::TileCount && oc1 != 1 && oc1 != params.oc0 {
            return Err(SpaceError::LegacyChannelStep {
                oc0: params.oc0,
                oc1,
            });
        }

        let ix = input_extent("IX", params.ox, params.stride, params.fx)?;
        let iy = input_extent("IY", params.oy, params.stride, params.fy)?;
        let ix0 = input_extent("IX0", params.ox0, params.stride, params.fx)?;
        let iy0 = input_extent("IY0", params.oy0, params.stride, params.fy)?;

        for (field, shape) in [
            ("ifmap", [ix, iy, params.ic, 1]),
            ("weight", [params.fx, params.fy, params.ic, params.oc]),
            ("ofmap", [params.ox, params.oy, params.oc, 1]),
        ] {
            shape
                .iter()
                .try_fold(1usize, |acc, size| acc.checked_mul(*size))
                .ok_or(SpaceError::SizeOverflow { field })?;
        }

        Ok(Self {
            params,
            oy1,
            ox1,
            oc1,
            ic1,
            ix,
            iy,
            ix0,
            iy0,
        })
    }

    #[must_use]
    pub fn params(&self) -> &SpaceParams {
        &self.params
    }

    #[must_use]
    pub fn oy(&self) -> usize {
        self.params.oy
    }

    #[must_use]
    pub fn ox(&self) -> usize {
        self.params.ox
    }

    #[must_use]
    pub fn oc(&self) -> usize {
        self.params.oc
    }

    #[must_use]
    pub fn ic(&self) -> usize {
        self.params.ic
    }

    #[must_use]
    pub fn fy(&self) -> usize {
        self.params.fy
    }

    #[must_use]
    pub fn fx(&self) -> usize {
        self.params.fx
    }

    #[must_use]
    pub fn stride(&self) -> usize {
        self.params.stride
    }

    #[must_use]
    pub fn oy0(&self) -> usize {
        self.params.oy0
    }

    #[must_use]
    pub fn ox0(&self) -> usize {
        self.params.ox0
    }

    #[must_use]
    pub fn oc0(&self) -> usize {
        self.params.oc0
    }

    #[must_use]
    pub fn ic0(&self) -> usize {
        self.params.ic0
    }

    #[must_use]
    pub fn oy1(&self) -> usize {
        self.oy1
    }

    #[must_use]
    pub fn ox1(&self) -> usize {
        self.ox1
    }

    #[must_use]
    pub fn oc1(&self) -> usize {
        self.oc1
    }

    #[must_use]
    pub fn ic1(&self) -> usize {
        self.ic1
    }

    #[must_use]
    pub fn ix(&self) -> usize {
        self.ix
    }

    #[must_use]
    pub fn iy(&self) -> usize {
        self.iy
    }

    #[must_use]
    pub fn ix0(&self) -> usize {
        self.ix0
    }

    #[must_use]
    pub fn iy0(&self) -> usize {
        self.iy0
    }

    #[must_use]
    pub fn channel_step(&self) -> ChannelStep {
        self.params.channel_step
    }

    /// Number of values `axis` takes in any traversal.
    #[must_use]
    pub fn extent(&self, axis: LoopAxis) -> usize {
        match axis {
            LoopAxis::Oy1 => self.oy1,
            LoopAxis::Ox1 => self.ox1,
            LoopAxis::Oc1 => self.oc1,
            LoopAxis::Ic1 => self.ic1,
            LoopAxis::Fy => self.params.fy,
            LoopAxis::Fx => self.params.fx,
            LoopAxis::Oy0 => self.params.oy0,
            LoopAxis::Ox0 => self.params.ox0,
            LoopAxis::Oc0 => self.params.oc0,
            LoopAxis::Ic0 => self.params.ic0,
            LoopAxis::Iy0 => self.iy0,
            LoopAxis::Ix0 => self.ix0,
        }
    }

    /// Logical shape of `kind`: ifmap `(IX, IY, IC)`, weight `(FX, FY, IC, OC)`,
    /// ofmap `(OX, OY, OC)`.
    #[must_use]
    pub fn shape(&self, kind: TensorKind) -> Vec<usize> {
        match kind {
            TensorKind::Ifmap => vec![self.ix, self.iy, self.params.ic],
            TensorKind::Weight => vec![
                self.params.fx,
                self.params.fy,
                self.params.ic,
                self.params.oc,
            ],
            TensorKind::Ofmap => vec![self.params.ox, self.params.oy, self.params.oc],
        }
    }

    /// Number of points visited by the serialization traversal of `kind`.
    #[must_use]
    pub fn traversal_len(&self, kind: TensorKind) -> usize {
        kind.traversal_order()
            .iter()
            .map(|axis| self.extent(*axis))
            .product()
    }
}

fn tile_count(
    dim: &'static str,
    size: usize,
    tile: &'static str,
    factor: usize,
) -> Result<usize, SpaceError> {
    if size % factor != 0 {
        return Err(SpaceError::NotDivisible {
            dim,
            size,
            tile,
            factor,
        });
    }
    Ok(size / factor)
}

fn input_extent(
    field: &'static str,
    outputs: usize,
    stride: usize,
    filter: usize,
) -> Result<usize, SpaceError> {
    (outputs - 1)
        .checked_mul(stride)
        .and_then(|span| span.checked_add(filter))
        .ok_or(SpaceError::SizeOverflow { field })
}

/// Half-open range `[low, high)` for generated ifmap and weight elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueRange {
    pub low: i64,
    pub high: i64,
}

impl ValueRange {
    pub const UNSIGNED_DIGIT: Self = Self { low: 0, high: 10 };
    pub const SIGNED_DIGIT: Self = Self { low: -10, high: 10 };

    pub fn new(low: i64, high: i64) -> Result<Self, SpaceError> {
        let range = Self { low, high };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<(), SpaceError> {
        if self.low >= self.high {
            return Err(SpaceError::EmptyValueRange {
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, value: i64) -> bool {
        self.low <= value && value < self.high
    }
}

impl Default for ValueRange {
    fn default() -> Self {
        Self::UNSIGNED_DIGIT
    }
}

/// Current position of a traversal. Axes that a traversal does not drive
/// stay at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TileIndex {
    pub oy1: usize,
    pub ox1: usize,
    pub oc1: usize,
    pub ic1: usize,
    pub fy: usize,
    pub fx: usize,
    pub oy0: usize,
    pub ox0: usize,
    pub oc0: usize,
    pub ic0: usize,
    pub iy0: usize,
    pub ix0: usize,
}

impl TileIndex {
    #[must_use]
    pub fn get(&self, axis: LoopAxis) -> usize {
        match axis {
            LoopAxis::Oy1 => self.oy1,
            LoopAxis::Ox1 => self.ox1,
            LoopAxis::Oc1 => self.oc1,
            LoopAxis::Ic1 => self.ic1,
            LoopAxis::Fy => self.fy,
            LoopAxis::Fx => self.fx,
            LoopAxis::Oy0 => self.oy0,
            LoopAxis::Ox0 => self.ox0,
            LoopAxis::Oc0 => self.oc0,
            LoopAxis::Ic0 => self.ic0,
            LoopAxis::Iy0 => self.iy0,
            LoopAxis::Ix0 => self.ix0,
        }
    }

    pub fn set(&mut self, axis: LoopAxis, value: usize) {
        let slot = match axis {
            LoopAxis::Oy1 => &mut self.oy1,
            LoopAxis::Ox1 => &mut self.ox1,
            LoopAxis::Oc1 => &mut self.oc1,
            LoopAxis::Ic1 => &mut self.ic1,
            LoopAxis::Fy => &mut self.fy,
            LoopAxis::Fx => &mut self.fx,
            LoopAxis::Oy0 => &mut self.oy0,
            LoopAxis::Ox0 => &mut self.ox0,
            LoopAxis::Oc0 => &mut self.oc0,
            LoopAxis::Ic0 => &mut self.ic0,
            LoopAxis::Iy0 => &mut self.iy0,
            LoopAxis::Ix0 => &mut self.ix0,
        };
        *slot = value;
    }

    /// Checks that every listed axis lies inside its extent in `space`.
    pub fn ensure_within(
        &self,
        space: &TensorSpace,
        axes: &[LoopAxis],
    ) -> Result<(), IndexError> {
        for axis in axes.iter().copied() {
            let index = self.get(axis);
            let extent = space.extent(axis);
            if index >= extent {
                return Err(IndexError::AxisOutOfRange {
                    axis,
                    index,
                    extent,
                });
            }
        }
        Ok(())
    }
}

/// Mixed-radix odometer over an ordered list of loop axes. The last axis
/// is the innermost loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNest {
    axes: Vec<LoopAxis>,
    extents: Vec<usize>,
    cursor: Vec<usize>,
    exhausted: bool,
}

impl LoopNest {
    #[must_use]
    pub fn new(space: &TensorSpace, axes: &[LoopAxis]) -> Self {
        let extents: Vec<usize> = axes.iter().map(|axis| space.extent(*axis)).collect();
        let exhausted = extents.contains(&0);
        Self {
            axes: axes.to_vec(),
            cursor: vec![0; axes.len()],
            extents,
            exhausted,
        }
    }

    /// Total number of points the nest visits from its start.
    #[must_use]
    pub fn point_count(&self) -> usize {
        self.extents.iter().product()
    }
}

impl Iterator for LoopNest {
    type Item = TileIndex;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let mut point = TileIndex::default();
        for (axis, value) in self.axes.iter().zip(self.cursor.iter()) {
            point.set(*axis, *value);
        }

        let mut wrapped = true;
        for slot in (0..self.cursor.len()).rev() {
            self.cursor[slot] += 1;
            if self.cursor[slot] < self.extents[slot] {
                wrapped = false;
                break;
            }
            self.cursor[slot] = 0;
        }
        self.exhausted = wrapped;

        Some(point)
    }
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut stride = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = stride;
        stride = stride.saturating_mul(shape[idx].max(1));
    }
    strides
}

/// Dense row-major integer tensor. Elements are `i64` so convolution sums of
/// bounded products never saturate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntTensor {
    kind: TensorKind,
    shape: Vec<usize>,
    strides: Vec<usize>,
    data: Vec<i64>,
}

impl IntTensor {
    #[must_use]
    pub fn zeros(kind: TensorKind, shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        let strides = contiguous_strides(&shape);
        Self {
            kind,
            shape,
            strides,
            data: vec![0; numel],
        }
    }

    pub fn from_vec(
        kind: TensorKind,
        shape: Vec<usize>,
        data: Vec<i64>,
    ) -> Result<Self, IndexError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(IndexError::LengthMismatch {
                kind,
                expected,
                actual: data.len(),
            });
        }
        let strides = contiguous_strides(&shape);
        Ok(Self {
            kind,
            shape,
            strides,
            data,
        })
    }

    /// Fills the tensor in row-major order, calling `fill` once per element.
    pub fn from_fn<F>(kind: TensorKind, shape: Vec<usize>, mut fill: F) -> Self
    where
        F: FnMut(&[usize]) -> i64,
    {
        let mut tensor = Self::zeros(kind, shape);
        let mut index = vec![0usize; tensor.shape.len()];
        for slot in 0..tensor.data.len() {
            let mut rem = slot;
            for (dim, stride) in tensor.strides.iter().enumerate() {
                index[dim] = rem / stride;
                rem %= stride;
            }
            tensor.data[slot] = fill(&index);
        }
        tensor
    }

    #[must_use]
    pub fn kind(&self) -> TensorKind {
        self.kind
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn values(&self) -> &[i64] {
        &self.data
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn linear_index(&self, index: &[usize]) -> Result<usize, IndexError> {
        if index.len() != self.shape.len() {
            return Err(IndexError::RankMismatch {
                kind: self.kind,
                expected: self.shape.len(),
                actual: index.len(),
            });
        }

        let mut linear = 0usize;
        for (dim, ((idx, size), stride)) in index
            .iter()
            .copied()
            .zip(self.shape.iter().copied())
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            if idx >= size {
                return Err(IndexError::CoordOutOfRange {
                    kind: self.kind,
                    dim,
                    index: idx,
                    size,
                });
            }
            linear += idx * stride;
        }
        Ok(linear)
    }

    pub fn get(&self, index: &[usize]) -> Result<i64, IndexError> {
        let linear = self.linear_index(index)?;
        Ok(self.data[linear])
    }

    pub fn set(&mut self, index: &[usize], value: i64) -> Result<(), IndexError> {
        let linear = self.linear_index(index)?;
        self.data[linear] = value;
        Ok(())
    }
}
