#![forbid(unsafe_code)]

//! Pure mappings from tile-loop positions to flat tensor coordinates.
//!
//! The compute mapping drives the reference convolution. The three
//! serialization mappings each project a different six-loop traversal onto
//! one tensor's coordinate space. Every mapping range-checks the loop indices
//! it reads and the coordinates it produces.

use tg_core::{
    COMPUTE_ORDER, ChannelStep, IFMAP_ORDER, IndexError, OFMAP_ORDER, TensorKind, TensorSpace,
    TileIndex, WEIGHT_ORDER,
};

/// Flat coordinates touched by one multiply-accumulate of the compute nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputeCoords {
    pub ox: usize,
    pub oy: usize,
    pub oc: usize,
    pub ix: usize,
    pub iy: usize,
    pub ic: usize,
    pub fx: usize,
    pub fy: usize,
}

impl ComputeCoords {
    #[must_use]
    pub fn ifmap(&self) -> [usize; 3] {
        [self.ix, self.iy, self.ic]
    }

    #[must_use]
    pub fn weight(&self) -> [usize; 4] {
        [self.fx, self.fy, self.ic, self.oc]
    }

    #[must_use]
    pub fn ofmap(&self) -> [usize; 3] {
        [self.ox, self.oy, self.oc]
    }
}

/// `oc` for a given output-channel tile and in-tile offset under the space's
/// channel step.
#[must_use]
pub fn output_channel(space: &TensorSpace, oc1: usize, oc0: usize) -> usize {
    match space.channel_step() {
        ChannelStep::TileFactor => oc1 * space.oc0() + oc0,
        ChannelStep::TileCount => oc1 * space.oc1() + oc0,
    }
}

#[must_use]
pub fn input_channel(space: &TensorSpace, ic1: usize, ic0: usize) -> usize {
    ic1 * space.ic0() + ic0
}

pub fn compute_coords(
    space: &TensorSpace,
    point: &TileIndex,
) -> Result<ComputeCoords, IndexError> {
    point.ensure_within(space, &COMPUTE_ORDER)?;

    let ox = point.ox1 * space.ox0() + point.ox0;
    let oy = point.oy1 * space.oy0() + point.oy0;
    let coords = ComputeCoords {
        ox,
        oy,
        oc: output_channel(space, point.oc1, point.oc0),
        ix: ox * space.stride() + point.fx,
        iy: oy * space.stride() + point.fy,
        ic: input_channel(space, point.ic1, point.ic0),
        fx: point.fx,
        fy: point.fy,
    };

    ensure_coords(space, TensorKind::Ofmap, &coords.ofmap())?;
    ensure_coords(space, TensorKind::Ifmap, &coords.ifmap())?;
    ensure_coords(space, TensorKind::Weight, &coords.weight())?;
    Ok(coords)
}

/// `(ix, iy, ic)` for a position of the ifmap traversal. `ix0`/`iy0` walk the
/// input footprint of the `(ox1, oy1)` output tile, so neighbouring tiles
/// share their halo columns and rows.
pub fn ifmap_coords(space: &TensorSpace, point: &TileIndex) -> Result<[usize; 3], IndexError> {
    point.ensure_within(space, &IFMAP_ORDER)?;

    let coords = [
        point.ix0 + point.ox1 * space.ox0() * space.stride(),
        point.iy0 + point.oy1 * space.oy0() * space.stride(),
        input_channel(space, point.ic1, point.ic0),
    ];
    ensure_coords(space, TensorKind::Ifmap, &coords)?;
    Ok(coords)
}

/// `(fx, fy, ic, oc)` for a position of the weight traversal. Weights do not
/// depend on which output tile is being computed.
pub fn weight_coords(space: &TensorSpace, point: &TileIndex) -> Result<[usize; 4], IndexError> {
    point.ensure_within(space, &WEIGHT_ORDER)?;

    let coords = [
        point.fx,
        point.fy,
        input_channel(space, point.ic1, point.ic0),
        output_channel(space, point.oc1, point.oc0),
    ];
    ensure_coords(space, TensorKind::Weight, &coords)?;
    Ok(coords)
}

pub fn ofmap_coords(space: &TensorSpace, point: &TileIndex) -> Result<[usize; 3], IndexError> {
    point.ensure_within(space, &OFMAP_ORDER)?;

    let coords = [
        point.ox1 * space.ox0() + point.ox0,
        point.oy1 * space.oy0() + point.oy0,
        output_channel(space, point.oc1, point.oc0),
    ];
    ensure_coords(space, TensorKind::Ofmap, &coords)?;
    Ok(coords)
}

/// Dispatches to the serialization mapping for `kind`.
pub fn tensor_coords(
    space: &TensorSpace,
    kind: TensorKind,
    point: &TileIndex,
) -> Result<Vec<usize>, IndexError> {
    match kind {
        TensorKind::Ifmap => ifmap_coords(space, point).map(|coords| coords.to_vec()),
        TensorKind::Weight => weight_coords(space, point).map(|coords| coords.to_vec()),
        TensorKind::Ofmap => ofmap_coords(space, point).map(|coords| coords.to_vec()),
    }
}

/// How many `(ox1, oy1)` tiles read input position `(ix, iy)`, i.e. how
/// often the ifmap traversal emits each channel at that position.
#[must_use]
pub fn ifmap_tile_multiplicity(space: &TensorSpace, ix: usize, iy: usize) -> usize {
    let along_x = covering_tiles(ix, space.ox1(), space.ox0() * space.stride(), space.ix0());
    let along_y = covering_tiles(iy, space.oy1(), space.oy0() * space.stride(), space.iy0());
    along_x * along_y
}

fn covering_tiles(position: usize, tiles: usize, step: usize, footprint: usize) -> usize {
    (0..tiles)
        .filter(|tile| {
            let start = tile * step;
            start <= position && position < start + footprint
        })
        .count()
}

fn ensure_coords(
    space: &TensorSpace,
    kind: TensorKind,
    coords: &[usize],
) -> Result<(), IndexError> {
    let shape = space.shape(kind);
    for (dim, (index, size)) in coords.iter().copied().zip(shape).enumerate() {
        if index >= size {
            return Err(IndexError::CoordOutOfRange {
                kind,
                dim,
                index,
                size,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use proptest::prelude::*;
    use tg_core::{
        COMPUTE_ORDER, ChannelStep, IndexError, LoopAxis, LoopNest, SpaceParams, TensorKind,
        TensorSpace, TileIndex,
    };

    use super::{
        compute_coords, ifmap_coords, ifmap_tile_multiplicity, ofmap_coords, tensor_coords,
        weight_coords,
    };

    fn tiled_space() -> TensorSpace {
        TensorSpace::new(SpaceParams {
            oy: 4,
            ox: 6,
            oc: 4,
            ic: 4,
            fy: 3,
            fx: 2,
            stride: 1,
            oy0: 2,
            ox0: 3,
            oc0: 2,
            ic0: 2,
            channel_step: ChannelStep::TileFactor,
        })
        .expect("tiled space should be valid")
    }

    #[test]
    fn compute_coords_follow_stride_and_filter_offsets() {
        let space = TensorSpace::new(SpaceParams {
            oy: 4,
            ox: 4,
            oc: 4,
            ic: 4,
            fy: 3,
            fx: 3,
            stride: 2,
            oy0: 2,
            ox0: 2,
            oc0: 2,
            ic0: 2,
            channel_step: ChannelStep::TileFactor,
        })
        .expect("space should be valid");
        let point = TileIndex {
            oy1: 1,
            ox1: 1,
            oc1: 1,
            ic1: 1,
            fy: 2,
            fx: 1,
            oy0: 1,
            ox0: 0,
            oc0: 1,
            ic0: 0,
            ..TileIndex::default()
        };
        let coords = compute_coords(&space, &point).expect("point is in range");
        assert_eq!(coords.ofmap(), [2, 3, 3]);
        assert_eq!(coords.ifmap(), [5, 8, 2]);
        assert_eq!(coords.weight(), [1, 2, 2, 3]);
    }

    #[test]
    fn ifmap_coords_shift_by_output_tile_footprint() {
        let space = tiled_space();
        assert_eq!(space.ix0(), 4);
        let point = TileIndex {
            ox1: 1,
            oy1: 1,
            ic1: 1,
            ix0: 3,
            iy0: 0,
            ic0: 1,
            ..TileIndex::default()
        };
        assert_eq!(ifmap_coords(&space, &point).expect("in range"), [6, 2, 3]);
    }

    #[test]
    fn weight_coords_ignore_output_tile_position() {
        let space = tiled_space();
        let base = TileIndex {
            oc1: 1,
            ic1: 0,
            fy: 2,
            fx: 1,
            ic0: 1,
            oc0: 0,
            ..TileIndex::default()
        };
        let moved = TileIndex {
            oy1: 1,
            ox1: 1,
            ..base
        };
        assert_eq!(weight_coords(&space, &base).expect("in range"), [1, 2, 1, 2]);
        let err = weight_coords(&space, &TileIndex { fx: 2, ..base })
            .expect_err("fx=2 is outside the filter");
        assert!(matches!(
            err,
            IndexError::AxisOutOfRange {
                axis: LoopAxis::Fx,
                ..
            }
        ));
        assert_eq!(
            weight_coords(&space, &moved).expect("in range"),
            weight_coords(&space, &base).expect("in range")
        );
    }

    #[test]
    fn out_of_range_loop_index_is_an_index_error() {
        let space = tiled_space();
        let point = TileIndex {
            ix0: space.ix0(),
            ..TileIndex::default()
        };
        let err = ifmap_coords(&space, &point).expect_err("ix0 must be below IX0");
        assert_eq!(
            err,
            IndexError::AxisOutOfRange {
                axis: LoopAxis::Ix0,
                index: 4,
                extent: 4
            }
        );

        let err = ofmap_coords(
            &space,
            &TileIndex {
                oc1: 2,
                ..TileIndex::default()
            },
        )
        .expect_err("oc1 must be below OC1");
        assert!(matches!(
            err,
            IndexError::AxisOutOfRange {
                axis: LoopAxis::Oc1,
                ..
            }
        ));
    }

    #[test]
    fn legacy_channel_step_matches_tile_factor_where_accepted() {
        let params = SpaceParams {
            oy: 2,
            ox: 2,
            oc: 4,
            ic: 2,
            fy: 1,
            fx: 1,
            stride: 1,
            oy0: 1,
            ox0: 1,
            oc0: 2,
            ic0: 1,
            channel_step: ChannelStep::TileFactor,
        };
        let sound = TensorSpace::new(params).expect("space should be valid");
        let legacy = TensorSpace::new(params.with_channel_step(ChannelStep::TileCount))
            .expect("OC1 == OC0 is accepted");
        for point in LoopNest::new(&sound, TensorKind::Ofmap.traversal_order()) {
            assert_eq!(
                ofmap_coords(&sound, &point).expect("in range"),
                ofmap_coords(&legacy, &point).expect("in range")
            );
        }
    }

    #[test]
    fn weight_and_ofmap_traversals_are_bijections() {
        let space = tiled_space();
        for kind in [TensorKind::Weight, TensorKind::Ofmap] {
            let visited: Vec<Vec<usize>> = LoopNest::new(&space, kind.traversal_order())
                .map(|point| tensor_coords(&space, kind, &point).expect("in range"))
                .collect();
            let unique: BTreeSet<_> = visited.iter().cloned().collect();
            let numel: usize = space.shape(kind).iter().product();
            assert_eq!(visited.len(), numel, "{kind} traversal length");
            assert_eq!(unique.len(), numel, "{kind} traversal repeats a coordinate");
        }
    }

    #[test]
    fn ifmap_traversal_repeats_halo_by_tile_multiplicity() {
        let space = tiled_space();
        let mut counts: BTreeMap<Vec<usize>, usize> = BTreeMap::new();
        for point in LoopNest::new(&space, TensorKind::Ifmap.traversal_order()) {
            let coords = tensor_coords(&space, TensorKind::Ifmap, &point).expect("in range");
            *counts.entry(coords).or_default() += 1;
        }

        let numel: usize = space.shape(TensorKind::Ifmap).iter().product();
        assert_eq!(counts.len(), numel, "every ifmap element is emitted");
        for (coords, count) in counts {
            assert_eq!(
                count,
                ifmap_tile_multiplicity(&space, coords[0], coords[1]),
                "multiplicity at {coords:?}"
            );
        }
    }

    #[test]
    fn single_tile_ifmap_traversal_is_a_bijection() {
        let space = TensorSpace::new(SpaceParams {
            oy: 3,
            ox: 3,
            oc: 2,
            ic: 2,
            fy: 2,
            fx: 2,
            stride: 1,
            oy0: 3,
            ox0: 3,
            oc0: 2,
            ic0: 2,
            channel_step: ChannelStep::TileFactor,
        })
        .expect("tiny space should be valid");
        let visited: BTreeSet<Vec<usize>> =
            LoopNest::new(&space, TensorKind::Ifmap.traversal_order())
                .map(|point| tensor_coords(&space, TensorKind::Ifmap, &point).expect("in range"))
                .collect();
        assert_eq!(visited.len(), 4 * 4 * 2);
        assert_eq!(space.traversal_len(TensorKind::Ifmap), 4 * 4 * 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn compute_and_ofmap_mappings_agree(
            oy0 in 1usize..4, oy1 in 1usize..3,
            ox0 in 1usize..4, ox1 in 1usize..3,
            oc0 in 1usize..4, oc1 in 1usize..3,
            stride in 1usize..3, fx in 1usize..3,
        ) {
            let space = TensorSpace::new(SpaceParams {
                oy: oy0 * oy1,
                ox: ox0 * ox1,
                oc: oc0 * oc1,
                ic: 1,
                fy: 1,
                fx,
                stride,
                oy0,
                ox0,
                oc0,
                ic0: 1,
                channel_step: ChannelStep::TileFactor,
            })
            .expect("divisible params are valid");

            for point in LoopNest::new(&space, &COMPUTE_ORDER) {
                let compute = compute_coords(&space, &point).expect("compute point in range");
                let ofmap = ofmap_coords(&space, &point).expect("ofmap point in range");
                prop_assert_eq!(compute.ofmap(), ofmap);
            }
        }
    }
}
