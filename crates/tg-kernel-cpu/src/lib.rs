#![forbid(unsafe_code)]

use std::fmt;

use tg_address::compute_coords;
use tg_core::{COMPUTE_ORDER, IndexError, IntTensor, LoopAxis, LoopNest, TensorKind, TensorSpace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Index(IndexError),
    KindMismatch {
        side: &'static str,
        expected: TensorKind,
        actual: TensorKind,
    },
    ShapeMismatch {
        side: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    InvalidOrder {
        order: Vec<LoopAxis>,
    },
    AccumulatorOverflow {
        ox: usize,
        oy: usize,
        oc: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(error) => write!(f, "index error: {error}"),
            Self::KindMismatch {
                side,
                expected,
                actual,
            } => write!(f, "{side} must be a {expected} tensor, found {actual}"),
            Self::ShapeMismatch {
                side,
                expected,
                actual,
            } => write!(
                f,
                "shape mismatch on {side}: expected={expected:?}, actual={actual:?}"
            ),
            Self::InvalidOrder { order } => {
                let labels: Vec<&str> = order.iter().map(|axis| axis.label()).collect();
                write!(
                    f,
                    "compute order must be a permutation of the ten compute loops, found [{}]",
                    labels.join(", ")
                )
            }
            Self::AccumulatorOverflow { ox, oy, oc } => {
                write!(f, "accumulator overflow at ofmap[{ox}][{oy}][{oc}]")
            }
        }
    }
}

impl std::error::Error for KernelError {}

impl From<IndexError> for KernelError {
    fn from(value: IndexError) -> Self {
        Self::Index(value)
    }
}

/// Computes the ofmap with the canonical tiled loop nest
/// `oy1, ox1, oc1, ic1, fy, fx, oy0, ox0, oc0, ic0`.
pub fn reference_convolution(
    ifmap: &IntTensor,
    weight: &IntTensor,
    space: &TensorSpace,
) -> Result<IntTensor, KernelError> {
    reference_convolution_with_order(ifmap, weight, space, &COMPUTE_ORDER)
}

/// Same accumulation as [`reference_convolution`] visiting the compute loops
/// in `order`, outermost first. Exact integer sums make the result
/// independent of the order.
pub fn reference_convolution_with_order(
    ifmap: &IntTensor,
    weight: &IntTensor,
    space: &TensorSpace,
    order: &[LoopAxis],
) -> Result<IntTensor, KernelError> {
    ensure_operand(ifmap, space, TensorKind::Ifmap, "ifmap")?;
    ensure_operand(weight, space, TensorKind::Weight, "weight")?;
    ensure_permutation(order)?;

    let mut ofmap = IntTensor::zeros(TensorKind::Ofmap, space.shape(TensorKind::Ofmap));
    for point in LoopNest::new(space, order) {
        let coords = compute_coords(space, &point)?;
        let lhs = ifmap.get(&coords.ifmap())?;
        let rhs = weight.get(&coords.weight())?;
        multiply_accumulate(&mut ofmap, coords.ofmap(), lhs, rhs)?;
    }
    Ok(ofmap)
}

/// Untiled convolution over `(ox, oy, oc, fy, fx, ic)`, used as an
/// independent check of the tiled nest.
pub fn direct_convolution(
    ifmap: &IntTensor,
    weight: &IntTensor,
    space: &TensorSpace,
) -> Result<IntTensor, KernelError> {
    ensure_operand(ifmap, space, TensorKind::Ifmap, "ifmap")?;
    ensure_operand(weight, space, TensorKind::Weight, "weight")?;

    let stride = space.stride();
    let mut ofmap = IntTensor::zeros(TensorKind::Ofmap, space.shape(TensorKind::Ofmap));
    for ox in 0..space.ox() {
        for oy in 0..space.oy() {
            for oc in 0..space.oc() {
                for fy in 0..space.fy() {
                    for fx in 0..space.fx() {
                        for ic in 0..space.ic() {
                            let lhs = ifmap.get(&[ox * stride + fx, oy * stride + fy, ic])?;
                            let rhs = weight.get(&[fx, fy, ic, oc])?;
                            multiply_accumulate(&mut ofmap, [ox, oy, oc], lhs, rhs)?;
                        }
                    }
                }
            }
        }
    }
    Ok(ofmap)
}

fn multiply_accumulate(
    ofmap: &mut IntTensor,
    at: [usize; 3],
    lhs: i64,
    rhs: i64,
) -> Result<(), KernelError> {
    let [ox, oy, oc] = at;
    let overflow = KernelError::AccumulatorOverflow { ox, oy, oc };
    let product = lhs.checked_mul(rhs).ok_or_else(|| overflow.clone())?;
    let sum = ofmap.get(&at)?.checked_add(product).ok_or(overflow)?;
    ofmap.set(&at, sum)?;
    Ok(())
}

fn ensure_operand(
    tensor: &IntTensor,
    space: &TensorSpace,
    kind: TensorKind,
    side: &'static str,
) -> Result<(), KernelError> {
    if tensor.kind() != kind {
        return Err(KernelError::KindMismatch {
            side,
            expected: kind,
            actual: tensor.kind(),
        });
    }

    let expected = space.shape(kind);
    if tensor.shape() != expected.as_slice() {
        return Err(KernelError::ShapeMismatch {
            side,
            expected,
            actual: tensor.shape().to_vec(),
        });
    }

    Ok(())
}

fn ensure_permutation(order: &[LoopAxis]) -> Result<(), KernelError> {
    let mut sorted = order.to_vec();
    sorted.sort();
    let mut canonical = COMPUTE_ORDER.to_vec();
    canonical.sort();
    if sorted != canonical {
        return Err(KernelError::InvalidOrder {
            order: order.to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tg_core::{
        COMPUTE_ORDER, ChannelStep, IndexError, IntTensor, LoopAxis, SpaceParams, TensorKind,
        TensorSpace,
    };

    use super::{
        KernelError, direct_convolution, reference_convolution, reference_convolution_with_order,
    };

    fn space(params: SpaceParams) -> TensorSpace {
        TensorSpace::new(params).expect("test space should be valid")
    }

    fn tiny_space() -> TensorSpace {
        space(SpaceParams {
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
    }

    fn tiled_space() -> TensorSpace {
        space(SpaceParams {
            oy: 4,
            ox: 4,
            oc: 4,
            ic: 6,
            fy: 3,
            fx: 2,
            stride: 2,
            oy0: 2,
            ox0: 2,
            oc0: 2,
            ic0: 3,
            channel_step: ChannelStep::TileFactor,
        })
    }

    fn patterned(space: &TensorSpace, kind: TensorKind, salt: usize) -> IntTensor {
        IntTensor::from_fn(kind, space.shape(kind), |index| {
            let mixed = index
                .iter()
                .enumerate()
                .fold(salt, |acc, (dim, value)| acc * 31 + (dim + 3) * value);
            (mixed % 19) as i64 - 9
        })
    }

    #[test]
    fn all_ones_tiny_layer_sums_filter_volume() {
        let space = tiny_space();
        let ifmap = IntTensor::from_fn(TensorKind::Ifmap, space.shape(TensorKind::Ifmap), |_| 1);
        let weight =
            IntTensor::from_fn(TensorKind::Weight, space.shape(TensorKind::Weight), |_| 1);

        let ofmap = reference_convolution(&ifmap, &weight, &space).expect("conv should succeed");
        assert_eq!(ofmap.shape(), &[3, 3, 2]);
        assert!(ofmap.values().iter().all(|value| *value == 8));
    }

    #[test]
    fn tiled_nest_matches_direct_convolution() {
        let space = tiled_space();
        let ifmap = patterned(&space, TensorKind::Ifmap, 7);
        let weight = patterned(&space, TensorKind::Weight, 11);

        let tiled = reference_convolution(&ifmap, &weight, &space).expect("tiled conv");
        let direct = direct_convolution(&ifmap, &weight, &space).expect("direct conv");
        assert_eq!(tiled, direct);
        assert!(tiled.values().iter().any(|value| *value != 0));
    }

    #[test]
    fn reversed_loop_order_gives_identical_ofmap() {
        let space = tiled_space();
        let ifmap = patterned(&space, TensorKind::Ifmap, 3);
        let weight = patterned(&space, TensorKind::Weight, 5);

        let mut reversed = COMPUTE_ORDER.to_vec();
        reversed.reverse();
        let canonical = reference_convolution(&ifmap, &weight, &space).expect("canonical");
        let permuted = reference_convolution_with_order(&ifmap, &weight, &space, &reversed)
            .expect("reversed order");
        assert_eq!(canonical, permuted);
    }

    #[test]
    fn pointwise_layer_is_a_channel_matmul() {
        let space = space(SpaceParams {
            oy: 4,
            ox: 2,
            oc: 4,
            ic: 4,
            fy: 1,
            fx: 1,
            stride: 1,
            oy0: 2,
            ox0: 1,
            oc0: 2,
            ic0: 2,
            channel_step: ChannelStep::TileFactor,
        });
        assert_eq!((space.ix(), space.iy()), (space.ox(), space.oy()));

        let ifmap = patterned(&space, TensorKind::Ifmap, 2);
        let weight = patterned(&space, TensorKind::Weight, 9);
        let ofmap = reference_convolution(&ifmap, &weight, &space).expect("conv should succeed");

        for ox in 0..space.ox() {
            for oy in 0..space.oy() {
                for oc in 0..space.oc() {
                    let expected: i64 = (0..space.ic())
                        .map(|ic| {
                            ifmap.get(&[ox, oy, ic]).expect("ifmap in range")
                                * weight.get(&[0, 0, ic, oc]).expect("weight in range")
                        })
                        .sum();
                    assert_eq!(ofmap.get(&[ox, oy, oc]).expect("ofmap in range"), expected);
                }
            }
        }
    }

    #[test]
    fn wrong_operand_shape_is_rejected() {
        let space = tiny_space();
        let ifmap = IntTensor::zeros(TensorKind::Ifmap, vec![3, 3, 2]);
        let weight = IntTensor::zeros(TensorKind::Weight, space.shape(TensorKind::Weight));

        let err = reference_convolution(&ifmap, &weight, &space)
            .expect_err("3x3 ifmap cannot feed a 2x2 filter over 3x3 outputs");
        assert!(matches!(
            err,
            KernelError::ShapeMismatch { side: "ifmap", .. }
        ));
    }

    #[test]
    fn swapped_operands_are_rejected() {
        let space = tiny_space();
        let ifmap = IntTensor::zeros(TensorKind::Ifmap, space.shape(TensorKind::Ifmap));
        let weight = IntTensor::zeros(TensorKind::Weight, space.shape(TensorKind::Weight));

        let err = direct_convolution(&weight, &ifmap, &space).expect_err("operands swapped");
        assert!(matches!(
            err,
            KernelError::KindMismatch {
                side: "ifmap",
                expected: TensorKind::Ifmap,
                actual: TensorKind::Weight
            }
        ));
    }

    #[test]
    fn incomplete_order_is_rejected() {
        let space = tiny_space();
        let ifmap = IntTensor::zeros(TensorKind::Ifmap, space.shape(TensorKind::Ifmap));
        let weight = IntTensor::zeros(TensorKind::Weight, space.shape(TensorKind::Weight));
        let order = [LoopAxis::Oy1, LoopAxis::Ox1, LoopAxis::Ix0];

        let err = reference_convolution_with_order(&ifmap, &weight, &space, &order)
            .expect_err("order is not a permutation");
        assert!(matches!(err, KernelError::InvalidOrder { .. }));
        assert!(err.to_string().contains("ix0"));
    }

    #[test]
    fn accumulator_overflow_is_reported_not_wrapped() {
        let space = tiny_space();
        let ifmap = IntTensor::from_fn(TensorKind::Ifmap, space.shape(TensorKind::Ifmap), |_| {
            i64::MAX / 2
        });
        let weight =
            IntTensor::from_fn(TensorKind::Weight, space.shape(TensorKind::Weight), |_| 1);

        let err = reference_convolution(&ifmap, &weight, &space).expect_err("sum must overflow");
        assert!(matches!(
            err,
            KernelError::AccumulatorOverflow { ox: 0, oy: 0, oc: 0 }
        ));
    }

    #[test]
    fn index_errors_convert_into_kernel_errors() {
        let err = KernelError::from(IndexError::RankMismatch {
            kind: TensorKind::Ofmap,
            expected: 3,
            actual: 2,
        });
        assert!(err.to_string().starts_with("index error"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn any_loop_permutation_is_bit_identical(
            order in Just(COMPUTE_ORDER.to_vec()).prop_shuffle(),
            ifmap_values in prop::collection::vec(-10i64..10, 8 * 9 * 6),
            weight_values in prop::collection::vec(-10i64..10, 2 * 3 * 6 * 4),
        ) {
            let space = tiled_space();
            let ifmap = IntTensor::from_vec(
                TensorKind::Ifmap,
                space.shape(TensorKind::Ifmap),
                ifmap_values,
            )
            .expect("ifmap length matches");
            let weight = IntTensor::from_vec(
                TensorKind::Weight,
                space.shape(TensorKind::Weight),
                weight_values,
            )
            .expect("weight length matches");

            let canonical = reference_convolution(&ifmap, &weight, &space).expect("canonical");
            let permuted = reference_convolution_with_order(&ifmap, &weight, &space, &order)
                .expect("permuted order");
            prop_assert_eq!(&canonical, &permuted);
            prop_assert_eq!(
                canonical,
                direct_convolution(&ifmap, &weight, &space).expect("direct")
            );
        }
    }
}
