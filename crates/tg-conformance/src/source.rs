use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tg_core::{IntTensor, TensorKind, TensorSpace, ValueRange};

/// Supplies element values in row-major order of the tensor being filled.
pub trait ElementSource {
    fn next_element(&mut self) -> i64;
}

/// Uniform draws from a half-open [`ValueRange`], reproducible per seed.
#[derive(Debug, Clone)]
pub struct SeededSource {
    rng: StdRng,
    range: ValueRange,
}

impl SeededSource {
    /// `range` must already be validated; an empty range has nothing to draw.
    #[must_use]
    pub fn new(seed: u64, range: ValueRange) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            range,
        }
    }
}

impl ElementSource for SeededSource {
    fn next_element(&mut self) -> i64 {
        self.rng.random_range(self.range.low..self.range.high)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantSource(pub i64);

impl ElementSource for ConstantSource {
    fn next_element(&mut self) -> i64 {
        self.0
    }
}

/// Fills a tensor of `kind` in row-major order of its natural layout.
pub fn generate_tensor(
    source: &mut dyn ElementSource,
    space: &TensorSpace,
    kind: TensorKind,
) -> IntTensor {
    IntTensor::from_fn(kind, space.shape(kind), |_| source.next_element())
}
