//! Deterministic pseudo-random generator for `math.random`.
//!
//! A 48-bit linear congruential generator with the `drand48` constants, so
//! the same seed yields the same sequence on every platform. Scripts that
//! write data derived from `math.random` must replay identically on
//! replicas, which is why the sandbox reseeds it before every invocation.

const MULTIPLIER: u64 = 0x5_DEEC_E66D;
const INCREMENT: u64 = 0xB;
const MASK: u64 = (1 << 48) - 1;
const SEED_LOW: u64 = 0x330E;

/// Largest value returned by [`Rand48::next_u31`], exclusive.
pub const RAND48_MAX: i32 = i32::MAX;

/// 48-bit linear congruential generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rand48 {
    state: u64,
}

impl Rand48 {
    /// Creates a generator seeded with `seed`.
    pub fn new(seed: i32) -> Self {
        let mut rng = Self { state: 0 };
        rng.seed(seed);
        rng
    }

    /// Resets the state the way `srand48` does.
    pub fn seed(&mut self, seed: i32) {
        self.state = (u64::from(seed as u32) << 16) | SEED_LOW;
    }

    /// Returns the next non-negative 31-bit value (`lrand48`).
    pub fn next_u31(&mut self) -> i32 {
        self.state = MULTIPLIER
            .wrapping_mul(self.state)
            .wrapping_add(INCREMENT)
            & MASK;
        (self.state >> 17) as i32
    }

    /// Returns the next value in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        f64::from(self.next_u31() % RAND48_MAX) / f64::from(RAND48_MAX)
    }
}

impl Default for Rand48 {
    fn default() -> Self {
        Self::new(0)
    }
}
