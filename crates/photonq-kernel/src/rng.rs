//! Deterministic random number generation.
//!
//! Every entity owns its own RNG stream derived from the timeline's master
//! seed and the entity's name. Renaming scheduling internals or changing
//! entity construction order cannot perturb any entity's draws; only
//! renaming the entity itself does.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Deterministic per-entity random number generator.
#[derive(Debug, Clone)]
pub struct SimRng {
    inner: ChaCha8Rng,
}

impl SimRng {
    /// Creates a generator from a raw seed.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Creates the RNG stream for a named entity under a master seed.
    pub fn for_entity(master_seed: u64, name: &str) -> Self {
        Self::new(derive_seed(master_seed, name))
    }

    /// Uniform sample in `[0, 1)`.
    pub fn random_f64(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    /// Uniform integer in `[0, bound)`.
    pub fn gen_range(&mut self, bound: u64) -> u64 {
        self.inner.gen_range(0..bound)
    }

    /// Fair coin flip, returned as 0 or 1.
    pub fn coin(&mut self) -> u8 {
        u8::from(self.inner.gen::<bool>())
    }

    /// Uniform delay in `[min, max]` picoseconds.
    pub fn delay_ps(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.inner.gen_range(min..=max)
    }
}

/// Folds an entity name into the master seed with FNV-1a.
///
/// FNV is stable across platforms and Rust versions, unlike `DefaultHasher`,
/// which is the property the reproducibility contract needs.
fn derive_seed(master_seed: u64, name: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET ^ master_seed.wrapping_mul(FNV_PRIME);
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = SimRng::new(42);
        let mut b = SimRng::new(42);
        for _ in 0..16 {
            assert_eq!(a.random_f64().to_bits(), b.random_f64().to_bits());
        }
    }

    #[test]
    fn entity_streams_are_independent_of_order() {
        // Deriving r1 before or after r2 must not change either stream.
        let mut r1_first = SimRng::for_entity(0, "r1");
        let _r2 = SimRng::for_entity(0, "r2");
        let mut r1_second = SimRng::for_entity(0, "r1");

        assert_eq!(
            r1_first.random_f64().to_bits(),
            r1_second.random_f64().to_bits()
        );
    }

    #[test]
    fn different_entities_differ() {
        let mut a = SimRng::for_entity(0, "alice");
        let mut b = SimRng::for_entity(0, "bob");
        let draws_a: Vec<u64> = (0..4).map(|_| a.random_f64().to_bits()).collect();
        let draws_b: Vec<u64> = (0..4).map(|_| b.random_f64().to_bits()).collect();
        assert_ne!(draws_a, draws_b);
    }

    #[test]
    fn different_seeds_differ() {
        let mut a = SimRng::for_entity(0, "alice");
        let mut b = SimRng::for_entity(1, "alice");
        assert_ne!(a.random_f64().to_bits(), b.random_f64().to_bits());
    }

    #[test]
    fn delay_respects_bounds() {
        let mut rng = SimRng::new(9);
        for _ in 0..100 {
            let d = rng.delay_ps(100, 200);
            assert!((100..=200).contains(&d));
        }
        assert_eq!(rng.delay_ps(50, 50), 50);
    }
}
