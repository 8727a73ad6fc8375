//! LRU caches for gate application and measurement evaluation.
//!
//! Both caches key on the exact bit patterns of the input amplitudes plus
//! the qubit index list, so a hit reproduces the earlier result bit for
//! bit. In the single-threaded core no synchronization is needed; the
//! multi-threaded state-server variant described in the design would wrap
//! misses in an allocate-then-notify reservation, with an identical
//! observable contract.

use std::num::NonZeroUsize;

use lru::LruCache;
use ndarray::{Array1, Array2};
use num_complex::Complex64;

// ============================================================================
// Cache Keys
// ============================================================================

/// Fingerprint of a state: the raw bit patterns of every amplitude.
pub(crate) fn fingerprint_vec(amplitudes: &Array1<Complex64>) -> Vec<u64> {
    let mut bits = Vec::with_capacity(amplitudes.len() * 2);
    for a in amplitudes {
        bits.push(a.re.to_bits());
        bits.push(a.im.to_bits());
    }
    bits
}

/// Fingerprint of a density matrix, row-major.
pub(crate) fn fingerprint_mat(matrix: &Array2<Complex64>) -> Vec<u64> {
    let mut bits = Vec::with_capacity(matrix.len() * 2);
    for a in matrix.iter() {
        bits.push(a.re.to_bits());
        bits.push(a.im.to_bits());
    }
    bits
}

/// Key for the gate-application cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct GateKey {
    /// Stable gate id ([`crate::Gate::cache_tag`]).
    pub gate: u8,
    /// Target qubit indices.
    pub targets: Vec<usize>,
    /// Input state fingerprint.
    pub state: Vec<u64>,
}

/// Key for the measurement cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct MeasureKey {
    /// Number of measured qubits (measured keys are permuted to the front
    /// before lookup).
    pub measured: usize,
    /// Input state fingerprint.
    pub state: Vec<u64>,
}

// ============================================================================
// Cached Values
// ============================================================================

/// Precomputed measurement evaluation: outcome probabilities and the
/// post-measurement remainder state per outcome.
#[derive(Debug, Clone)]
pub(crate) struct MeasureEval<S> {
    /// Probability of each outcome, indexed by the measured bit pattern.
    pub probabilities: Vec<f64>,
    /// Collapsed remainder state per outcome (`None` when every qubit was
    /// measured or the outcome has zero probability).
    pub remainders: Vec<Option<S>>,
}

// ============================================================================
// Cache Pair
// ============================================================================

/// The gate and measurement caches used by one formalism variant.
///
/// `S` is the state representation (`Array1` for ket, `Array2` for
/// density).
pub(crate) struct OpCache<S> {
    gates: LruCache<GateKey, S>,
    measures: LruCache<MeasureKey, MeasureEval<S>>,
}

impl<S: Clone> OpCache<S> {
    /// Creates both caches with the given fixed capacity.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity");
        Self {
            gates: LruCache::new(cap),
            measures: LruCache::new(cap),
        }
    }

    pub fn get_gate(&mut self, key: &GateKey) -> Option<S> {
        self.gates.get(key).cloned()
    }

    pub fn put_gate(&mut self, key: GateKey, value: S) {
        self.gates.put(key, value);
    }

    pub fn get_measure(&mut self, key: &MeasureKey) -> Option<MeasureEval<S>> {
        self.measures.get(key).cloned()
    }

    pub fn put_measure(&mut self, key: MeasureKey, value: MeasureEval<S>) {
        self.measures.put(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_cache_round_trip() {
        let mut cache: OpCache<Array1<Complex64>> = OpCache::new(4);
        let state = Array1::from(vec![Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)]);
        let key = GateKey {
            gate: 1,
            targets: vec![0],
            state: fingerprint_vec(&state),
        };

        assert!(cache.get_gate(&key).is_none());
        cache.put_gate(key.clone(), state.clone());
        assert!(cache.get_gate(&key).is_some());
    }

    #[test]
    fn distinct_targets_are_distinct_keys() {
        let state = Array1::from(vec![
            Complex64::new(1.0, 0.0),
            Complex64::new(0.0, 0.0),
            Complex64::new(0.0, 0.0),
            Complex64::new(0.0, 0.0),
        ]);
        let mut cache: OpCache<Array1<Complex64>> = OpCache::new(4);
        let k0 = GateKey {
            gate: 1,
            targets: vec![0],
            state: fingerprint_vec(&state),
        };
        let k1 = GateKey {
            gate: 1,
            targets: vec![1],
            state: fingerprint_vec(&state),
        };
        cache.put_gate(k0.clone(), state);
        assert!(cache.get_gate(&k1).is_none());
        assert!(cache.get_gate(&k0).is_some());
    }

    #[test]
    fn lru_evicts_oldest() {
        let mut cache: OpCache<Array1<Complex64>> = OpCache::new(1);
        let s = Array1::from(vec![Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)]);
        let k1 = GateKey {
            gate: 1,
            targets: vec![0],
            state: vec![1],
        };
        let k2 = GateKey {
            gate: 1,
            targets: vec![0],
            state: vec![2],
        };
        cache.put_gate(k1.clone(), s.clone());
        cache.put_gate(k2.clone(), s);
        assert!(cache.get_gate(&k1).is_none());
        assert!(cache.get_gate(&k2).is_some());
    }
}
