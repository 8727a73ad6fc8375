//! Quantum state representations.

use ndarray::{Array1, Array2};
use num_complex::Complex64;

use crate::error::QuantumError;

/// Key binding a memory identifier to a state in the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateKey(pub u64);

const SQRT_HALF: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// |Φ⁺⟩ = (|00⟩ + |11⟩)/√2
pub const BELL_PHI_PLUS: [Complex64; 4] = [
    Complex64::new(SQRT_HALF, 0.0),
    Complex64::new(0.0, 0.0),
    Complex64::new(0.0, 0.0),
    Complex64::new(SQRT_HALF, 0.0),
];

/// |Φ⁻⟩ = (|00⟩ − |11⟩)/√2
pub const BELL_PHI_MINUS: [Complex64; 4] = [
    Complex64::new(SQRT_HALF, 0.0),
    Complex64::new(0.0, 0.0),
    Complex64::new(0.0, 0.0),
    Complex64::new(-SQRT_HALF, 0.0),
];

/// |Ψ⁺⟩ = (|01⟩ + |10⟩)/√2
pub const BELL_PSI_PLUS: [Complex64; 4] = [
    Complex64::new(0.0, 0.0),
    Complex64::new(SQRT_HALF, 0.0),
    Complex64::new(SQRT_HALF, 0.0),
    Complex64::new(0.0, 0.0),
];

/// |Ψ⁻⟩ = (|01⟩ − |10⟩)/√2
pub const BELL_PSI_MINUS: [Complex64; 4] = [
    Complex64::new(0.0, 0.0),
    Complex64::new(SQRT_HALF, 0.0),
    Complex64::new(-SQRT_HALF, 0.0),
    Complex64::new(0.0, 0.0),
];

// ============================================================================
// Ket State
// ============================================================================

/// Pure state as a complex amplitude vector of length `2^n`.
#[derive(Debug, Clone)]
pub struct KetState {
    /// Amplitudes in the computational basis; `keys[0]` is the most
    /// significant qubit.
    pub amplitudes: Array1<Complex64>,
    /// Keys co-owning this state, in qubit order.
    pub keys: Vec<StateKey>,
}

impl KetState {
    /// Validates shape and normalization, then constructs the state.
    pub fn new(amplitudes: Vec<Complex64>, keys: Vec<StateKey>) -> Result<Self, QuantumError> {
        let n = num_qubits(amplitudes.len(), keys.len())?;
        debug_assert_eq!(n, keys.len());
        let norm: f64 = amplitudes.iter().map(|a| a.norm_sqr()).sum();
        if (norm - 1.0).abs() > 1e-5 {
            return Err(QuantumError::DimensionMismatch(format!(
                "squared amplitudes sum to {norm}, expected 1"
            )));
        }
        Ok(Self {
            amplitudes: Array1::from(amplitudes),
            keys,
        })
    }
}

// ============================================================================
// Density State
// ============================================================================

/// Mixed state as a `2^n × 2^n` density matrix.
#[derive(Debug, Clone)]
pub struct DensityState {
    /// Density matrix in the computational basis.
    pub matrix: Array2<Complex64>,
    /// Keys co-owning this state, in qubit order.
    pub keys: Vec<StateKey>,
}

impl DensityState {
    /// Validates shape and trace, then constructs the state.
    pub fn new(matrix: Array2<Complex64>, keys: Vec<StateKey>) -> Result<Self, QuantumError> {
        if matrix.nrows() != matrix.ncols() {
            return Err(QuantumError::DimensionMismatch(format!(
                "density matrix is {}×{}, expected square",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        num_qubits(matrix.nrows(), keys.len())?;
        let trace: Complex64 = matrix.diag().sum();
        if (trace.re - 1.0).abs() > 0.1 || trace.im.abs() > 1e-6 {
            return Err(QuantumError::DimensionMismatch(format!(
                "density matrix trace is {trace}, expected 1"
            )));
        }
        Ok(Self { matrix, keys })
    }

    /// Builds ρ = |ψ⟩⟨ψ| from an amplitude vector.
    pub fn from_pure(amplitudes: &[Complex64], keys: Vec<StateKey>) -> Result<Self, QuantumError> {
        let dim = amplitudes.len();
        let mut matrix = Array2::zeros((dim, dim));
        for (i, a) in amplitudes.iter().enumerate() {
            for (j, b) in amplitudes.iter().enumerate() {
                matrix[(i, j)] = a * b.conj();
            }
        }
        Self::new(matrix, keys)
    }
}

// ============================================================================
// Bell-Diagonal State
// ============================================================================

/// Two-qubit mixed state diagonal in the Bell basis.
///
/// Probabilities are ordered (Φ⁺, Φ⁻, Ψ⁺, Ψ⁻). The fidelity of the pair is
/// the weight of the target Bell state, conventionally the first entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BellDiagonalState {
    /// Probabilities over the four Bell states.
    pub probs: [f64; 4],
    /// The two co-owning keys.
    pub keys: [StateKey; 2],
}

impl BellDiagonalState {
    /// Validates that the probabilities form a distribution.
    pub fn new(probs: [f64; 4], keys: [StateKey; 2]) -> Result<Self, QuantumError> {
        let total: f64 = probs.iter().sum();
        if (total - 1.0).abs() > 1e-6 || probs.iter().any(|p| *p < -1e-12) {
            return Err(QuantumError::DimensionMismatch(format!(
                "Bell-diagonal probabilities {probs:?} are not a distribution"
            )));
        }
        Ok(Self { probs, keys })
    }

    /// Werner-style BDS at the given fidelity: the remaining weight is split
    /// evenly over the other three Bell states.
    pub fn werner(fidelity: f64, keys: [StateKey; 2]) -> Self {
        let rest = (1.0 - fidelity) / 3.0;
        Self {
            probs: [fidelity, rest, rest, rest],
            keys,
        }
    }

    /// Fidelity with respect to the target Bell state.
    pub fn fidelity(&self) -> f64 {
        self.probs[0]
    }
}

/// Checks `dim == 2^keys` and returns the qubit count.
fn num_qubits(dim: usize, key_count: usize) -> Result<usize, QuantumError> {
    if !dim.is_power_of_two() {
        return Err(QuantumError::DimensionMismatch(format!(
            "state dimension {dim} is not a power of two"
        )));
    }
    let n = dim.trailing_zeros() as usize;
    if n != key_count {
        return Err(QuantumError::DimensionMismatch(format!(
            "state covers {n} qubits but {key_count} keys supplied"
        )));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ket_rejects_unnormalized() {
        let amps = vec![Complex64::new(1.0, 0.0), Complex64::new(1.0, 0.0)];
        assert!(KetState::new(amps, vec![StateKey(0)]).is_err());
    }

    #[test]
    fn ket_rejects_key_mismatch() {
        let amps = vec![Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)];
        assert!(KetState::new(amps, vec![StateKey(0), StateKey(1)]).is_err());
    }

    #[test]
    fn bell_states_are_normalized() {
        for bell in [BELL_PHI_PLUS, BELL_PHI_MINUS, BELL_PSI_PLUS, BELL_PSI_MINUS] {
            let norm: f64 = bell.iter().map(|a| a.norm_sqr()).sum();
            assert!((norm - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn density_from_pure_has_unit_trace() {
        let rho = DensityState::from_pure(&BELL_PHI_PLUS, vec![StateKey(0), StateKey(1)]).unwrap();
        let trace: Complex64 = rho.matrix.diag().sum();
        assert!((trace.re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn werner_bds_distribution() {
        let bds = BellDiagonalState::werner(0.85, [StateKey(0), StateKey(1)]);
        assert!((bds.probs.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((bds.fidelity() - 0.85).abs() < 1e-12);
    }

    #[test]
    fn bds_rejects_bad_distribution() {
        assert!(BellDiagonalState::new([0.5, 0.5, 0.5, -0.5], [StateKey(0), StateKey(1)]).is_err());
    }
}
