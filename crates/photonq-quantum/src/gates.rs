//! Gate table and unitary construction.
//!
//! Gates are applied by materializing the full `2^n × 2^n` unitary for the
//! joint state. Dimensions stay small in this simulator (protocol circuits
//! touch at most three qubits), so the dense construction is both simple
//! and cache-friendly: the per-gate LRU in the manager keys on the input
//! state, not the operator.

use ndarray::Array2;
use num_complex::Complex64;

use crate::error::QuantumError;

/// The registered gate table.
///
/// Any gate outside this set fails circuit validation with `UnknownGate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gate {
    /// Hadamard.
    H,
    /// Pauli-X.
    X,
    /// Pauli-Y.
    Y,
    /// Pauli-Z.
    Z,
    /// Phase gate S.
    S,
    /// π/8 gate T.
    T,
    /// Controlled-X (control, target).
    Cx,
    /// Swap two qubits.
    Swap,
    /// Toffoli (control, control, target).
    Ccx,
}

impl Gate {
    /// Number of qubits the gate acts on.
    pub fn arity(self) -> usize {
        match self {
            Gate::H | Gate::X | Gate::Y | Gate::Z | Gate::S | Gate::T => 1,
            Gate::Cx | Gate::Swap => 2,
            Gate::Ccx => 3,
        }
    }

    /// Stable id used in cache keys.
    pub fn cache_tag(self) -> u8 {
        match self {
            Gate::H => 0,
            Gate::X => 1,
            Gate::Y => 2,
            Gate::Z => 3,
            Gate::S => 4,
            Gate::T => 5,
            Gate::Cx => 6,
            Gate::Swap => 7,
            Gate::Ccx => 8,
        }
    }

    /// Looks a gate up by name in the registered table.
    pub fn parse(name: &str) -> Result<Self, QuantumError> {
        match name {
            "h" | "H" => Ok(Gate::H),
            "x" | "X" => Ok(Gate::X),
            "y" | "Y" => Ok(Gate::Y),
            "z" | "Z" => Ok(Gate::Z),
            "s" | "S" => Ok(Gate::S),
            "t" | "T" => Ok(Gate::T),
            "cx" | "CX" | "cnot" => Ok(Gate::Cx),
            "swap" | "SWAP" => Ok(Gate::Swap),
            "ccx" | "CCX" | "toffoli" => Ok(Gate::Ccx),
            other => Err(QuantumError::UnknownGate(other.to_string())),
        }
    }

    /// The gate's unitary on its own qubits (`2^arity` square).
    pub fn unitary(self) -> Array2<Complex64> {
        let one = Complex64::new(1.0, 0.0);
        let zero = Complex64::new(0.0, 0.0);
        let i = Complex64::new(0.0, 1.0);
        let h = Complex64::new(std::f64::consts::FRAC_1_SQRT_2, 0.0);
        match self {
            Gate::H => Array2::from_shape_vec((2, 2), vec![h, h, h, -h]).expect("2x2"),
            Gate::X => Array2::from_shape_vec((2, 2), vec![zero, one, one, zero]).expect("2x2"),
            Gate::Y => Array2::from_shape_vec((2, 2), vec![zero, -i, i, zero]).expect("2x2"),
            Gate::Z => Array2::from_shape_vec((2, 2), vec![one, zero, zero, -one]).expect("2x2"),
            Gate::S => Array2::from_shape_vec((2, 2), vec![one, zero, zero, i]).expect("2x2"),
            Gate::T => {
                let t = Complex64::from_polar(1.0, std::f64::consts::FRAC_PI_4);
                Array2::from_shape_vec((2, 2), vec![one, zero, zero, t]).expect("2x2")
            }
            Gate::Cx => {
                let mut m = Array2::zeros((4, 4));
                m[(0, 0)] = one;
                m[(1, 1)] = one;
                m[(2, 3)] = one;
                m[(3, 2)] = one;
                m
            }
            Gate::Swap => {
                let mut m = Array2::zeros((4, 4));
                m[(0, 0)] = one;
                m[(1, 2)] = one;
                m[(2, 1)] = one;
                m[(3, 3)] = one;
                m
            }
            Gate::Ccx => {
                let mut m: Array2<Complex64> = Array2::zeros((8, 8));
                for j in 0..6 {
                    m[(j, j)] = one;
                }
                m[(6, 7)] = one;
                m[(7, 6)] = one;
                m
            }
        }
    }
}

/// Expands a gate acting on `targets` to the full `2^n × 2^n` unitary.
///
/// Qubit `0` is the most significant bit of the basis index (tensor-product
/// order: `keys[0] ⊗ keys[1] ⊗ …`).
pub fn full_unitary(gate: Gate, targets: &[usize], n: usize) -> Result<Array2<Complex64>, QuantumError> {
    let arity = gate.arity();
    if targets.len() != arity {
        return Err(QuantumError::DimensionMismatch(format!(
            "gate {gate:?} takes {arity} qubits, got {}",
            targets.len()
        )));
    }
    if targets.iter().any(|t| *t >= n) {
        return Err(QuantumError::DimensionMismatch(format!(
            "gate target out of range for {n}-qubit state: {targets:?}"
        )));
    }

    let small = gate.unitary();
    let dim = 1usize << n;
    let mut full: Array2<Complex64> = Array2::zeros((dim, dim));

    for col in 0..dim {
        // Extract the gate-local index from the target bits of `col`.
        let mut local_in = 0usize;
        for t in targets {
            let bit = (col >> (n - 1 - t)) & 1;
            local_in = (local_in << 1) | bit;
        }
        for local_out in 0..(1usize << arity) {
            let amp = small[(local_out, local_in)];
            if amp == Complex64::new(0.0, 0.0) {
                continue;
            }
            // Write the gate-local output bits back into the basis index.
            let mut row = col;
            for (pos, t) in targets.iter().enumerate() {
                let bit = (local_out >> (arity - 1 - pos)) & 1;
                let mask = 1usize << (n - 1 - t);
                if bit == 1 {
                    row |= mask;
                } else {
                    row &= !mask;
                }
            }
            full[(row, col)] += amp;
        }
    }

    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn apply(u: &Array2<Complex64>, v: &[Complex64]) -> Vec<Complex64> {
        let v = Array1::from(v.to_vec());
        u.dot(&v).to_vec()
    }

    fn close(a: &[Complex64], b: &[Complex64]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).norm() < 1e-10)
    }

    #[test]
    fn x_flips_single_qubit() {
        let u = full_unitary(Gate::X, &[0], 1).unwrap();
        let out = apply(&u, &[Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)]);
        assert!(close(&out, &[Complex64::new(0.0, 0.0), Complex64::new(1.0, 0.0)]));
    }

    #[test]
    fn x_on_second_qubit_of_two() {
        // |00> --X(q1)--> |01>
        let u = full_unitary(Gate::X, &[1], 2).unwrap();
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);
        let out = apply(&u, &[one, zero, zero, zero]);
        assert!(close(&out, &[zero, one, zero, zero]));
    }

    #[test]
    fn cx_entangles_after_h() {
        // H on q0 then CX(0,1) from |00> gives a Bell state.
        let h = full_unitary(Gate::H, &[0], 2).unwrap();
        let cx = full_unitary(Gate::Cx, &[0, 1], 2).unwrap();
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);
        let mid = apply(&h, &[one, zero, zero, zero]);
        let out = apply(&cx, &mid);
        let r = Complex64::new(std::f64::consts::FRAC_1_SQRT_2, 0.0);
        assert!(close(&out, &[r, zero, zero, r]));
    }

    #[test]
    fn swap_exchanges_qubits() {
        // |01> -> |10>
        let u = full_unitary(Gate::Swap, &[0, 1], 2).unwrap();
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);
        let out = apply(&u, &[zero, one, zero, zero]);
        assert!(close(&out, &[zero, zero, one, zero]));
    }

    #[test]
    fn cx_with_reversed_targets() {
        // CX with control=1, target=0: |01> -> |11>
        let u = full_unitary(Gate::Cx, &[1, 0], 2).unwrap();
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);
        let out = apply(&u, &[zero, one, zero, zero]);
        assert!(close(&out, &[zero, zero, zero, one]));
    }

    #[test]
    fn out_of_range_target_rejected() {
        assert!(full_unitary(Gate::X, &[2], 2).is_err());
        assert!(full_unitary(Gate::Cx, &[0], 2).is_err());
    }

    #[test]
    fn gate_table_lookup() {
        assert_eq!(Gate::parse("cx").unwrap(), Gate::Cx);
        assert_eq!(Gate::parse("H").unwrap(), Gate::H);
        assert!(matches!(
            Gate::parse("fredkin"),
            Err(crate::QuantumError::UnknownGate(_))
        ));
    }

    #[test]
    fn unitaries_are_unitary() {
        for gate in [Gate::H, Gate::X, Gate::Y, Gate::Z, Gate::S, Gate::T] {
            let u = gate.unitary();
            let ud = u.t().mapv(|c| c.conj());
            let prod = ud.dot(&u);
            for i in 0..2 {
                for j in 0..2 {
                    let expect = if i == j { 1.0 } else { 0.0 };
                    assert!((prod[(i, j)] - Complex64::new(expect, 0.0)).norm() < 1e-10);
                }
            }
        }
    }
}
