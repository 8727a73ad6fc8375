//! The quantum state manager.
//!
//! One manager instance is shared by every node in a simulation. The
//! formalism is chosen once at startup through the variant factory table
//! and frozen; all later calls dispatch statically within that variant.

use std::collections::{BTreeMap, HashMap};

use ndarray::{Array1, Array2};
use num_complex::Complex64;

use crate::cache::{fingerprint_mat, fingerprint_vec, GateKey, MeasureEval, MeasureKey, OpCache};
use crate::circuit::Circuit;
use crate::error::QuantumError;
use crate::gates::{full_unitary, Gate};
use crate::state::{BellDiagonalState, DensityState, KetState, StateKey};

/// Default LRU capacity for the gate and measurement caches.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

// ============================================================================
// Formalism Selection
// ============================================================================

/// Quantum state representation, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formalism {
    /// Pure states as complex amplitude vectors.
    Ket,
    /// Mixed states as density matrices.
    Density,
    /// Bipartite Bell-diagonal probability tuples.
    BellDiagonal,
}

impl Formalism {
    /// Name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Formalism::Ket => "ket_vector",
            Formalism::Density => "density_matrix",
            Formalism::BellDiagonal => "bell_diagonal",
        }
    }
}

enum Variant {
    Ket(KetManager),
    Density(DensityManager),
    BellDiagonal(BdsManager),
}

fn ket_ctor(capacity: usize) -> Variant {
    Variant::Ket(KetManager::new(capacity))
}

fn density_ctor(capacity: usize) -> Variant {
    Variant::Density(DensityManager::new(capacity))
}

fn bds_ctor(_capacity: usize) -> Variant {
    // BDS states are four floats; nothing worth caching.
    Variant::BellDiagonal(BdsManager::new())
}

/// Registry of formalism constructors. The startup selector walks this
/// table once; the chosen variant is frozen for the life of the manager.
const FACTORY: &[(Formalism, fn(usize) -> Variant)] = &[
    (Formalism::Ket, ket_ctor),
    (Formalism::Density, density_ctor),
    (Formalism::BellDiagonal, bds_ctor),
];

// ============================================================================
// State View
// ============================================================================

/// Read-only view of a stored state and its co-owning keys.
#[derive(Debug)]
pub enum StateView<'a> {
    /// Amplitude vector and key list.
    Ket {
        amplitudes: &'a Array1<Complex64>,
        keys: &'a [StateKey],
    },
    /// Density matrix and key list.
    Density {
        matrix: &'a Array2<Complex64>,
        keys: &'a [StateKey],
    },
    /// Bell-diagonal probabilities and the key pair.
    BellDiagonal { probs: [f64; 4], keys: [StateKey; 2] },
}

impl StateView<'_> {
    /// Keys co-owning the viewed state.
    pub fn keys(&self) -> Vec<StateKey> {
        match self {
            StateView::Ket { keys, .. } | StateView::Density { keys, .. } => keys.to_vec(),
            StateView::BellDiagonal { keys, .. } => keys.to_vec(),
        }
    }
}

// ============================================================================
// Quantum Manager
// ============================================================================

/// Shared store of quantum states keyed by memory identifiers.
pub struct QuantumManager {
    formalism: Formalism,
    variant: Variant,
}

impl QuantumManager {
    /// Creates a manager with the chosen formalism and cache capacity.
    pub fn new(formalism: Formalism, cache_capacity: usize) -> Self {
        let (_, ctor) = FACTORY
            .iter()
            .find(|(f, _)| *f == formalism)
            .expect("formalism registered in factory table");
        Self {
            formalism,
            variant: ctor(cache_capacity),
        }
    }

    /// The frozen formalism of this manager.
    pub fn formalism(&self) -> Formalism {
        self.formalism
    }

    /// Allocates a fresh key initialized to |0⟩ (ket/density) or to no
    /// state (Bell-diagonal, where states exist only for entangled pairs).
    pub fn new_key(&mut self) -> StateKey {
        match &mut self.variant {
            Variant::Ket(m) => m.new_key(),
            Variant::Density(m) => m.new_key(),
            Variant::BellDiagonal(m) => m.new_key(),
        }
    }

    /// Replaces the state shared by `keys` with the given pure amplitudes.
    ///
    /// Prior joint states of those keys are unbound (dropped once no key
    /// references them).
    pub fn set(&mut self, keys: &[StateKey], amplitudes: &[Complex64]) -> Result<(), QuantumError> {
        match &mut self.variant {
            Variant::Ket(m) => m.set(keys, amplitudes),
            Variant::Density(m) => m.set(keys, amplitudes),
            Variant::BellDiagonal(_) => Err(QuantumError::UnsupportedFormalism {
                operation: "set",
                formalism: self.formalism.name(),
            }),
        }
    }

    /// Resets a key to the |0⟩ state (unbinding it from any joint state).
    /// In the Bell-diagonal formalism the pair state is dropped.
    pub fn set_to_zero(&mut self, key: StateKey) -> Result<(), QuantumError> {
        match &mut self.variant {
            Variant::Ket(m) => m.set(&[key], &[Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)]),
            Variant::Density(m) => {
                m.set(&[key], &[Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)])
            }
            Variant::BellDiagonal(m) => {
                m.unbind(key);
                Ok(())
            }
        }
    }

    /// Returns the state view for a key.
    pub fn get(&self, key: StateKey) -> Result<StateView<'_>, QuantumError> {
        match &self.variant {
            Variant::Ket(m) => m.get(key),
            Variant::Density(m) => m.get(key),
            Variant::BellDiagonal(m) => m.get(key),
        }
    }

    /// Unbinds a key. The state survives while other keys reference it.
    pub fn remove(&mut self, key: StateKey) {
        match &mut self.variant {
            Variant::Ket(m) => m.remove(key),
            Variant::Density(m) => m.remove(key),
            Variant::BellDiagonal(m) => m.unbind(key),
        }
    }

    /// Runs a circuit over `keys`, composing underlying states as needed,
    /// and measures the circuit's measured qubits with `meas_samp`.
    ///
    /// Returns the classical outcome per measured key. After measurement
    /// the joint state splits into measured singletons plus the unmeasured
    /// remainder.
    pub fn run_circuit(
        &mut self,
        circuit: &Circuit,
        keys: &[StateKey],
        meas_samp: Option<f64>,
    ) -> Result<BTreeMap<StateKey, u8>, QuantumError> {
        if keys.len() != circuit.size() {
            return Err(QuantumError::DimensionMismatch(format!(
                "circuit size {} does not match {} supplied keys",
                circuit.size(),
                keys.len()
            )));
        }
        if !circuit.measured_qubits().is_empty() && meas_samp.is_none() {
            return Err(QuantumError::MissingMeasureSample);
        }
        match &mut self.variant {
            Variant::Ket(m) => m.run_circuit(circuit, keys, meas_samp),
            Variant::Density(m) => m.run_circuit(circuit, keys, meas_samp),
            Variant::BellDiagonal(_) => Err(QuantumError::UnsupportedFormalism {
                operation: "run_circuit",
                formalism: self.formalism.name(),
            }),
        }
    }

    /// Sets the Bell-diagonal state of a key pair.
    pub fn set_bds(
        &mut self,
        keys: [StateKey; 2],
        probs: [f64; 4],
    ) -> Result<(), QuantumError> {
        match &mut self.variant {
            Variant::BellDiagonal(m) => m.set_bds(keys, probs),
            _ => Err(QuantumError::UnsupportedFormalism {
                operation: "set_bds",
                formalism: self.formalism.name(),
            }),
        }
    }

    /// Reads the Bell-diagonal state a key participates in.
    pub fn get_bds(&self, key: StateKey) -> Result<BellDiagonalState, QuantumError> {
        match &self.variant {
            Variant::BellDiagonal(m) => m.get_bds(key),
            _ => Err(QuantumError::UnsupportedFormalism {
                operation: "get_bds",
                formalism: self.formalism.name(),
            }),
        }
    }
}

// ============================================================================
// Swap-Chain Permutation
// ============================================================================

/// Computes the SWAP-gate chain that brings each of `wanted` to the front
/// of `all_keys` in order, mutating `all_keys` to the permuted layout.
fn swap_chain(all_keys: &mut [StateKey], wanted: &[StateKey]) -> Vec<(usize, usize)> {
    let mut swaps = Vec::new();
    for (i, key) in wanted.iter().enumerate() {
        let j = all_keys
            .iter()
            .position(|k| k == key)
            .expect("wanted key present in joint state");
        if j != i {
            all_keys.swap(i, j);
            swaps.push((i, j));
        }
    }
    swaps
}

/// Decomposes a measured outcome index into per-qubit bits, most
/// significant first.
fn outcome_bits(outcome: usize, count: usize) -> Vec<u8> {
    (0..count)
        .map(|i| ((outcome >> (count - 1 - i)) & 1) as u8)
        .collect()
}

// ============================================================================
// Ket Manager
// ============================================================================

struct KetManager {
    bindings: HashMap<StateKey, u64>,
    states: HashMap<u64, KetState>,
    next_key: u64,
    next_state: u64,
    cache: OpCache<Array1<Complex64>>,
}

impl KetManager {
    fn new(cache_capacity: usize) -> Self {
        Self {
            bindings: HashMap::new(),
            states: HashMap::new(),
            next_key: 0,
            next_state: 0,
            cache: OpCache::new(cache_capacity),
        }
    }

    fn alloc_key(&mut self) -> StateKey {
        let key = StateKey(self.next_key);
        self.next_key += 1;
        key
    }

    fn new_key(&mut self) -> StateKey {
        let key = self.alloc_key();
        let state = KetState::new(
            vec![Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)],
            vec![key],
        )
        .expect("|0> is a valid ket");
        self.bind(vec![key], state);
        key
    }

    /// Binds keys to a state, dropping any prior state left keyless.
    fn bind(&mut self, keys: Vec<StateKey>, state: KetState) {
        debug_assert_eq!(keys, state.keys);
        for key in &keys {
            if let Some(old) = self.bindings.get(key).copied() {
                if let Some(old_state) = self.states.get_mut(&old) {
                    old_state.keys.retain(|k| *k != *key);
                    if old_state.keys.is_empty() {
                        self.states.remove(&old);
                    }
                }
            }
        }
        let id = self.next_state;
        self.next_state += 1;
        for key in &keys {
            self.bindings.insert(*key, id);
        }
        self.states.insert(id, state);
    }

    fn set(&mut self, keys: &[StateKey], amplitudes: &[Complex64]) -> Result<(), QuantumError> {
        let state = KetState::new(amplitudes.to_vec(), keys.to_vec())?;
        self.bind(keys.to_vec(), state);
        Ok(())
    }

    fn get(&self, key: StateKey) -> Result<StateView<'_>, QuantumError> {
        let id = self
            .bindings
            .get(&key)
            .ok_or(QuantumError::UnknownState(key))?;
        let state = self.states.get(id).ok_or(QuantumError::UnknownState(key))?;
        Ok(StateView::Ket {
            amplitudes: &state.amplitudes,
            keys: &state.keys,
        })
    }

    fn remove(&mut self, key: StateKey) {
        if let Some(id) = self.bindings.remove(&key) {
            if let Some(state) = self.states.get_mut(&id) {
                state.keys.retain(|k| *k != key);
                if state.keys.is_empty() {
                    self.states.remove(&id);
                }
            }
        }
    }

    /// Composes the joint state over `keys`, returning the amplitudes and
    /// the full ordered key list.
    fn compose(&self, keys: &[StateKey]) -> Result<(Array1<Complex64>, Vec<StateKey>), QuantumError> {
        let mut all_keys: Vec<StateKey> = Vec::new();
        let mut joint = Array1::from(vec![Complex64::new(1.0, 0.0)]);
        for key in keys {
            let id = self
                .bindings
                .get(key)
                .ok_or(QuantumError::UnknownState(*key))?;
            let state = self.states.get(id).ok_or(QuantumError::UnknownState(*key))?;
            if all_keys.contains(&state.keys[0]) {
                continue;
            }
            joint = kron_vec(&joint, &state.amplitudes);
            all_keys.extend_from_slice(&state.keys);
        }
        Ok((joint, all_keys))
    }

    fn apply_gate(
        &mut self,
        state: Array1<Complex64>,
        gate: Gate,
        targets: &[usize],
        n: usize,
    ) -> Result<Array1<Complex64>, QuantumError> {
        let key = GateKey {
            gate: gate.cache_tag(),
            targets: targets.to_vec(),
            state: fingerprint_vec(&state),
        };
        if let Some(hit) = self.cache.get_gate(&key) {
            return Ok(hit);
        }
        let unitary = full_unitary(gate, targets, n)?;
        let out = unitary.dot(&state);
        self.cache.put_gate(key, out.clone());
        Ok(out)
    }

    fn run_circuit(
        &mut self,
        circuit: &Circuit,
        keys: &[StateKey],
        meas_samp: Option<f64>,
    ) -> Result<BTreeMap<StateKey, u8>, QuantumError> {
        let (mut state, mut all_keys) = self.compose(keys)?;
        let n = all_keys.len();

        // Line the caller's keys up with local qubit indices.
        for (i, j) in swap_chain(&mut all_keys, keys) {
            state = self.apply_gate(state, Gate::Swap, &[i, j], n)?;
        }

        for (gate, targets) in circuit.gates() {
            state = self.apply_gate(state, *gate, targets, n)?;
        }

        if circuit.measured_qubits().is_empty() {
            let new_state = KetState::new(state.to_vec(), all_keys.clone())?;
            self.bind(all_keys, new_state);
            return Ok(BTreeMap::new());
        }

        // Permute measured keys to the front, then measure.
        let measured_keys: Vec<StateKey> = circuit
            .measured_qubits()
            .iter()
            .map(|q| keys[*q])
            .collect();
        for (i, j) in swap_chain(&mut all_keys, &measured_keys) {
            state = self.apply_gate(state, Gate::Swap, &[i, j], n)?;
        }

        let m = measured_keys.len();
        let samp = meas_samp.expect("sample checked by caller");
        let eval = self.measure_eval(&state, m, n);

        let mut outcome = eval.probabilities.len() - 1;
        let mut cumulative = 0.0;
        for (i, p) in eval.probabilities.iter().enumerate() {
            cumulative += p;
            if samp < cumulative {
                outcome = i;
                break;
            }
        }

        let bits = outcome_bits(outcome, m);
        let basis = [
            vec![Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)],
            vec![Complex64::new(0.0, 0.0), Complex64::new(1.0, 0.0)],
        ];
        for (key, bit) in measured_keys.iter().zip(&bits) {
            let single = KetState::new(basis[*bit as usize].clone(), vec![*key])
                .expect("basis state is valid");
            self.bind(vec![*key], single);
        }

        let remainder_keys: Vec<StateKey> = all_keys[m..].to_vec();
        if !remainder_keys.is_empty() {
            let remainder = eval.remainders[outcome]
                .clone()
                .expect("nonzero-probability outcome has a remainder");
            let new_state = KetState::new(remainder.to_vec(), remainder_keys.clone())?;
            self.bind(remainder_keys, new_state);
        }

        Ok(measured_keys.into_iter().zip(bits).collect())
    }

    /// Outcome probabilities and collapsed remainders for measuring the
    /// first `m` of `n` qubits. Cached.
    fn measure_eval(
        &mut self,
        state: &Array1<Complex64>,
        m: usize,
        n: usize,
    ) -> MeasureEval<Array1<Complex64>> {
        let key = MeasureKey {
            measured: m,
            state: fingerprint_vec(state),
        };
        if let Some(hit) = self.cache.get_measure(&key) {
            return hit;
        }

        let rem_dim = 1usize << (n - m);
        let outcomes = 1usize << m;
        let mut probabilities = Vec::with_capacity(outcomes);
        let mut remainders = Vec::with_capacity(outcomes);
        for outcome in 0..outcomes {
            let block = state.slice(ndarray::s![outcome * rem_dim..(outcome + 1) * rem_dim]);
            let p: f64 = block.iter().map(|a| a.norm_sqr()).sum();
            probabilities.push(p);
            if p > 1e-12 && n > m {
                let norm = p.sqrt();
                remainders.push(Some(block.mapv(|a| a / norm)));
            } else {
                remainders.push(None);
            }
        }

        let eval = MeasureEval {
            probabilities,
            remainders,
        };
        self.cache.put_measure(key, eval.clone());
        eval
    }
}

fn kron_vec(a: &Array1<Complex64>, b: &Array1<Complex64>) -> Array1<Complex64> {
    let mut out = Array1::zeros(a.len() * b.len());
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i * b.len() + j] = x * y;
        }
    }
    out
}

// ============================================================================
// Density Manager
// ============================================================================

struct DensityManager {
    bindings: HashMap<StateKey, u64>,
    states: HashMap<u64, DensityState>,
    next_key: u64,
    next_state: u64,
    cache: OpCache<Array2<Complex64>>,
}

impl DensityManager {
    fn new(cache_capacity: usize) -> Self {
        Self {
            bindings: HashMap::new(),
            states: HashMap::new(),
            next_key: 0,
            next_state: 0,
            cache: OpCache::new(cache_capacity),
        }
    }

    fn new_key(&mut self) -> StateKey {
        let key = StateKey(self.next_key);
        self.next_key += 1;
        let state = DensityState::from_pure(
            &[Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)],
            vec![key],
        )
        .expect("|0><0| is a valid density matrix");
        self.bind(vec![key], state);
        key
    }

    fn bind(&mut self, keys: Vec<StateKey>, state: DensityState) {
        debug_assert_eq!(keys, state.keys);
        for key in &keys {
            if let Some(old) = self.bindings.get(key).copied() {
                if let Some(old_state) = self.states.get_mut(&old) {
                    old_state.keys.retain(|k| *k != *key);
                    if old_state.keys.is_empty() {
                        self.states.remove(&old);
                    }
                }
            }
        }
        let id = self.next_state;
        self.next_state += 1;
        for key in &keys {
            self.bindings.insert(*key, id);
        }
        self.states.insert(id, state);
    }

    fn set(&mut self, keys: &[StateKey], amplitudes: &[Complex64]) -> Result<(), QuantumError> {
        let state = DensityState::from_pure(amplitudes, keys.to_vec())?;
        self.bind(keys.to_vec(), state);
        Ok(())
    }

    fn get(&self, key: StateKey) -> Result<StateView<'_>, QuantumError> {
        let id = self
            .bindings
            .get(&key)
            .ok_or(QuantumError::UnknownState(key))?;
        let state = self.states.get(id).ok_or(QuantumError::UnknownState(key))?;
        Ok(StateView::Density {
            matrix: &state.matrix,
            keys: &state.keys,
        })
    }

    fn remove(&mut self, key: StateKey) {
        if let Some(id) = self.bindings.remove(&key) {
            if let Some(state) = self.states.get_mut(&id) {
                state.keys.retain(|k| *k != key);
                if state.keys.is_empty() {
                    self.states.remove(&id);
                }
            }
        }
    }

    fn compose(&self, keys: &[StateKey]) -> Result<(Array2<Complex64>, Vec<StateKey>), QuantumError> {
        let mut all_keys: Vec<StateKey> = Vec::new();
        let mut joint = Array2::from_shape_vec((1, 1), vec![Complex64::new(1.0, 0.0)])
            .expect("1x1 seed matrix");
        for key in keys {
            let id = self
                .bindings
                .get(key)
                .ok_or(QuantumError::UnknownState(*key))?;
            let state = self.states.get(id).ok_or(QuantumError::UnknownState(*key))?;
            if all_keys.contains(&state.keys[0]) {
                continue;
            }
            joint = kron_mat(&joint, &state.matrix);
            all_keys.extend_from_slice(&state.keys);
        }
        Ok((joint, all_keys))
    }

    fn apply_gate(
        &mut self,
        state: Array2<Complex64>,
        gate: Gate,
        targets: &[usize],
        n: usize,
    ) -> Result<Array2<Complex64>, QuantumError> {
        let key = GateKey {
            gate: gate.cache_tag(),
            targets: targets.to_vec(),
            state: fingerprint_mat(&state),
        };
        if let Some(hit) = self.cache.get_gate(&key) {
            return Ok(hit);
        }
        let unitary = full_unitary(gate, targets, n)?;
        let dagger = unitary.t().mapv(|c| c.conj());
        let out = unitary.dot(&state).dot(&dagger);
        self.cache.put_gate(key, out.clone());
        Ok(out)
    }

    fn run_circuit(
        &mut self,
        circuit: &Circuit,
        keys: &[StateKey],
        meas_samp: Option<f64>,
    ) -> Result<BTreeMap<StateKey, u8>, QuantumError> {
        let (mut state, mut all_keys) = self.compose(keys)?;
        let n = all_keys.len();

        for (i, j) in swap_chain(&mut all_keys, keys) {
            state = self.apply_gate(state, Gate::Swap, &[i, j], n)?;
        }

        for (gate, targets) in circuit.gates() {
            state = self.apply_gate(state, *gate, targets, n)?;
        }

        if circuit.measured_qubits().is_empty() {
            let new_state = DensityState::new(state, all_keys.clone())?;
            self.bind(all_keys, new_state);
            return Ok(BTreeMap::new());
        }

        let measured_keys: Vec<StateKey> = circuit
            .measured_qubits()
            .iter()
            .map(|q| keys[*q])
            .collect();
        for (i, j) in swap_chain(&mut all_keys, &measured_keys) {
            state = self.apply_gate(state, Gate::Swap, &[i, j], n)?;
        }

        let m = measured_keys.len();
        let samp = meas_samp.expect("sample checked by caller");
        let eval = self.measure_eval(&state, m, n);

        let mut outcome = eval.probabilities.len() - 1;
        let mut cumulative = 0.0;
        for (i, p) in eval.probabilities.iter().enumerate() {
            cumulative += p;
            if samp < cumulative {
                outcome = i;
                break;
            }
        }

        let bits = outcome_bits(outcome, m);
        for (key, bit) in measured_keys.iter().zip(&bits) {
            let basis = if *bit == 0 {
                [Complex64::new(1.0, 0.0), Complex64::new(0.0, 0.0)]
            } else {
                [Complex64::new(0.0, 0.0), Complex64::new(1.0, 0.0)]
            };
            let single = DensityState::from_pure(&basis, vec![*key]).expect("basis density");
            self.bind(vec![*key], single);
        }

        let remainder_keys: Vec<StateKey> = all_keys[m..].to_vec();
        if !remainder_keys.is_empty() {
            let remainder = eval.remainders[outcome]
                .clone()
                .expect("nonzero-probability outcome has a remainder");
            let new_state = DensityState::new(remainder, remainder_keys.clone())?;
            self.bind(remainder_keys, new_state);
        }

        Ok(measured_keys.into_iter().zip(bits).collect())
    }

    fn measure_eval(
        &mut self,
        state: &Array2<Complex64>,
        m: usize,
        n: usize,
    ) -> MeasureEval<Array2<Complex64>> {
        let key = MeasureKey {
            measured: m,
            state: fingerprint_mat(state),
        };
        if let Some(hit) = self.cache.get_measure(&key) {
            return hit;
        }

        let rem_dim = 1usize << (n - m);
        let outcomes = 1usize << m;
        let mut probabilities = Vec::with_capacity(outcomes);
        let mut remainders = Vec::with_capacity(outcomes);
        for outcome in 0..outcomes {
            let lo = outcome * rem_dim;
            let hi = lo + rem_dim;
            let block = state.slice(ndarray::s![lo..hi, lo..hi]).to_owned();
            let p: f64 = block.diag().iter().map(|c| c.re).sum();
            probabilities.push(p);
            if p > 1e-12 && n > m {
                remainders.push(Some(block.mapv(|c| c / p)));
            } else {
                remainders.push(None);
            }
        }

        let eval = MeasureEval {
            probabilities,
            remainders,
        };
        self.cache.put_measure(key, eval.clone());
        eval
    }
}

fn kron_mat(a: &Array2<Complex64>, b: &Array2<Complex64>) -> Array2<Complex64> {
    let (ar, ac) = a.dim();
    let (br, bc) = b.dim();
    let mut out = Array2::zeros((ar * br, ac * bc));
    for i in 0..ar {
        for j in 0..ac {
            for k in 0..br {
                for l in 0..bc {
                    out[(i * br + k, j * bc + l)] = a[(i, j)] * b[(k, l)];
                }
            }
        }
    }
    out
}

// ============================================================================
// Bell-Diagonal Manager
// ============================================================================

struct BdsManager {
    bindings: HashMap<StateKey, u64>,
    states: HashMap<u64, BellDiagonalState>,
    next_key: u64,
    next_state: u64,
}

impl BdsManager {
    fn new() -> Self {
        Self {
            bindings: HashMap::new(),
            states: HashMap::new(),
            next_key: 0,
            next_state: 0,
        }
    }

    /// Keys start unbound: a Bell-diagonal state exists only once a pair is
    /// entangled.
    fn new_key(&mut self) -> StateKey {
        let key = StateKey(self.next_key);
        self.next_key += 1;
        key
    }

    fn set_bds(&mut self, keys: [StateKey; 2], probs: [f64; 4]) -> Result<(), QuantumError> {
        let state = BellDiagonalState::new(probs, keys)?;
        self.unbind(keys[0]);
        self.unbind(keys[1]);
        let id = self.next_state;
        self.next_state += 1;
        self.bindings.insert(keys[0], id);
        self.bindings.insert(keys[1], id);
        self.states.insert(id, state);
        Ok(())
    }

    fn get_bds(&self, key: StateKey) -> Result<BellDiagonalState, QuantumError> {
        let id = self
            .bindings
            .get(&key)
            .ok_or(QuantumError::UnknownState(key))?;
        self.states
            .get(id)
            .copied()
            .ok_or(QuantumError::UnknownState(key))
    }

    fn get(&self, key: StateKey) -> Result<StateView<'_>, QuantumError> {
        let state = self.get_bds(key)?;
        Ok(StateView::BellDiagonal {
            probs: state.probs,
            keys: state.keys,
        })
    }

    /// Drops the pair state a key participates in (both bindings).
    fn unbind(&mut self, key: StateKey) {
        if let Some(id) = self.bindings.remove(&key) {
            if let Some(state) = self.states.remove(&id) {
                for other in state.keys {
                    if other != key {
                        self.bindings.remove(&other);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BELL_PHI_PLUS;

    fn amp(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    #[test]
    fn new_keys_start_in_zero() {
        let mut qm = QuantumManager::new(Formalism::Ket, 16);
        let k = qm.new_key();
        match qm.get(k).unwrap() {
            StateView::Ket { amplitudes, keys } => {
                assert_eq!(keys, &[k]);
                assert_eq!(amplitudes[0], amp(1.0));
                assert_eq!(amplitudes[1], amp(0.0));
            }
            _ => panic!("ket formalism expected"),
        }
    }

    #[test]
    fn unknown_key_fails() {
        let qm = QuantumManager::new(Formalism::Ket, 16);
        assert!(matches!(
            qm.get(StateKey(99)),
            Err(QuantumError::UnknownState(_))
        ));
    }

    #[test]
    fn set_binds_joint_state_to_all_keys() {
        let mut qm = QuantumManager::new(Formalism::Ket, 16);
        let k1 = qm.new_key();
        let k2 = qm.new_key();
        qm.set(&[k1, k2], &BELL_PHI_PLUS).unwrap();

        for k in [k1, k2] {
            let view = qm.get(k).unwrap();
            assert_eq!(view.keys(), vec![k1, k2]);
        }
    }

    #[test]
    fn empty_circuit_is_a_noop() {
        let mut qm = QuantumManager::new(Formalism::Ket, 16);
        let k1 = qm.new_key();
        let k2 = qm.new_key();
        qm.set(&[k1, k2], &BELL_PHI_PLUS).unwrap();

        let before: Vec<Complex64> = match qm.get(k1).unwrap() {
            StateView::Ket { amplitudes, .. } => amplitudes.to_vec(),
            _ => unreachable!(),
        };

        let circuit = Circuit::new(2);
        let res = qm.run_circuit(&circuit, &[k1, k2], None).unwrap();
        assert!(res.is_empty());

        match qm.get(k1).unwrap() {
            StateView::Ket { amplitudes, keys } => {
                assert_eq!(keys, &[k1, k2]);
                for (a, b) in amplitudes.iter().zip(&before) {
                    assert_eq!(a.re.to_bits(), b.re.to_bits());
                    assert_eq!(a.im.to_bits(), b.im.to_bits());
                }
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn double_x_restores_amplitudes_exactly() {
        let mut qm = QuantumManager::new(Formalism::Ket, 16);
        let k = qm.new_key();
        qm.set(&[k], &[amp(0.6), amp(0.8)]).unwrap();

        let before: Vec<u64> = match qm.get(k).unwrap() {
            StateView::Ket { amplitudes, .. } => {
                amplitudes.iter().flat_map(|a| [a.re.to_bits(), a.im.to_bits()]).collect()
            }
            _ => unreachable!(),
        };

        let mut x = Circuit::new(1);
        x.x(0);
        qm.run_circuit(&x, &[k], None).unwrap();
        qm.run_circuit(&x, &[k], None).unwrap();

        let after: Vec<u64> = match qm.get(k).unwrap() {
            StateView::Ket { amplitudes, .. } => {
                amplitudes.iter().flat_map(|a| [a.re.to_bits(), a.im.to_bits()]).collect()
            }
            _ => unreachable!(),
        };
        assert_eq!(before, after);
    }

    #[test]
    fn measurement_splits_joint_state() {
        let mut qm = QuantumManager::new(Formalism::Ket, 16);
        let k1 = qm.new_key();
        let k2 = qm.new_key();
        qm.set(&[k1, k2], &BELL_PHI_PLUS).unwrap();

        let mut c = Circuit::new(2);
        c.measure(0);
        let res = qm.run_circuit(&c, &[k1, k2], Some(0.3)).unwrap();
        let bit = res[&k1];

        // Bell correlations: the unmeasured qubit collapses to the same bit.
        match qm.get(k2).unwrap() {
            StateView::Ket { amplitudes, keys } => {
                assert_eq!(keys, &[k2]);
                let expect_one = bit == 1;
                assert!((amplitudes[usize::from(expect_one)].norm() - 1.0).abs() < 1e-9);
            }
            _ => unreachable!(),
        }
        // The measured qubit is now a singleton basis state.
        match qm.get(k1).unwrap() {
            StateView::Ket { keys, .. } => assert_eq!(keys, &[k1]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn measurement_sample_drives_outcome() {
        // |+> state measured with sample below 0.5 gives 0, above gives 1.
        let mut qm = QuantumManager::new(Formalism::Ket, 16);
        let k = qm.new_key();
        let h = std::f64::consts::FRAC_1_SQRT_2;
        qm.set(&[k], &[amp(h), amp(h)]).unwrap();

        let mut c = Circuit::new(1);
        c.measure(0);
        let res = qm.run_circuit(&c, &[k], Some(0.2)).unwrap();
        assert_eq!(res[&k], 0);

        qm.set(&[k], &[amp(h), amp(h)]).unwrap();
        let res = qm.run_circuit(&c, &[k], Some(0.9)).unwrap();
        assert_eq!(res[&k], 1);
    }

    #[test]
    fn measurement_requires_sample() {
        let mut qm = QuantumManager::new(Formalism::Ket, 16);
        let k = qm.new_key();
        let mut c = Circuit::new(1);
        c.measure(0);
        assert!(matches!(
            qm.run_circuit(&c, &[k], None),
            Err(QuantumError::MissingMeasureSample)
        ));
    }

    #[test]
    fn compose_reorders_to_caller_key_order() {
        // Prepare k1,k2 jointly, then run with keys reversed: X on circuit
        // qubit 0 must act on k2.
        let mut qm = QuantumManager::new(Formalism::Ket, 16);
        let k1 = qm.new_key();
        let k2 = qm.new_key();
        // |k1 k2> = |10>
        qm.set(&[k1, k2], &[amp(0.0), amp(0.0), amp(1.0), amp(0.0)]).unwrap();

        let mut x = Circuit::new(2);
        x.x(0);
        qm.run_circuit(&x, &[k2, k1], None).unwrap();

        // Now k2 flipped: joint state |k2 k1> basis. Measure both.
        let mut c = Circuit::new(2);
        c.measure(0).measure(1);
        let res = qm.run_circuit(&c, &[k1, k2], Some(0.5)).unwrap();
        assert_eq!(res[&k1], 1, "k1 unchanged");
        assert_eq!(res[&k2], 1, "k2 flipped by X");
    }

    #[test]
    fn density_formalism_bell_measurement_correlates() {
        let mut qm = QuantumManager::new(Formalism::Density, 16);
        let k1 = qm.new_key();
        let k2 = qm.new_key();
        qm.set(&[k1, k2], &BELL_PHI_PLUS).unwrap();

        let mut c = Circuit::new(2);
        c.measure(0).measure(1);
        let res = qm.run_circuit(&c, &[k1, k2], Some(0.7)).unwrap();
        assert_eq!(res[&k1], res[&k2], "Bell pair outcomes agree");
    }

    #[test]
    fn bds_round_trip_and_unbind() {
        let mut qm = QuantumManager::new(Formalism::BellDiagonal, 16);
        let k1 = qm.new_key();
        let k2 = qm.new_key();
        qm.set_bds([k1, k2], [0.85, 0.05, 0.05, 0.05]).unwrap();

        assert!((qm.get_bds(k1).unwrap().fidelity() - 0.85).abs() < 1e-12);
        assert_eq!(qm.get_bds(k2).unwrap().keys, [k1, k2]);

        qm.set_to_zero(k1).unwrap();
        assert!(qm.get_bds(k1).is_err());
        assert!(qm.get_bds(k2).is_err());
    }

    #[test]
    fn bds_rejects_circuits() {
        let mut qm = QuantumManager::new(Formalism::BellDiagonal, 16);
        let k = qm.new_key();
        let c = Circuit::new(1);
        assert!(matches!(
            qm.run_circuit(&c, &[k], None),
            Err(QuantumError::UnsupportedFormalism { .. })
        ));
    }

    #[test]
    fn remove_drops_state_when_last_key_leaves() {
        let mut qm = QuantumManager::new(Formalism::Ket, 16);
        let k1 = qm.new_key();
        let k2 = qm.new_key();
        qm.set(&[k1, k2], &BELL_PHI_PLUS).unwrap();

        qm.remove(k1);
        assert!(qm.get(k1).is_err());
        // k2 still references the (now partial) state record.
        assert!(qm.get(k2).is_ok());
    }
}
