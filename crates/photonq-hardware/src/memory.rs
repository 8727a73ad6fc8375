//! Single-atom quantum memory.
//!
//! The memory stores one qubit as the spin state of a single ion. Excitation
//! measures the qubit and may emit a photon referencing the memory's state
//! key; decoherence is handled by an expiration event scheduled by the
//! engine at `generation time + coherence time · cutoff ratio`.

use num_complex::Complex64;
use photonq_kernel::{EventId, SimRng, SECOND};
use photonq_quantum::{Circuit, Formalism, QuantumManager, StateKey};

use crate::photon::{Photon, PhotonEncoding};

/// Remote end of an entangled pair, by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntangledRemote {
    /// Remote node name.
    pub node: String,
    /// Remote memory name.
    pub memory: String,
}

/// Construction parameters for a memory.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Raw (post-generation) entanglement fidelity.
    pub fidelity: f64,
    /// Maximum excitation frequency in Hz.
    pub frequency: f64,
    /// Photon emission probability per excitation.
    pub efficiency: f64,
    /// Usable lifetime in seconds; `None` disables expiration.
    pub coherence_time: Option<f64>,
    /// Emission wavelength in nm.
    pub wavelength: f64,
    /// Multiplier on the coherence time for the expiration schedule.
    /// Values above 1 are accepted and passed through unchanged.
    pub cutoff_ratio: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            fidelity: 0.85,
            frequency: 80e6,
            efficiency: 1.0,
            coherence_time: None,
            wavelength: 500.0,
            cutoff_ratio: 1.0,
        }
    }
}

/// Individual single-atom memory.
#[derive(Debug)]
pub struct Memory {
    /// Unique memory name (`<node>.memo[<index>]`).
    pub name: String,
    /// Owning node name.
    pub owner: String,
    /// Current entanglement fidelity (0 when unentangled).
    pub fidelity: f64,
    /// Fidelity assigned on successful generation.
    pub raw_fidelity: f64,
    /// Maximum excitation frequency in Hz.
    pub frequency: f64,
    /// Photon emission probability.
    pub efficiency: f64,
    /// Usable lifetime in seconds.
    pub coherence_time: Option<f64>,
    /// Emission wavelength in nm.
    pub wavelength: f64,
    /// Expiration schedule multiplier.
    pub cutoff_ratio: f64,
    /// Key of this memory's qubit in the quantum manager.
    pub qstate_key: StateKey,
    /// Remote entangled memory, if any.
    pub entangled_memory: Option<EntangledRemote>,
    /// Earliest time the memory may be excited again (ps).
    pub next_excite_time: u64,
    /// Pending expiration event, if scheduled.
    pub expiration_event: Option<EventId>,
    /// Simulation time of the most recent successful entanglement (ps).
    pub generation_time: Option<u64>,
}

impl Memory {
    /// Creates a memory and registers its qubit with the quantum manager.
    pub fn new(name: String, owner: String, config: &MemoryConfig, qm: &mut QuantumManager) -> Self {
        assert!((0.0..=1.0).contains(&config.fidelity), "fidelity in [0,1]");
        assert!(
            (0.0..=1.0).contains(&config.efficiency),
            "efficiency in [0,1]"
        );
        Self {
            name,
            owner,
            fidelity: 0.0,
            raw_fidelity: config.fidelity,
            frequency: config.frequency,
            efficiency: config.efficiency,
            coherence_time: config.coherence_time,
            wavelength: config.wavelength,
            cutoff_ratio: config.cutoff_ratio,
            qstate_key: qm.new_key(),
            entangled_memory: None,
            next_excite_time: 0,
            expiration_event: None,
            generation_time: None,
        }
    }

    /// Excites the memory, measuring its qubit and possibly emitting a
    /// photon addressed at `dst` (a BSM node).
    ///
    /// Returns `None` when the memory is still inside its excitation period
    /// or the emission was lost to efficiency.
    pub fn excite(
        &mut self,
        qm: &mut QuantumManager,
        rng: &mut SimRng,
        now: u64,
    ) -> Option<Photon> {
        if now < self.next_excite_time {
            return None;
        }

        // Ground-state occupation decides nullness. The Bell-diagonal
        // formalism carries no per-qubit amplitudes, so the |+⟩ emission
        // statistics are drawn directly; fidelity bookkeeping stays with
        // the protocol layer.
        let ground = match qm.formalism() {
            Formalism::BellDiagonal => rng.coin() == 0,
            _ => {
                let mut meas = Circuit::new(1);
                meas.measure(0);
                let outcome = qm
                    .run_circuit(&meas, &[self.qstate_key], Some(rng.random_f64()))
                    .expect("memory key registered");
                outcome[&self.qstate_key] == 0
            }
        };

        if self.frequency > 0.0 {
            let period = photonq_kernel::ratio_to_ps(u128::from(SECOND), self.frequency as u128);
            self.next_excite_time = now + period;
        }

        if ground || rng.random_f64() < self.efficiency {
            Some(Photon {
                wavelength: self.wavelength,
                location: self.name.clone(),
                encoding: PhotonEncoding::SingleAtom {
                    node: self.owner.clone(),
                    memory: self.name.clone(),
                    qstate_key: self.qstate_key,
                    is_null: ground,
                },
            })
        } else {
            None
        }
    }

    /// Sets the memory qubit to an arbitrary pure state and clears
    /// entanglement bookkeeping.
    pub fn update_state(&mut self, qm: &mut QuantumManager, state: &[Complex64]) {
        if qm.formalism() != Formalism::BellDiagonal {
            qm.set(&[self.qstate_key], state)
                .expect("single-qubit state update");
        }
        self.entangled_memory = None;
    }

    /// Clears the memory: |0⟩ state, no entanglement, zero fidelity.
    ///
    /// The expiration event id is returned so the engine can cancel it.
    pub fn reset(&mut self, qm: &mut QuantumManager) -> Option<EventId> {
        self.fidelity = 0.0;
        self.entangled_memory = None;
        self.generation_time = None;
        qm.set_to_zero(self.qstate_key)
            .expect("memory key registered");
        self.expiration_event.take()
    }

    /// Decoherence map applied when the memory expires. The entangled
    /// pointer is nulled here, before any observer sees the event.
    pub fn expire(&mut self, qm: &mut QuantumManager) {
        self.fidelity = 0.0;
        self.entangled_memory = None;
        self.generation_time = None;
        self.expiration_event = None;
        qm.set_to_zero(self.qstate_key)
            .expect("memory key registered");
    }

    /// Absolute expiration time for an entanglement achieved at
    /// `generation_time`, or `None` when coherence is unlimited.
    pub fn expire_time(&self, generation_time: u64) -> Option<u64> {
        let coherence = self.coherence_time?;
        if coherence <= 0.0 {
            return None;
        }
        let window_s = coherence * self.cutoff_ratio;
        let window_ps = (window_s * SECOND as f64).round() as u64;
        Some(generation_time + window_ps)
    }

    /// Marks successful entanglement with a remote memory.
    pub fn set_entangled(&mut self, remote: EntangledRemote, fidelity: f64, now: u64) {
        self.entangled_memory = Some(remote);
        self.fidelity = fidelity;
        self.generation_time = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photonq_quantum::Formalism;

    fn make(config: MemoryConfig) -> (Memory, QuantumManager, SimRng) {
        let mut qm = QuantumManager::new(Formalism::Ket, 16);
        let memory = Memory::new("r1.memo[0]".into(), "r1".into(), &config, &mut qm);
        let rng = SimRng::for_entity(0, "r1.memo[0]");
        (memory, qm, rng)
    }

    #[test]
    fn ground_state_excite_emits_null_photon() {
        let (mut memory, mut qm, mut rng) = make(MemoryConfig::default());
        // Fresh memory is |0>, so the photon is null regardless of
        // efficiency draws.
        let photon = memory.excite(&mut qm, &mut rng, 0).expect("null photon");
        assert!(photon.is_null());
    }

    #[test]
    fn excite_respects_frequency_gate() {
        let (mut memory, mut qm, mut rng) = make(MemoryConfig::default());
        memory.excite(&mut qm, &mut rng, 0).expect("first excite");
        // 80 MHz → 12.5 µs period; an immediate retry is inside the window.
        assert!(memory.excite(&mut qm, &mut rng, 1).is_none());
        assert!(memory.next_excite_time > 1);
    }

    #[test]
    fn plus_state_excite_measures_qubit() {
        let (mut memory, mut qm, mut rng) = make(MemoryConfig::default());
        let h = std::f64::consts::FRAC_1_SQRT_2;
        memory.update_state(&mut qm, &[Complex64::new(h, 0.0), Complex64::new(h, 0.0)]);

        let photon = memory.excite(&mut qm, &mut rng, 0).expect("efficiency 1");
        // After excitation the qubit has collapsed; the photon's nullness
        // reflects the outcome.
        match &photon.encoding {
            PhotonEncoding::SingleAtom { qstate_key, .. } => {
                assert_eq!(*qstate_key, memory.qstate_key);
            }
            other => panic!("unexpected encoding {other:?}"),
        }
    }

    #[test]
    fn expire_nulls_pointer_and_fidelity() {
        let (mut memory, mut qm, _) = make(MemoryConfig::default());
        memory.set_entangled(
            EntangledRemote {
                node: "r2".into(),
                memory: "r2.memo[0]".into(),
            },
            0.9,
            1_000,
        );
        memory.expire(&mut qm);

        assert!(memory.entangled_memory.is_none());
        assert_eq!(memory.fidelity, 0.0);
    }

    #[test]
    fn expire_time_uses_cutoff_ratio() {
        let config = MemoryConfig {
            coherence_time: Some(1.0),
            cutoff_ratio: 2.0,
            ..MemoryConfig::default()
        };
        let (memory, _, _) = make(config);
        assert_eq!(memory.expire_time(5), Some(5 + 2 * SECOND));
    }

    #[test]
    fn no_coherence_means_no_expiration() {
        let (memory, _, _) = make(MemoryConfig::default());
        assert_eq!(memory.expire_time(0), None);
    }
}
