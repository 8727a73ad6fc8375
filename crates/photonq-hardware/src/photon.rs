//! Photon model.

use photonq_quantum::StateKey;

/// Qubit encoding carried by a photon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhotonEncoding {
    /// Photon emitted by a single-atom memory during heralded generation.
    ///
    /// Carries a reference to the emitting memory's quantum state rather
    /// than its own amplitudes; `is_null` marks a photon whose memory was
    /// measured in the ground state (a vacuum emission slot).
    SingleAtom {
        /// Node owning the emitting memory.
        node: String,
        /// Name of the emitting memory.
        memory: String,
        /// The memory's key in the quantum manager.
        qstate_key: StateKey,
        /// True when the slot carries no real photon.
        is_null: bool,
    },

    /// Polarization-encoded photon used by BB84.
    Polarization {
        /// Preparation basis (0 = rectilinear, 1 = diagonal).
        basis: u8,
        /// Encoded bit in that basis.
        bit: u8,
        /// Set when the channel scrambled the polarization; measurement
        /// then yields an uncorrelated bit even in the matching basis.
        scrambled: bool,
    },
}

/// A photon in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Photon {
    /// Wavelength in nm (bookkeeping only).
    pub wavelength: f64,
    /// Name of the emitting component.
    pub location: String,
    /// Qubit encoding.
    pub encoding: PhotonEncoding,
}

impl Photon {
    /// True for a single-atom photon marking an empty emission slot.
    pub fn is_null(&self) -> bool {
        matches!(
            &self.encoding,
            PhotonEncoding::SingleAtom { is_null: true, .. }
        )
    }
}
