//! Optical fiber channels.
//!
//! The classical channel is lossless with a fixed delay and propagates the
//! caller's priority unchanged, which makes per-channel delivery FIFO. The
//! quantum channel attenuates photons and allocates discrete transmission
//! time bins at its maximum qubit frequency.
//!
//! All delay arithmetic is exact integer rational math; no run may depend
//! on host floating-point rounding of a propagation time.

use std::collections::BTreeSet;

use photonq_kernel::{ratio_to_ps, SimRng, SECOND};

use crate::photon::{Photon, PhotonEncoding};

/// Speed of light in fiber, as the exact rational
/// `LIGHT_SPEED_NUMER_M / LIGHT_SPEED_DENOM_PS` meters per picosecond
/// (2·10⁻⁴ m/ps).
pub const LIGHT_SPEED_NUMER_M: u128 = 1;
/// See [`LIGHT_SPEED_NUMER_M`].
pub const LIGHT_SPEED_DENOM_PS: u128 = 5_000;

/// Propagation delay for a fiber of `distance` meters.
fn fiber_delay_ps(distance: f64) -> u64 {
    // Micrometer resolution keeps sub-meter distances exact.
    let micrometers = (distance * 1e6).round() as u128;
    ratio_to_ps(micrometers * LIGHT_SPEED_DENOM_PS, 1_000_000 * LIGHT_SPEED_NUMER_M)
}

// ============================================================================
// Classical Channel
// ============================================================================

/// One-directional classical link between two nodes.
#[derive(Debug, Clone)]
pub struct ClassicalChannel {
    /// Channel name.
    pub name: String,
    /// Sending node name.
    pub sender: String,
    /// Receiving node name.
    pub receiver: String,
    /// Fiber length in meters.
    pub distance: f64,
    /// Message delay in ps.
    pub delay: u64,
}

impl ClassicalChannel {
    /// Creates a channel; `delay` of `None` derives the delay from the
    /// distance and fiber light speed.
    pub fn new(
        name: String,
        sender: String,
        receiver: String,
        distance: f64,
        delay: Option<u64>,
    ) -> Self {
        let delay = delay.unwrap_or_else(|| fiber_delay_ps(distance));
        Self {
            name,
            sender,
            receiver,
            distance,
            delay,
        }
    }

    /// Delivery time for a message transmitted now.
    pub fn delivery_time(&self, now: u64) -> u64 {
        now + self.delay
    }
}

// ============================================================================
// Quantum Channel
// ============================================================================

/// One-directional optical fiber for photon transmission.
#[derive(Debug, Clone)]
pub struct QuantumChannel {
    /// Channel name.
    pub name: String,
    /// Sending node name.
    pub sender: String,
    /// Receiving node name.
    pub receiver: String,
    /// Attenuation in dB/m.
    pub attenuation: f64,
    /// Fiber length in meters.
    pub distance: f64,
    /// Probability that a polarization qubit survives unscrambled.
    pub polarization_fidelity: f64,
    /// Maximum qubit transmission frequency in Hz.
    pub frequency: u64,
    /// Propagation delay in ps (derived at construction).
    pub delay: u64,
    /// Photon loss probability (derived at construction).
    pub loss: f64,
    /// Occupied transmission time bins.
    send_bins: BTreeSet<u64>,
}

impl QuantumChannel {
    /// Creates a channel, deriving delay and loss from the fiber
    /// parameters.
    pub fn new(
        name: String,
        sender: String,
        receiver: String,
        attenuation: f64,
        distance: f64,
        polarization_fidelity: f64,
        frequency: u64,
    ) -> Self {
        let delay = fiber_delay_ps(distance);
        let loss = 1.0 - 10f64.powf(-attenuation * distance / 10.0);
        Self {
            name,
            sender,
            receiver,
            attenuation,
            distance,
            polarization_fidelity,
            frequency,
            delay,
            loss,
            send_bins: BTreeSet::new(),
        }
    }

    /// Transmits a photon. Returns the arrival time and the (possibly
    /// noise-marked) photon, or `None` when the photon is lost in the
    /// fiber. Null photons always arrive: an empty slot cannot be absorbed.
    pub fn transmit(&mut self, mut photon: Photon, rng: &mut SimRng, now: u64) -> Option<(u64, Photon)> {
        // Prune exhausted time bins.
        let expired: Vec<u64> = self
            .send_bins
            .iter()
            .copied()
            .take_while(|bin| self.bin_time(*bin) <= now)
            .collect();
        for bin in expired {
            self.send_bins.remove(&bin);
        }

        if !photon.is_null() && rng.random_f64() < self.loss {
            return None;
        }

        if let PhotonEncoding::Polarization { scrambled, .. } = &mut photon.encoding {
            if rng.random_f64() > self.polarization_fidelity {
                *scrambled = true;
            }
        }

        Some((now + self.delay, photon))
    }

    /// Reserves the next free transmission time bin at or after `min_time`
    /// and returns its start time.
    pub fn schedule_transmit(&mut self, min_time: u64, now: u64) -> u64 {
        let min_time = min_time.max(now);
        // Ceiling division onto the frequency grid.
        let mut bin = (u128::from(min_time) * u128::from(self.frequency)).div_ceil(u128::from(SECOND))
            as u64;
        while self.send_bins.contains(&bin) {
            bin += 1;
        }
        self.send_bins.insert(bin);
        self.bin_time(bin)
    }

    fn bin_time(&self, bin: u64) -> u64 {
        ratio_to_ps(u128::from(bin) * u128::from(SECOND), u128::from(self.frequency))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use photonq_quantum::StateKey;

    fn null_photon() -> Photon {
        Photon {
            wavelength: 500.0,
            location: "m".into(),
            encoding: PhotonEncoding::SingleAtom {
                node: "r1".into(),
                memory: "m".into(),
                qstate_key: StateKey(0),
                is_null: true,
            },
        }
    }

    fn real_photon() -> Photon {
        Photon {
            wavelength: 500.0,
            location: "m".into(),
            encoding: PhotonEncoding::SingleAtom {
                node: "r1".into(),
                memory: "m".into(),
                qstate_key: StateKey(0),
                is_null: false,
            },
        }
    }

    #[test]
    fn classical_delay_from_distance() {
        let cc = ClassicalChannel::new("cc".into(), "a".into(), "b".into(), 1_000.0, None);
        // 1 km at 2e-4 m/ps = 5e6 ps.
        assert_eq!(cc.delay, 5_000_000);
        assert_eq!(cc.delivery_time(10), 5_000_010);
    }

    #[test]
    fn classical_delay_override() {
        let cc = ClassicalChannel::new("cc".into(), "a".into(), "b".into(), 1_000.0, Some(42));
        assert_eq!(cc.delay, 42);
    }

    #[test]
    fn lossless_channel_delivers_everything() {
        let mut qc = QuantumChannel::new(
            "qc".into(),
            "a".into(),
            "b".into(),
            0.0,
            1_000.0,
            1.0,
            80_000_000,
        );
        let mut rng = SimRng::new(1);
        for _ in 0..32 {
            let (arrival, _) = qc.transmit(real_photon(), &mut rng, 0).expect("no loss");
            assert_eq!(arrival, 5_000_000);
        }
    }

    #[test]
    fn fully_attenuated_channel_drops_real_photons() {
        let mut qc = QuantumChannel::new(
            "qc".into(),
            "a".into(),
            "b".into(),
            1_000.0,
            1_000.0,
            1.0,
            80_000_000,
        );
        assert!((qc.loss - 1.0).abs() < 1e-12);
        let mut rng = SimRng::new(1);
        assert!(qc.transmit(real_photon(), &mut rng, 0).is_none());
        // Null photons still arrive.
        assert!(qc.transmit(null_photon(), &mut rng, 0).is_some());
    }

    #[test]
    fn schedule_transmit_allocates_distinct_bins() {
        let mut qc = QuantumChannel::new(
            "qc".into(),
            "a".into(),
            "b".into(),
            0.0,
            1_000.0,
            1.0,
            1_000_000, // 1 MHz → 1 µs bins
        );
        let t1 = qc.schedule_transmit(0, 0);
        let t2 = qc.schedule_transmit(0, 0);
        let t3 = qc.schedule_transmit(0, 0);
        assert_eq!(t1, 0);
        assert_eq!(t2, 1_000_000);
        assert_eq!(t3, 2_000_000);
    }

    #[test]
    fn schedule_transmit_respects_min_time() {
        let mut qc = QuantumChannel::new(
            "qc".into(),
            "a".into(),
            "b".into(),
            0.0,
            1_000.0,
            1.0,
            1_000_000,
        );
        let t = qc.schedule_transmit(1_500_000, 0);
        assert!(t >= 1_500_000);
        assert_eq!(t % 1_000_000, 0, "on the frequency grid");
    }

    #[test]
    fn polarization_noise_marks_photon() {
        let mut qc = QuantumChannel::new(
            "qc".into(),
            "a".into(),
            "b".into(),
            0.0,
            1_000.0,
            0.0, // every photon scrambled
            80_000_000,
        );
        let mut rng = SimRng::new(3);
        let photon = Photon {
            wavelength: 800.0,
            location: "ls".into(),
            encoding: PhotonEncoding::Polarization {
                basis: 0,
                bit: 1,
                scrambled: false,
            },
        };
        let (_, out) = qc.transmit(photon, &mut rng, 0).expect("no attenuation");
        match out.encoding {
            PhotonEncoding::Polarization { scrambled, .. } => assert!(scrambled),
            other => panic!("unexpected encoding {other:?}"),
        }
    }
}
