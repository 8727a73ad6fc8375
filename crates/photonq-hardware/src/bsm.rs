//! Single-atom Bell-state measurement device.
//!
//! The BSM sits on a middle node between two routers. Photons from the two
//! ends are emitted on a shared grid so they arrive in the same instant;
//! the device pairs same-instant arrivals and heralds when exactly one of
//! the two carries a real excitation. The detector index it reports encodes
//! the Bell-state sign: matching indices across the two generation rounds
//! herald Ψ⁺, differing indices Ψ⁻.

use photonq_kernel::SimRng;

use crate::detector::{Detector, DetectorTrigger};
use crate::photon::Photon;

/// Detector index + detection report from a BSM herald.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BsmResolution {
    /// Index of the detector that fired (0 or 1).
    pub detector: u8,
    /// Detection time (ps, resolution-rounded).
    pub time: u64,
    /// Detector time resolution (ps).
    pub resolution: u64,
}

/// Meet-in-the-middle BSM for single-atom memories.
#[derive(Debug)]
pub struct SingleAtomBsm {
    /// Device name.
    pub name: String,
    detectors: [Detector; 2],
    photons: Vec<Photon>,
    arrival_time: Option<u64>,
}

impl SingleAtomBsm {
    /// Creates a BSM with the given pair of detectors.
    pub fn new(name: String, detectors: [Detector; 2]) -> Self {
        Self {
            name,
            detectors,
            photons: Vec::new(),
            arrival_time: None,
        }
    }

    /// Maximum time resolution of the attached detectors.
    pub fn resolution(&self) -> u64 {
        self.detectors[0]
            .time_resolution
            .max(self.detectors[1].time_resolution)
    }

    /// The attached detector pair.
    pub fn detectors(&self) -> &[Detector; 2] {
        &self.detectors
    }

    /// Mutable access for parameter updates and dark-count injection.
    pub fn detectors_mut(&mut self) -> &mut [Detector; 2] {
        &mut self.detectors
    }

    /// Receives a photon. Returns detection reports to broadcast to the
    /// end nodes.
    ///
    /// A stale buffer from an earlier instant is discarded on the first
    /// arrival of a new instant. Each real (non-null) photon is sent to a
    /// uniformly chosen detector; a pair with two real photons therefore
    /// produces two triggers, which the end protocols discard as an invalid
    /// round, while a pair with two nulls produces none.
    pub fn get(&mut self, photon: Photon, rng: &mut SimRng, now: u64) -> Vec<BsmResolution> {
        if self.arrival_time != Some(now) {
            self.photons.clear();
            self.arrival_time = Some(now);
        }

        // One photon per emitting component per instant.
        if self
            .photons
            .iter()
            .any(|buffered| buffered.location == photon.location)
        {
            return Vec::new();
        }

        let mut resolutions = Vec::new();
        let is_null = photon.is_null();
        self.photons.push(photon);

        if !is_null {
            let index = rng.coin() as usize;
            if let Some(DetectorTrigger { time }) = self.detectors[index].get(rng, now, false) {
                resolutions.push(BsmResolution {
                    detector: index as u8,
                    time,
                    resolution: self.resolution(),
                });
            }
        }

        resolutions
    }
}
