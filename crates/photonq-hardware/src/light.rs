//! Pulsed light source for polarization-encoded QKD.

use photonq_kernel::{ratio_to_ps, SimRng, SECOND};

use crate::photon::{Photon, PhotonEncoding};

/// Weak-coherent pulsed light source.
///
/// Each pulse carries at most one signal photon; the mean photon number
/// sets the emission probability per pulse. BB84 drives the source with a
/// per-pulse (basis, bit) list.
#[derive(Debug, Clone)]
pub struct LightSource {
    /// Source name.
    pub name: String,
    /// Pulse frequency in Hz.
    pub frequency: u64,
    /// Photon wavelength in nm.
    pub wavelength: f64,
    /// Mean photon number per pulse (≤ 1 in this model).
    pub mean_photon_num: f64,
}

impl LightSource {
    /// Creates a light source.
    pub fn new(name: String, frequency: u64, wavelength: f64, mean_photon_num: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&mean_photon_num),
            "mean photon number in [0,1]"
        );
        Self {
            name,
            frequency,
            wavelength,
            mean_photon_num,
        }
    }

    /// Pulse period in ps.
    pub fn period_ps(&self) -> u64 {
        ratio_to_ps(u128::from(SECOND), u128::from(self.frequency))
    }

    /// Emits a pulse train for the given per-pulse (basis, bit) states.
    ///
    /// Returns `(offset from now, photon)` pairs; pulses whose emission was
    /// suppressed by the mean photon number produce nothing.
    pub fn emit(&self, states: &[(u8, u8)], rng: &mut SimRng) -> Vec<(u64, Photon)> {
        let period = self.period_ps();
        let mut out = Vec::new();
        for (i, (basis, bit)) in states.iter().enumerate() {
            if rng.random_f64() >= self.mean_photon_num {
                continue;
            }
            out.push((
                i as u64 * period,
                Photon {
                    wavelength: self.wavelength,
                    location: self.name.clone(),
                    encoding: PhotonEncoding::Polarization {
                        basis: *basis,
                        bit: *bit,
                        scrambled: false,
                    },
                },
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_mean_emits_every_pulse() {
        let ls = LightSource::new("a.ls".into(), 1_000_000, 800.0, 1.0);
        let mut rng = SimRng::new(0);
        let states = vec![(0, 1), (1, 0), (0, 0)];
        let photons = ls.emit(&states, &mut rng);

        assert_eq!(photons.len(), 3);
        assert_eq!(photons[0].0, 0);
        assert_eq!(photons[1].0, 1_000_000);
        assert_eq!(photons[2].0, 2_000_000);
        match &photons[0].1.encoding {
            PhotonEncoding::Polarization { basis, bit, .. } => {
                assert_eq!((*basis, *bit), (0, 1));
            }
            other => panic!("unexpected encoding {other:?}"),
        }
    }

    #[test]
    fn zero_mean_emits_nothing() {
        let ls = LightSource::new("a.ls".into(), 1_000_000, 800.0, 0.0);
        let mut rng = SimRng::new(0);
        assert!(ls.emit(&[(0, 0); 8], &mut rng).is_empty());
    }
}
