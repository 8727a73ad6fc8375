//! Single photon detector.

use photonq_kernel::{SimRng, SECOND};

/// A detection report from a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorTrigger {
    /// Detection time, rounded to the detector resolution (ps).
    pub time: u64,
}

/// Single photon detector (SPD) with efficiency, dead time, and dark
/// counts.
#[derive(Debug, Clone)]
pub struct Detector {
    /// Detection probability per arriving photon.
    pub efficiency: f64,
    /// Dark count rate in Hz (0 disables dark counts).
    pub dark_count: f64,
    /// Maximum detection rate in Hz (sets the dead time).
    pub count_rate: f64,
    /// Reporting resolution in ps.
    pub time_resolution: u64,
    /// End of the current dead time window.
    next_detection_time: u64,
    /// Number of detection attempts seen.
    pub photon_counter: u64,
}

impl Detector {
    /// Creates a detector with the given parameters.
    pub fn new(efficiency: f64, dark_count: f64, count_rate: f64, time_resolution: u64) -> Self {
        Self {
            efficiency,
            dark_count,
            count_rate,
            time_resolution: time_resolution.max(1),
            next_detection_time: 0,
            photon_counter: 0,
        }
    }

    /// Registers an arriving photon (or dark count when `dark` is true).
    ///
    /// Returns a trigger unless the detector misses (efficiency) or is
    /// inside its dead time.
    pub fn get(&mut self, rng: &mut SimRng, now: u64, dark: bool) -> Option<DetectorTrigger> {
        self.photon_counter += 1;
        let rounded = (now + self.time_resolution / 2) / self.time_resolution * self.time_resolution;

        if (dark || rng.random_f64() < self.efficiency) && now >= self.next_detection_time {
            let dead = photonq_kernel::ratio_to_ps(u128::from(SECOND), self.count_rate as u128);
            self.next_detection_time = now + dead;
            Some(DetectorTrigger { time: rounded })
        } else {
            None
        }
    }

    /// Samples the interval until the next dark count (exponential with
    /// rate `dark_count`), or `None` when dark counts are disabled.
    pub fn next_dark_interval(&self, rng: &mut SimRng) -> Option<u64> {
        if self.dark_count <= 0.0 {
            return None;
        }
        let u: f64 = rng.random_f64().max(f64::MIN_POSITIVE);
        let interval_s = -u.ln() / self.dark_count;
        Some((interval_s * SECOND as f64).round() as u64)
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(0.9, 0.0, 25e6, 150)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_detector_always_triggers() {
        let mut detector = Detector::new(1.0, 0.0, 25e6, 150);
        let mut rng = SimRng::new(0);
        assert!(detector.get(&mut rng, 1_000, false).is_some());
    }

    #[test]
    fn dead_time_suppresses_second_trigger() {
        let mut detector = Detector::new(1.0, 0.0, 25e6, 150);
        let mut rng = SimRng::new(0);
        detector.get(&mut rng, 1_000, false).expect("first");
        // 25 MHz → 40 µs dead time.
        assert!(detector.get(&mut rng, 2_000, false).is_none());
        assert!(detector.get(&mut rng, 1_000 + 40_000_000, false).is_some());
    }

    #[test]
    fn trigger_time_rounds_to_resolution() {
        let mut detector = Detector::new(1.0, 0.0, 25e6, 150);
        let mut rng = SimRng::new(0);
        let trigger = detector.get(&mut rng, 160, false).expect("trigger");
        assert_eq!(trigger.time % 150, 0);
    }

    #[test]
    fn zero_efficiency_only_detects_dark() {
        let mut detector = Detector::new(0.0, 100.0, 25e6, 150);
        let mut rng = SimRng::new(0);
        assert!(detector.get(&mut rng, 0, false).is_none());
        assert!(detector.get(&mut rng, 0, true).is_some());
    }

    #[test]
    fn dark_interval_disabled_without_rate() {
        let detector = Detector::new(1.0, 0.0, 25e6, 150);
        let mut rng = SimRng::new(0);
        assert!(detector.next_dark_interval(&mut rng).is_none());

        let noisy = Detector::new(1.0, 1_000.0, 25e6, 150);
        let interval = noisy.next_dark_interval(&mut rng).expect("rate set");
        assert!(interval > 0);
    }
}
