//! Simulation time units and exact conversion helpers.
//!
//! All simulation times are integer picoseconds. The helpers here exist so
//! that code converting from physical quantities (distances, frequencies,
//! coherence times) never touches floating point on the scheduling path:
//! two hosts computing the same channel delay must land on the same tick.

/// One picosecond (the base unit).
pub const PICOSECOND: u64 = 1;
/// One nanosecond in picoseconds.
pub const NANOSECOND: u64 = 1_000;
/// One microsecond in picoseconds.
pub const MICROSECOND: u64 = 1_000_000;
/// One millisecond in picoseconds.
pub const MILLISECOND: u64 = 1_000_000_000;
/// One second in picoseconds.
pub const SECOND: u64 = 1_000_000_000_000;

/// Divides `numer` by `denom` with round-half-up, in exact integer
/// arithmetic.
///
/// Used for channel propagation delays (`distance / light_speed`) and
/// frequency-derived periods, where a naive `f64` division can produce
/// delivery times that differ by one tick between hosts.
///
/// # Panics
///
/// Panics if `denom` is zero.
pub fn ratio_to_ps(numer: u128, denom: u128) -> u64 {
    assert!(denom != 0, "ratio_to_ps: zero denominator");
    let q = (numer + denom / 2) / denom;
    u64::try_from(q).expect("ratio_to_ps: quotient exceeds u64 time range")
}

/// Converts a duration in seconds (given as an exact rational
/// `numer / denom` seconds) to picoseconds.
pub fn sec_to_ps(numer: u128, denom: u128) -> u64 {
    ratio_to_ps(numer * u128::from(SECOND), denom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_rounds_half_up() {
        assert_eq!(ratio_to_ps(5, 2), 3); // 2.5 → 3
        assert_eq!(ratio_to_ps(4, 2), 2);
        assert_eq!(ratio_to_ps(7, 3), 2); // 2.33 → 2
        assert_eq!(ratio_to_ps(8, 3), 3); // 2.67 → 3
    }

    #[test]
    fn fiber_delay_is_exact() {
        // 1000 m at 2e-4 m/ps: 1000 / 2e-4 = 5_000_000 ps, computed as
        // 1000 * 10^4 / 2 with no floats.
        let delay = ratio_to_ps(1000 * 10_000, 2);
        assert_eq!(delay, 5_000_000);
    }

    #[test]
    fn sec_conversion() {
        assert_eq!(sec_to_ps(1, 1), SECOND);
        assert_eq!(sec_to_ps(1, 2), SECOND / 2);
        assert_eq!(sec_to_ps(3, 1_000), 3 * MILLISECOND);
    }

    #[test]
    #[should_panic(expected = "zero denominator")]
    fn zero_denominator_panics() {
        ratio_to_ps(1, 0);
    }
}
