//! Volume/time conversions for a run at a fixed flow rate.
//!
//! Everything here is a pure function of its arguments so the remaining
//! volume of a session can always be recomputed from persisted state plus the
//! current time.

use time::OffsetDateTime;

/// Litres delivered per minute while a valve is open.
pub const FLOW_LPM: f64 = 27.0;

/// Shortest run the schedule will ever plan for, in minutes.
pub const MIN_RUNTIME_MIN: u32 = 5;

/// Minutes needed to deliver `litres`, never less than [`MIN_RUNTIME_MIN`].
pub fn runtime_minutes(litres: u32) -> u32 {
    let minutes = (f64::from(litres) / FLOW_LPM).ceil() as u32;
    minutes.max(MIN_RUNTIME_MIN)
}

/// Whole litres delivered between `started_at` and `now`.
///
/// Negative elapsed time (clock skew between devices) counts as zero.
pub fn used_litres(started_at: OffsetDateTime, now: OffsetDateTime) -> u32 {
    let elapsed_min = ((now - started_at).as_seconds_f64() / 60.0).max(0.0);
    (elapsed_min * FLOW_LPM).floor() as u32
}

/// Litres still to deliver for a session of `total` litres.
pub fn remaining_litres(total: u32, started_at: OffsetDateTime, now: OffsetDateTime) -> u32 {
    total.saturating_sub(used_litres(started_at, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2025-09-29 07:00:00 UTC);

    #[test]
    fn runtime_has_five_minute_floor() {
        assert_eq!(runtime_minutes(0), 5);
        assert_eq!(runtime_minutes(20), 5);
        assert_eq!(runtime_minutes(135), 5);
        assert_eq!(runtime_minutes(136), 6);
        assert_eq!(runtime_minutes(270), 10);
    }

    #[test]
    fn runtime_is_non_decreasing() {
        let mut prev = runtime_minutes(0);
        for litres in 1..2_000 {
            let m = runtime_minutes(litres);
            assert!(m >= prev, "runtime dropped at {litres}L: {m} < {prev}");
            assert!(m >= MIN_RUNTIME_MIN);
            prev = m;
        }
    }

    #[test]
    fn used_litres_floors_partial_minutes() {
        assert_eq!(used_litres(T0, T0), 0);
        // 27 L/min => 0.45 L/s; 10 s => 4.5 L
        assert_eq!(used_litres(T0, T0 + Duration::seconds(10)), 4);
        assert_eq!(used_litres(T0, T0 + Duration::minutes(1)), 27);
        assert_eq!(used_litres(T0, T0 + Duration::minutes(3)), 81);
    }

    #[test]
    fn clock_skew_counts_as_zero() {
        assert_eq!(used_litres(T0, T0 - Duration::minutes(5)), 0);
        assert_eq!(remaining_litres(40, T0, T0 - Duration::minutes(5)), 40);
    }

    #[test]
    fn remaining_starts_at_total_and_never_increases() {
        assert_eq!(remaining_litres(20, T0, T0), 20);

        let mut prev = remaining_litres(100, T0, T0);
        for secs in (0..600).step_by(7) {
            let r = remaining_litres(100, T0, T0 + Duration::seconds(secs));
            assert!(r <= prev, "remaining rose at +{secs}s: {r} > {prev}");
            prev = r;
        }
        assert_eq!(prev, 0);
    }

    #[test]
    fn remaining_hits_zero_after_three_minutes_for_twenty_litres() {
        assert_eq!(remaining_litres(20, T0, T0 + Duration::minutes(3)), 0);
        assert!(remaining_litres(20, T0, T0 + Duration::seconds(30)) > 0);
    }
}
