//! Decides whether a scheduled watering window is open right now.
//!
//! Scheduled state is never persisted; it is recomputed from the day's
//! schedule and the current time on every tick.

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::flow;
use crate::model::{Period, ScheduleDay, ScheduleEntry};

/// An open scheduled window: `[start, start + runtime_minutes(litres))`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveWindow {
    pub period: Period,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub litres: u32,
}

/// First period (morning, midday, afternoon) whose window contains `now`.
///
/// Overlapping periods are not rejected here; the earlier one simply wins.
pub fn find_active_window(day: &ScheduleDay, now: OffsetDateTime) -> Option<ActiveWindow> {
    Period::ALL
        .into_iter()
        .find_map(|p| day.period(p).and_then(|e| window_at(p, e, now)))
}

/// `day` may be absent (no document for today); nothing is active then.
pub fn find_active_window_opt(day: Option<&ScheduleDay>, now: OffsetDateTime) -> Option<ActiveWindow> {
    day.and_then(|d| find_active_window(d, now))
}

fn window_at(period: Period, entry: &ScheduleEntry, now: OffsetDateTime) -> Option<ActiveWindow> {
    if !entry.is_candidate() {
        return None;
    }
    // Unparseable start times are treated as inactive.
    let start_time = entry.start_time_of_day()?;
    let start = now.replace_time(start_time);
    let end = start + Duration::minutes(i64::from(flow::runtime_minutes(entry.litres)));

    (start <= now && now < end).then(|| ActiveWindow {
        period,
        start,
        end,
        litres: entry.litres,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Day;
    use time::macros::datetime;

    fn entry(start: &str, litres: u32, enabled: bool) -> ScheduleEntry {
        ScheduleEntry {
            start_time: start.into(),
            litres,
            enabled,
            zones: vec![],
        }
    }

    fn day_with(
        morning: Option<ScheduleEntry>,
        midday: Option<ScheduleEntry>,
        afternoon: Option<ScheduleEntry>,
    ) -> ScheduleDay {
        ScheduleDay {
            day: Day::Monday,
            morning,
            midday,
            afternoon,
            updated_at: datetime!(2025-09-28 00:00 UTC),
        }
    }

    #[test]
    fn morning_window_is_closed_open() {
        let day = day_with(Some(entry("7:00 AM", 20, true)), None, None);

        let w = find_active_window(&day, datetime!(2025-09-29 07:00 +10:00)).unwrap();
        assert_eq!(w.period, Period::Morning);
        assert_eq!(w.start, datetime!(2025-09-29 07:00 +10:00));
        assert_eq!(w.end, datetime!(2025-09-29 07:05 +10:00));
        assert_eq!(w.litres, 20);

        assert!(find_active_window(&day, datetime!(2025-09-29 07:04:59 +10:00)).is_some());
        assert!(find_active_window(&day, datetime!(2025-09-29 07:05 +10:00)).is_none());
        assert!(find_active_window(&day, datetime!(2025-09-29 06:59:59 +10:00)).is_none());
    }

    #[test]
    fn twenty_litres_is_not_active_ten_minutes_later() {
        let day = day_with(Some(entry("7:00 AM", 20, true)), None, None);
        assert!(find_active_window(&day, datetime!(2025-09-29 07:10 +10:00)).is_none());
    }

    #[test]
    fn large_volumes_extend_the_window() {
        // 270 L at 27 L/min = 10 minutes.
        let day = day_with(None, None, Some(entry("4:30 PM", 270, true)));
        let w = find_active_window(&day, datetime!(2025-09-29 16:39 UTC)).unwrap();
        assert_eq!(w.period, Period::Afternoon);
        assert!(find_active_window(&day, datetime!(2025-09-29 16:40 UTC)).is_none());
    }

    #[test]
    fn disabled_period_never_activates() {
        let day = day_with(Some(entry("7:00 AM", 500, false)), None, None);
        for minute in 0..60 {
            let now = datetime!(2025-09-29 07:00 UTC) + Duration::minutes(minute);
            assert!(find_active_window(&day, now).is_none(), "active at +{minute}m");
        }
    }

    #[test]
    fn blank_and_malformed_times_are_inactive() {
        let now = datetime!(2025-09-29 07:01 UTC);
        for start in ["", "  ", "7:00", "07:00:00", "soon"] {
            let day = day_with(Some(entry(start, 20, true)), None, None);
            assert!(find_active_window(&day, now).is_none(), "{start:?} activated");
        }
    }

    #[test]
    fn earlier_period_wins_on_overlap() {
        let day = day_with(
            Some(entry("11:58 AM", 20, true)),
            Some(entry("12:00 PM", 20, true)),
            None,
        );
        let w = find_active_window(&day, datetime!(2025-09-29 12:01 UTC)).unwrap();
        assert_eq!(w.period, Period::Morning);

        let w = find_active_window(&day, datetime!(2025-09-29 12:04 UTC)).unwrap();
        assert_eq!(w.period, Period::Midday);
    }

    #[test]
    fn skips_disabled_period_to_find_later_one() {
        let day = day_with(
            Some(entry("12:00 PM", 20, false)),
            Some(entry("12:00 PM", 40, true)),
            None,
        );
        let w = find_active_window(&day, datetime!(2025-09-29 12:02 UTC)).unwrap();
        assert_eq!(w.period, Period::Midday);
        assert_eq!(w.litres, 40);
    }

    #[test]
    fn missing_day_is_inactive() {
        assert!(find_active_window_opt(None, datetime!(2025-09-29 07:00 UTC)).is_none());
    }
}
