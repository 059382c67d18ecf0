//! Persisted documents: weekly schedule, manual session and daily history.
//!
//! Field names serialise in camelCase because they are the contract shared
//! with every other client of the store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, Time, Weekday};

use crate::flow;

/// Wall-clock format of schedule start times, e.g. "7:00 AM".
const SCHEDULE_TIME_FMT: &[BorrowedFormatItem<'static>] =
    format_description!("[hour repr:12 padding:none]:[minute] [period]");

/// Wall-clock format used in history entries, e.g. "07:30:00".
const LOG_TIME_FMT: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

const LOG_DATE_FMT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

// ---------------------------------------------------------------------------
// Site
// ---------------------------------------------------------------------------

/// Identifies one irrigation site. Every store call is scoped to a site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Weekday / period keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Day {
    pub const ALL: [Day; 7] = [
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
        Day::Saturday,
        Day::Sunday,
    ];

    /// Document key, e.g. "MONDAY".
    pub fn as_str(self) -> &'static str {
        match self {
            Day::Monday => "MONDAY",
            Day::Tuesday => "TUESDAY",
            Day::Wednesday => "WEDNESDAY",
            Day::Thursday => "THURSDAY",
            Day::Friday => "FRIDAY",
            Day::Saturday => "SATURDAY",
            Day::Sunday => "SUNDAY",
        }
    }

    /// Monday = 0 … Sunday = 6.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn of(dt: OffsetDateTime) -> Self {
        dt.weekday().into()
    }
}

impl From<Weekday> for Day {
    fn from(w: Weekday) -> Self {
        match w {
            Weekday::Monday => Day::Monday,
            Weekday::Tuesday => Day::Tuesday,
            Weekday::Wednesday => Day::Wednesday,
            Weekday::Thursday => Day::Thursday,
            Weekday::Friday => Day::Friday,
            Weekday::Saturday => Day::Saturday,
            Weekday::Sunday => Day::Sunday,
        }
    }
}

impl FromStr for Day {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Day::ALL
            .into_iter()
            .find(|d| d.as_str() == upper)
            .ok_or_else(|| format!("unknown day '{s}'"))
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the three watering slots of a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Morning,
    Midday,
    Afternoon,
}

impl Period {
    /// Evaluation order used when looking for an active window.
    pub const ALL: [Period; 3] = [Period::Morning, Period::Midday, Period::Afternoon];

    pub fn field_name(self) -> &'static str {
        match self {
            Period::Morning => "morning",
            Period::Midday => "midday",
            Period::Afternoon => "afternoon",
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Period::ALL
            .into_iter()
            .find(|p| p.field_name() == lower)
            .ok_or_else(|| format!("unknown period '{s}'"))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// One watering period within a day. Missing fields in older documents fall
/// back to defaults instead of failing the whole read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleEntry {
    pub start_time: String,
    pub litres: u32,
    pub enabled: bool,
    #[serde(alias = "zone")]
    pub zones: Vec<String>,
}

impl ScheduleEntry {
    /// Disabled or blank-time entries never activate.
    pub fn is_candidate(&self) -> bool {
        self.enabled && !self.start_time.trim().is_empty()
    }

    /// Parsed start time, or `None` for anything that is not "h:mm AM/PM".
    pub fn start_time_of_day(&self) -> Option<Time> {
        parse_schedule_time(&self.start_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDay {
    pub day: Day,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub morning: Option<ScheduleEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub midday: Option<ScheduleEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub afternoon: Option<ScheduleEntry>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ScheduleDay {
    pub fn period(&self, period: Period) -> Option<&ScheduleEntry> {
        match period {
            Period::Morning => self.morning.as_ref(),
            Period::Midday => self.midday.as_ref(),
            Period::Afternoon => self.afternoon.as_ref(),
        }
    }
}

/// Batched day write. `None` means "leave the stored period alone", never
/// "clear it"; use `delete_period` to clear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DayUpdate {
    pub morning: Option<ScheduleEntry>,
    pub midday: Option<ScheduleEntry>,
    pub afternoon: Option<ScheduleEntry>,
}

impl DayUpdate {
    pub fn get(&self, period: Period) -> Option<&ScheduleEntry> {
        match period {
            Period::Morning => self.morning.as_ref(),
            Period::Midday => self.midday.as_ref(),
            Period::Afternoon => self.afternoon.as_ref(),
        }
    }

    pub fn set(&mut self, period: Period, entry: ScheduleEntry) {
        match period {
            Period::Morning => self.morning = Some(entry),
            Period::Midday => self.midday = Some(entry),
            Period::Afternoon => self.afternoon = Some(entry),
        }
    }

    pub fn is_empty(&self) -> bool {
        Period::ALL.into_iter().all(|p| self.get(p).is_none())
    }
}

// ---------------------------------------------------------------------------
// Manual session
// ---------------------------------------------------------------------------

/// The single live (or most recently finished) manual run of a site.
///
/// While `running`, the stop fields are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualSession {
    pub running: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub total_litres: u32,
    pub used_litres: Option<u32>,
    pub remaining_litres: Option<u32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub stopped_at: Option<OffsetDateTime>,
}

impl ManualSession {
    /// Remaining volume at `now`, derived from the persisted start; `None`
    /// when the session is not running.
    pub fn remaining_at(&self, now: OffsetDateTime) -> Option<u32> {
        self.running
            .then(|| flow::remaining_litres(self.total_litres, self.started_at, now))
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrigationLogEntry {
    pub start_time: String,
    pub end_time: String,
    #[serde(default, alias = "zone")]
    pub zones: Vec<String>,
    pub litres: u32,
    pub scheduled: bool,
}

/// All history entries of one date, keyed by start-time string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyLog {
    pub date: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub logs: BTreeMap<String, IrrigationLogEntry>,
}

// ---------------------------------------------------------------------------
// Wall-clock helpers
// ---------------------------------------------------------------------------

/// Parse "7:00 AM" style times (case-insensitive). Malformed input is `None`.
pub fn parse_schedule_time(s: &str) -> Option<Time> {
    let normalized = s.trim().to_ascii_uppercase();
    Time::parse(&normalized, SCHEDULE_TIME_FMT).ok()
}

/// "7:05 AM" style rendering for notifications.
pub fn format_schedule_time(dt: OffsetDateTime) -> String {
    dt.format(SCHEDULE_TIME_FMT)
        .unwrap_or_else(|_| dt.time().to_string())
}

/// "HH:MM:SS" key used for history entries.
pub fn log_time(dt: OffsetDateTime) -> String {
    dt.format(LOG_TIME_FMT).unwrap_or_else(|_| dt.time().to_string())
}

/// "YYYY-MM-DD" key used for daily logs.
pub fn log_date(dt: OffsetDateTime) -> String {
    dt.format(LOG_DATE_FMT).unwrap_or_else(|_| dt.date().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, time};

    #[test]
    fn parses_twelve_hour_times() {
        assert_eq!(parse_schedule_time("7:00 AM"), Some(time!(07:00)));
        assert_eq!(parse_schedule_time("07:30 am"), Some(time!(07:30)));
        assert_eq!(parse_schedule_time(" 12:15 PM "), Some(time!(12:15)));
        assert_eq!(parse_schedule_time("12:00 AM"), Some(time!(00:00)));
        assert_eq!(parse_schedule_time("5:45 PM"), Some(time!(17:45)));
    }

    #[test]
    fn rejects_malformed_times() {
        assert_eq!(parse_schedule_time(""), None);
        assert_eq!(parse_schedule_time("12:30"), None);
        assert_eq!(parse_schedule_time("25:00 PM"), None);
        assert_eq!(parse_schedule_time("seven"), None);
    }

    #[test]
    fn formats_wall_clock_strings() {
        let dt = datetime!(2025-09-28 07:05:09 +10:00);
        assert_eq!(format_schedule_time(dt), "7:05 AM");
        assert_eq!(log_time(dt), "07:05:09");
        assert_eq!(log_date(dt), "2025-09-28");
    }

    #[test]
    fn day_keys_and_ordinals() {
        assert_eq!("monday".parse::<Day>(), Ok(Day::Monday));
        assert_eq!("SUNDAY".parse::<Day>(), Ok(Day::Sunday));
        assert!("Funday".parse::<Day>().is_err());
        assert_eq!(Day::Monday.ordinal(), 0);
        assert_eq!(Day::Sunday.ordinal(), 6);
        assert_eq!(Day::of(datetime!(2025-09-29 12:00 UTC)), Day::Monday);
        assert_eq!(serde_json::to_string(&Day::Friday).unwrap(), "\"FRIDAY\"");
    }

    #[test]
    fn legacy_entry_fields_default() {
        let e: ScheduleEntry =
            serde_json::from_str(r#"{"startTime":"7:00 AM","zone":["0","1"]}"#).unwrap();
        assert_eq!(e.litres, 0);
        assert!(!e.enabled);
        assert_eq!(e.zones, vec!["0", "1"]);
        assert!(!e.is_candidate());
    }

    #[test]
    fn blank_start_time_is_not_a_candidate() {
        let e = ScheduleEntry {
            start_time: "   ".into(),
            litres: 20,
            enabled: true,
            zones: vec![],
        };
        assert!(!e.is_candidate());
    }

    #[test]
    fn remaining_only_while_running() {
        let start = datetime!(2025-09-29 07:00 UTC);
        let mut s = ManualSession {
            running: true,
            started_at: start,
            total_litres: 54,
            used_litres: None,
            remaining_litres: None,
            stopped_at: None,
        };
        assert_eq!(s.remaining_at(start + time::Duration::minutes(1)), Some(27));
        s.running = false;
        assert_eq!(s.remaining_at(start), None);
    }
}
