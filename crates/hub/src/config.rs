//! TOML config file loading, validation, and schedule seeding.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::UtcOffset;

use crate::model::{parse_schedule_time, Day, DayUpdate, Period, ScheduleEntry, SiteId};
use crate::retry::RetryPolicy;
use crate::store::ScheduleStore;

const DEFAULT_SITE_ID: &str = "Site-01";

/// Allowed clock tick range, in seconds.
const TICK_SEC_RANGE: std::ops::RangeInclusive<u64> = 1..=300;

const OFFSET_FMT: &[BorrowedFormatItem<'static>] =
    format_description!("[offset_hour sign:mandatory]:[offset_minute]");

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub schedule: Vec<ScheduleSeed>,
}

#[derive(Debug, Deserialize)]
pub struct SiteSection {
    #[serde(default = "default_site_id")]
    pub id: String,
    /// e.g. "+10:00". Falls back to the host offset, then UTC.
    pub utc_offset: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_tick_sec")]
    pub tick_sec: u64,
}

#[derive(Debug, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// One `[[schedule]]` entry seeded into the store at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSeed {
    pub day: String,
    pub period: String,
    pub start_time: String,
    pub litres: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub zones: Vec<String>,
}

fn default_site_id() -> String {
    DEFAULT_SITE_ID.to_string()
}
fn default_tick_sec() -> u64 {
    crate::coordinator::TICK_INTERVAL_SEC
}
fn default_attempts() -> u32 {
    RetryPolicy::default().attempts
}
fn default_base_delay_ms() -> u64 {
    RetryPolicy::default().base_delay.as_millis() as u64
}
fn default_max_delay_ms() -> u64 {
    RetryPolicy::default().max_delay.as_millis() as u64
}
fn default_enabled() -> bool {
    true
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            id: default_site_id(),
            utc_offset: None,
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            tick_sec: default_tick_sec(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived settings
// ---------------------------------------------------------------------------

impl Config {
    pub fn site_id(&self) -> SiteId {
        SiteId::new(self.site.id.trim())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.engine.tick_sec)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Offset used for "today", schedule times and history strings.
    pub fn site_offset(&self) -> Result<UtcOffset> {
        match &self.site.utc_offset {
            Some(raw) => parse_offset(raw),
            None => Ok(UtcOffset::current_local_offset().unwrap_or_else(|_| {
                tracing::warn!("host UTC offset unavailable, using UTC");
                UtcOffset::UTC
            })),
        }
    }
}

fn parse_offset(raw: &str) -> Result<UtcOffset> {
    UtcOffset::parse(raw.trim(), OFFSET_FMT)
        .with_context(|| format!("utc_offset '{raw}' is not of the form +HH:MM"))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_site(&mut errors);
        self.validate_engine(&mut errors);
        self.validate_schedule(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_site(&self, errors: &mut Vec<String>) {
        if self.site.id.trim().is_empty() {
            errors.push("site: id is empty".to_string());
        }
        if let Some(raw) = &self.site.utc_offset {
            if parse_offset(raw).is_err() {
                errors.push(format!("site: utc_offset '{raw}' is not of the form +HH:MM"));
            }
        }
    }

    fn validate_engine(&self, errors: &mut Vec<String>) {
        if !TICK_SEC_RANGE.contains(&self.engine.tick_sec) {
            errors.push(format!(
                "engine: tick_sec {} out of range [{}, {}]",
                self.engine.tick_sec,
                TICK_SEC_RANGE.start(),
                TICK_SEC_RANGE.end()
            ));
        }

        if self.retry.attempts == 0 {
            errors.push("retry: attempts must be at least 1".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push(format!(
                "retry: max_delay_ms ({}) is less than base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            ));
        }
    }

    fn validate_schedule(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<(Day, Period)> = HashSet::new();

        for (i, s) in self.schedule.iter().enumerate() {
            let ctx = format!("schedule[{i}]");

            let day = s.day.parse::<Day>();
            let period = s.period.parse::<Period>();
            if let Err(e) = &day {
                errors.push(format!("{ctx}: {e}"));
            }
            if let Err(e) = &period {
                errors.push(format!("{ctx}: {e}"));
            }
            if let (Ok(d), Ok(p)) = (day, period) {
                if !seen.insert((d, p)) {
                    errors.push(format!("{ctx}: duplicate entry for {d} {p}"));
                }
            }

            if parse_schedule_time(&s.start_time).is_none() {
                errors.push(format!(
                    "{ctx}: start_time '{}' is not of the form \"7:00 AM\"",
                    s.start_time
                ));
            }
            if s.enabled && s.litres == 0 {
                errors.push(format!("{ctx}: litres must be positive for an enabled entry"));
            }
        }
    }

    /// Seed entries grouped per day, ready for `upsert_day`. Call after
    /// [`Config::validate`]; unparseable seeds are skipped.
    pub fn schedule_updates(&self) -> BTreeMap<Day, DayUpdate> {
        let mut by_day: BTreeMap<Day, DayUpdate> = BTreeMap::new();
        for s in &self.schedule {
            let (Ok(day), Ok(period)) = (s.day.parse::<Day>(), s.period.parse::<Period>()) else {
                continue;
            };
            by_day.entry(day).or_default().set(
                period,
                ScheduleEntry {
                    start_time: s.start_time.trim().to_string(),
                    litres: s.litres,
                    enabled: s.enabled,
                    zones: s.zones.clone(),
                },
            );
        }
        by_day
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::info!(path, "no config file, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Merge the seeded schedule into the store, one `upsert_day` per day.
/// Periods that are not seeded keep whatever the store already holds.
pub async fn apply<S: ScheduleStore + ?Sized>(config: &Config, store: &S, site: &SiteId) -> Result<()> {
    let updates = config.schedule_updates();
    for (day, update) in &updates {
        store
            .upsert_day(site, *day, update)
            .await
            .with_context(|| format!("failed to seed schedule for {day}"))?;
    }

    tracing::info!(
        site = %site,
        days = updates.len(),
        entries = config.schedule.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn seed(day: &str, period: &str, start: &str, litres: u32) -> ScheduleSeed {
        ScheduleSeed {
            day: day.into(),
            period: period.into(),
            start_time: start.into(),
            litres,
            enabled: true,
            zones: vec!["0".into()],
        }
    }

    fn valid_config() -> Config {
        Config {
            schedule: vec![
                seed("MONDAY", "morning", "7:00 AM", 20),
                seed("monday", "afternoon", "4:30 PM", 40),
                seed("FRIDAY", "midday", "12:00 PM", 10),
            ],
            ..Config::default()
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[site]
id = "Site-07"
utc_offset = "+10:00"

[engine]
tick_sec = 15

[retry]
attempts = 5
base_delay_ms = 100
max_delay_ms = 2000

[[schedule]]
day = "MONDAY"
period = "morning"
start_time = "7:00 AM"
litres = 20
zones = ["0"]
"#;
        let config = parse(toml_str).unwrap();
        assert_eq!(config.site_id(), SiteId::new("Site-07"));
        assert_eq!(config.site_offset().unwrap(), UtcOffset::from_hms(10, 0, 0).unwrap());
        assert_eq!(config.tick_interval(), Duration::from_secs(15));
        assert_eq!(
            config.retry_policy(),
            RetryPolicy {
                attempts: 5,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
            }
        );
        assert_eq!(config.schedule.len(), 1);
        assert!(config.schedule[0].enabled);
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.site.id, "Site-01");
        assert_eq!(config.engine.tick_sec, 30);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config.schedule.is_empty());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = load("/nonexistent/irrigation/config.toml").unwrap();
        assert_eq!(config.site.id, "Site-01");
    }

    #[test]
    fn negative_offset_parses() {
        let config = parse("[site]\nutc_offset = \"-03:30\"").unwrap();
        assert_eq!(config.site_offset().unwrap(), UtcOffset::from_hms(-3, -30, 0).unwrap());
    }

    // -- Validation --------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn tick_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.engine.tick_sec = 0;
        assert_validation_err(&cfg, "tick_sec 0 out of range");
        cfg.engine.tick_sec = 301;
        assert_validation_err(&cfg, "tick_sec 301 out of range");
    }

    #[test]
    fn bad_offset_rejected() {
        let mut cfg = valid_config();
        cfg.site.utc_offset = Some("10".into());
        assert_validation_err(&cfg, "utc_offset '10'");
    }

    #[test]
    fn empty_site_id_rejected() {
        let mut cfg = valid_config();
        cfg.site.id = " ".into();
        assert_validation_err(&cfg, "id is empty");
    }

    #[test]
    fn retry_bounds_rejected() {
        let mut cfg = valid_config();
        cfg.retry.attempts = 0;
        cfg.retry.base_delay_ms = 500;
        cfg.retry.max_delay_ms = 100;
        assert_validation_err(&cfg, "attempts must be at least 1");
        assert_validation_err(&cfg, "max_delay_ms (100) is less than base_delay_ms (500)");
    }

    #[test]
    fn unknown_day_and_period_rejected() {
        let mut cfg = valid_config();
        cfg.schedule.push(seed("FUNDAY", "evening", "7:00 AM", 20));
        assert_validation_err(&cfg, "unknown day 'FUNDAY'");
        assert_validation_err(&cfg, "unknown period 'evening'");
    }

    #[test]
    fn duplicate_slot_rejected() {
        let mut cfg = valid_config();
        cfg.schedule.push(seed("Monday", "MORNING", "8:00 AM", 5));
        assert_validation_err(&cfg, "duplicate entry for MONDAY morning");
    }

    #[test]
    fn twenty_four_hour_time_rejected() {
        let mut cfg = valid_config();
        cfg.schedule[0].start_time = "13:00".into();
        assert_validation_err(&cfg, "start_time '13:00'");
    }

    #[test]
    fn zero_litres_only_rejected_when_enabled() {
        let mut cfg = valid_config();
        cfg.schedule[0].litres = 0;
        assert_validation_err(&cfg, "litres must be positive");
        cfg.schedule[0].enabled = false;
        cfg.validate().unwrap();
    }

    #[test]
    fn all_errors_are_reported_together() {
        let mut cfg = valid_config();
        cfg.engine.tick_sec = 0;
        cfg.schedule[0].day = "nope".into();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("(2 errors)"), "{msg}");
    }

    // -- Seeding -----------------------------------------------------------

    #[test]
    fn seeds_are_grouped_by_day() {
        let updates = valid_config().schedule_updates();
        assert_eq!(updates.len(), 2);
        let monday = &updates[&Day::Monday];
        assert_eq!(monday.morning.as_ref().map(|e| e.litres), Some(20));
        assert_eq!(monday.afternoon.as_ref().map(|e| e.start_time.as_str()), Some("4:30 PM"));
        assert!(monday.midday.is_none());
    }

    #[tokio::test]
    async fn apply_merges_without_clearing() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let site = SiteId::new("Site-01");

        let existing = ScheduleEntry {
            start_time: "12:15 PM".into(),
            litres: 15,
            enabled: true,
            zones: vec![],
        };
        db.upsert_period(&site, Day::Monday, Period::Midday, &existing)
            .await
            .unwrap();

        apply(&valid_config(), &db, &site).await.unwrap();

        let monday = db.get_day(&site, Day::Monday).await.unwrap().unwrap();
        assert_eq!(monday.midday, Some(existing));
        assert_eq!(monday.morning.map(|e| e.litres), Some(20));
        assert!(db.get_day(&site, Day::Friday).await.unwrap().is_some());
        assert!(db.get_day(&site, Day::Sunday).await.unwrap().is_none());
    }
}
