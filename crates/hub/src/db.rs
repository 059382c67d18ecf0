//! SQLite implementation of the schedule and session adapters.
//!
//! Each document of the store maps to a row; each document field to a column.
//! Merge-writes are `INSERT … ON CONFLICT DO UPDATE` statements that only
//! name the columns being written. Every successful write publishes a
//! [`Change`] so live subscriptions can re-read their snapshot.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::flow;
use crate::model::{
    log_date, log_time, DailyLog, Day, DayUpdate, IrrigationLogEntry, ManualSession, Period,
    ScheduleDay, ScheduleEntry, SiteId,
};
use crate::retry::RetryPolicy;
use crate::store::{forward, ScheduleStore, SessionStore, StopOutcome, Subscription};

/// Capacity of the change feed; slower subscribers just re-read.
const CHANGE_FEED_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<Change>,
    retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Schedule,
    Session,
    Logs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub site: SiteId,
    pub kind: ChangeKind,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database lives only as long as its connection.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        Ok(Self {
            pool,
            changes,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn notify(&self, site: &SiteId, kind: ChangeKind) {
        // No receivers is fine.
        let _ = self.changes.send(Change {
            site: site.clone(),
            kind,
        });
    }

    /// Spawn a task that sends `fetch`'s snapshot now and after every
    /// matching change. A failed fetch is sent and ends the subscription.
    fn spawn_subscription<T, F, Fut>(&self, site: &SiteId, kind: ChangeKind, fetch: F) -> Subscription<T>
    where
        T: Send + 'static,
        F: Fn(Db, SiteId) -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<T>> + Send + 'static,
    {
        // Subscribe before the first read so no change can slip between them.
        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(16);
        let db = self.clone();
        let site = site.clone();

        let task = tokio::spawn(async move {
            loop {
                let snapshot = fetch(db.clone(), site.clone()).await;
                if !forward(&tx, snapshot).await {
                    debug!(site = %site, ?kind, "subscription ended");
                    return;
                }

                loop {
                    match changes.recv().await {
                        Ok(c) if c.kind == kind && c.site == site => break,
                        Ok(_) => continue,
                        // Missed notifications: a fresh snapshot covers them.
                        Err(RecvError::Lagged(_)) => break,
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        });

        Subscription::new(rx, task)
    }

    // ----------------------------
    // Schedule
    // ----------------------------

    async fn merge_periods(
        &self,
        site: &SiteId,
        day: Day,
        periods: &[(Period, &ScheduleEntry)],
    ) -> StoreResult<()> {
        let encoded = periods
            .iter()
            .map(|(p, e)| encode_entry(e).map(|json| (*p, json)))
            .collect::<StoreResult<Vec<_>>>()?;
        let sql = merge_periods_sql(&encoded.iter().map(|(p, _)| *p).collect::<Vec<_>>());

        let mut query = sqlx::query(&sql).bind(site.as_str()).bind(day.as_str());
        for (_, json) in &encoded {
            query = query.bind(json.as_str());
        }
        query
            .bind(to_ms(OffsetDateTime::now_utc()))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("merge_periods", e))?;

        self.notify(site, ChangeKind::Schedule);
        Ok(())
    }

    async fn clear_period(&self, site: &SiteId, day: Day, period: Period) -> StoreResult<()> {
        let sql = format!(
            "UPDATE schedule_days SET {col} = NULL, updated_at = ? WHERE site_id = ? AND day = ?",
            col = period.field_name()
        );
        let res = sqlx::query(&sql)
            .bind(to_ms(OffsetDateTime::now_utc()))
            .bind(site.as_str())
            .bind(day.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("delete_period", e))?;

        if res.rows_affected() == 0 {
            debug!(site = %site, %day, %period, "delete_period: no day document, nothing to clear");
            return Ok(());
        }
        self.notify(site, ChangeKind::Schedule);
        Ok(())
    }

    async fn fetch_days(&self, site: &SiteId, day: Option<Day>) -> StoreResult<Vec<ScheduleDay>> {
        let rows = sqlx::query(
            r#"
            SELECT day, morning, midday, afternoon, updated_at
            FROM schedule_days
            WHERE site_id = ? AND (? IS NULL OR day = ?)
            "#,
        )
        .bind(site.as_str())
        .bind(day.map(Day::as_str))
        .bind(day.map(Day::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("get_days", e))?;

        let mut days = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(d) = decode_day(row).map_err(|e| StoreError::from_sqlx("get_days", e))? {
                days.push(d);
            }
        }
        days.sort_by_key(|d| d.day.ordinal());
        Ok(days)
    }

    // ----------------------------
    // Manual session
    // ----------------------------

    async fn write_session_started(
        &self,
        site: &SiteId,
        total_litres: u32,
        now: OffsetDateTime,
    ) -> StoreResult<()> {
        // Stop fields from the previous run must be cleared explicitly.
        sqlx::query(
            r#"
            INSERT INTO manual_sessions (
              site_id, running, started_at, total_litres,
              used_litres, remaining_litres, stopped_at
            ) VALUES (?, 1, ?, ?, NULL, NULL, NULL)
            ON CONFLICT(site_id) DO UPDATE SET
              running=1,
              started_at=excluded.started_at,
              total_litres=excluded.total_litres,
              used_litres=NULL,
              remaining_litres=NULL,
              stopped_at=NULL
            "#,
        )
        .bind(site.as_str())
        .bind(to_ms(now))
        .bind(i64::from(total_litres))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("begin_manual_session", e))?;

        self.notify(site, ChangeKind::Session);
        Ok(())
    }

    async fn write_session_not_running(&self, site: &SiteId) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO manual_sessions (site_id, running) VALUES (?, 0)
            ON CONFLICT(site_id) DO UPDATE SET running=0
            "#,
        )
        .bind(site.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("end_manual_session", e))?;

        self.notify(site, ChangeKind::Session);
        Ok(())
    }

    async fn write_session_stopped(
        &self,
        site: &SiteId,
        outcome: StopOutcome,
        now: OffsetDateTime,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE manual_sessions
            SET running=0, used_litres=?, remaining_litres=?, stopped_at=?
            WHERE site_id = ?
            "#,
        )
        .bind(i64::from(outcome.used_litres))
        .bind(i64::from(outcome.remaining_litres))
        .bind(to_ms(now))
        .bind(site.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("end_manual_session", e))?;

        self.notify(site, ChangeKind::Session);
        Ok(())
    }

    async fn fetch_session(&self, site: &SiteId) -> StoreResult<Option<ManualSession>> {
        let row = sqlx::query(
            r#"
            SELECT running, started_at, total_litres, used_litres, remaining_litres, stopped_at
            FROM manual_sessions
            WHERE site_id = ?
            "#,
        )
        .bind(site.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("get_session", e))?;

        row.as_ref()
            .map(decode_session)
            .transpose()
            .map_err(|e| StoreError::from_sqlx("get_session", e))
    }

    async fn stop_running_session(&self, site: &SiteId, now: OffsetDateTime) -> StoreResult<StopOutcome> {
        let session = match self.fetch_session(site).await? {
            Some(s) if s.running => s,
            _ => {
                self.write_session_not_running(site).await?;
                debug!(site = %site, "end_manual_session: nothing running");
                return Ok(StopOutcome::default());
            }
        };

        let used = flow::used_litres(session.started_at, now).min(session.total_litres);
        let outcome = StopOutcome {
            used_litres: used,
            remaining_litres: session.total_litres.saturating_sub(used),
            stopped: true,
        };

        let started_local = session.started_at.to_offset(now.offset());
        let date = log_date(started_local);
        let entry = IrrigationLogEntry {
            start_time: log_time(started_local),
            end_time: log_time(now),
            zones: Vec::new(),
            litres: used,
            scheduled: false,
        };

        // Three separate writes; a failure leaves the earlier ones in place.
        self.ensure_daily_log(site, &date, now).await?;
        self.put_log_entry(site, &date, &entry).await?;
        self.write_session_stopped(site, outcome, now).await?;

        info!(
            site = %site,
            used_litres = outcome.used_litres,
            remaining_litres = outcome.remaining_litres,
            date = %date,
            start = %entry.start_time,
            "manual session ended"
        );
        Ok(outcome)
    }

    // ----------------------------
    // History
    // ----------------------------

    /// Create the day's log if absent; an existing log is never overwritten.
    pub async fn ensure_daily_log(&self, site: &SiteId, date: &str, now: OffsetDateTime) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_logs (site_id, date, timestamp)
            VALUES (?, ?, ?)
            ON CONFLICT(site_id, date) DO NOTHING
            "#,
        )
        .bind(site.as_str())
        .bind(date)
        .bind(to_ms(now))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("ensure_daily_log", e))?;
        Ok(())
    }

    /// Insert the entry keyed by its start time, replacing any previous entry
    /// with the same key.
    pub async fn put_log_entry(
        &self,
        site: &SiteId,
        date: &str,
        entry: &IrrigationLogEntry,
    ) -> StoreResult<()> {
        let zones = serde_json::to_string(&entry.zones)
            .map_err(|source| StoreError::Malformed { what: "log zones", source })?;
        sqlx::query(
            r#"
            INSERT INTO irrigation_log_entries (
              site_id, date, start_time, end_time, zones, litres, scheduled
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(site_id, date, start_time) DO UPDATE SET
              end_time=excluded.end_time,
              zones=excluded.zones,
              litres=excluded.litres,
              scheduled=excluded.scheduled
            "#,
        )
        .bind(site.as_str())
        .bind(date)
        .bind(&entry.start_time)
        .bind(&entry.end_time)
        .bind(zones)
        .bind(i64::from(entry.litres))
        .bind(entry.scheduled)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("put_log_entry", e))?;

        self.notify(site, ChangeKind::Logs);
        Ok(())
    }

    async fn has_log_entry(&self, site: &SiteId, date: &str, start_time: &str) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS present
            FROM irrigation_log_entries
            WHERE site_id = ? AND date = ? AND start_time = ?
            "#,
        )
        .bind(site.as_str())
        .bind(date)
        .bind(start_time)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("has_log_entry", e))?;
        Ok(row.is_some())
    }

    /// Daily logs between the optional inclusive bounds, oldest first.
    async fn fetch_logs(&self, site: &SiteId, from: Option<&str>, to: Option<&str>) -> StoreResult<Vec<DailyLog>> {
        let day_rows = sqlx::query(
            r#"
            SELECT date, timestamp
            FROM daily_logs
            WHERE site_id = ? AND (? IS NULL OR date >= ?) AND (? IS NULL OR date <= ?)
            ORDER BY date
            "#,
        )
        .bind(site.as_str())
        .bind(from)
        .bind(from)
        .bind(to)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("get_logs", e))?;

        let entry_rows = sqlx::query(
            r#"
            SELECT date, start_time, end_time, zones, litres, scheduled
            FROM irrigation_log_entries
            WHERE site_id = ? AND (? IS NULL OR date >= ?) AND (? IS NULL OR date <= ?)
            "#,
        )
        .bind(site.as_str())
        .bind(from)
        .bind(from)
        .bind(to)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("get_logs", e))?;

        let mut by_date: BTreeMap<String, BTreeMap<String, IrrigationLogEntry>> = BTreeMap::new();
        for row in &entry_rows {
            let date: String = row.try_get("date").map_err(|e| StoreError::from_sqlx("get_logs", e))?;
            let entry = decode_log_entry(row).map_err(|e| StoreError::from_sqlx("get_logs", e))?;
            by_date.entry(date).or_default().insert(entry.start_time.clone(), entry);
        }

        day_rows
            .iter()
            .map(|row| {
                let date: String = row.try_get("date")?;
                let timestamp: i64 = row.try_get("timestamp")?;
                Ok(DailyLog {
                    logs: by_date.remove(&date).unwrap_or_default(),
                    date,
                    timestamp: from_ms(timestamp),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| StoreError::from_sqlx("get_logs", e))
    }

    async fn repair_once(&self, site: &SiteId, now: OffsetDateTime) -> StoreResult<bool> {
        let Some(session) = self.fetch_session(site).await? else {
            return Ok(false);
        };
        let (Some(stopped_at), Some(used)) = (session.stopped_at, session.used_litres) else {
            return Ok(false);
        };
        if session.running {
            return Ok(false);
        }

        let started_local = session.started_at.to_offset(now.offset());
        let date = log_date(started_local);
        let start_time = log_time(started_local);
        if self.has_log_entry(site, &date, &start_time).await? {
            return Ok(false);
        }

        let entry = IrrigationLogEntry {
            start_time,
            end_time: log_time(stopped_at.to_offset(now.offset())),
            zones: Vec::new(),
            litres: used,
            scheduled: false,
        };
        self.ensure_daily_log(site, &date, now).await?;
        self.put_log_entry(site, &date, &entry).await?;

        warn!(
            site = %site,
            date = %date,
            start = %entry.start_time,
            litres = used,
            "repaired missing history entry for stopped session"
        );
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Adapter impls (every operation runs under the retry policy)
// ---------------------------------------------------------------------------

#[async_trait]
impl ScheduleStore for Db {
    async fn upsert_period(
        &self,
        site: &SiteId,
        day: Day,
        period: Period,
        entry: &ScheduleEntry,
    ) -> StoreResult<()> {
        let periods = [(period, entry)];
        self.retry
            .run("upsert_period", || self.merge_periods(site, day, &periods))
            .await
    }

    async fn delete_period(&self, site: &SiteId, day: Day, period: Period) -> StoreResult<()> {
        self.retry
            .run("delete_period", || self.clear_period(site, day, period))
            .await
    }

    async fn upsert_day(&self, site: &SiteId, day: Day, update: &DayUpdate) -> StoreResult<()> {
        let periods: Vec<(Period, &ScheduleEntry)> = Period::ALL
            .into_iter()
            .filter_map(|p| update.get(p).map(|e| (p, e)))
            .collect();
        self.retry
            .run("upsert_day", || self.merge_periods(site, day, &periods))
            .await
    }

    async fn get_day(&self, site: &SiteId, day: Day) -> StoreResult<Option<ScheduleDay>> {
        let days = self
            .retry
            .run("get_day", || self.fetch_days(site, Some(day)))
            .await?;
        Ok(days.into_iter().next())
    }

    async fn get_all_days(&self, site: &SiteId) -> StoreResult<Vec<ScheduleDay>> {
        self.retry
            .run("get_all_days", || self.fetch_days(site, None))
            .await
    }

    fn subscribe_all(&self, site: &SiteId) -> Subscription<Vec<ScheduleDay>> {
        self.spawn_subscription(site, ChangeKind::Schedule, |db, site| async move {
            db.get_all_days(&site).await
        })
    }
}

#[async_trait]
impl SessionStore for Db {
    async fn begin_manual_session(
        &self,
        site: &SiteId,
        total_litres: u32,
        now: OffsetDateTime,
    ) -> StoreResult<()> {
        self.retry
            .run("begin_manual_session", || {
                self.write_session_started(site, total_litres, now)
            })
            .await?;
        info!(site = %site, total_litres, "manual session started");
        Ok(())
    }

    async fn end_manual_session(&self, site: &SiteId, now: OffsetDateTime) -> StoreResult<StopOutcome> {
        self.retry
            .run("end_manual_session", || self.stop_running_session(site, now))
            .await
    }

    async fn get_session(&self, site: &SiteId) -> StoreResult<Option<ManualSession>> {
        self.retry
            .run("get_session", || self.fetch_session(site))
            .await
    }

    fn subscribe_session(&self, site: &SiteId) -> Subscription<Option<ManualSession>> {
        self.spawn_subscription(site, ChangeKind::Session, |db, site| async move {
            db.get_session(&site).await
        })
    }

    async fn get_all_logs(&self, site: &SiteId) -> StoreResult<Vec<DailyLog>> {
        self.retry
            .run("get_all_logs", || self.fetch_logs(site, None, None))
            .await
    }

    async fn get_log(&self, site: &SiteId, date: &str) -> StoreResult<Option<DailyLog>> {
        let logs = self
            .retry
            .run("get_log", || self.fetch_logs(site, Some(date), Some(date)))
            .await?;
        Ok(logs.into_iter().next())
    }

    async fn get_logs_in_range(&self, site: &SiteId, from: &str, to: &str) -> StoreResult<Vec<DailyLog>> {
        self.retry
            .run("get_logs_in_range", || self.fetch_logs(site, Some(from), Some(to)))
            .await
    }

    async fn repair_session_log(&self, site: &SiteId, now: OffsetDateTime) -> StoreResult<bool> {
        self.retry
            .run("repair_session_log", || self.repair_once(site, now))
            .await
    }
}

// ---------------------------------------------------------------------------
// Row codecs
// ---------------------------------------------------------------------------

/// `INSERT … ON CONFLICT DO UPDATE` touching only `periods` and `updated_at`.
/// Column names come from [`Period::field_name`], never from input.
fn merge_periods_sql(periods: &[Period]) -> String {
    let mut columns = vec!["site_id", "day"];
    columns.extend(periods.iter().map(|p| p.field_name()));
    columns.push("updated_at");

    let placeholders = vec!["?"; columns.len()].join(", ");
    let updates = columns[2..]
        .iter()
        .map(|c| format!("{c}=excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO schedule_days ({}) VALUES ({placeholders}) \
         ON CONFLICT(site_id, day) DO UPDATE SET {updates}",
        columns.join(", ")
    )
}

fn encode_entry(entry: &ScheduleEntry) -> StoreResult<String> {
    serde_json::to_string(entry).map_err(|source| StoreError::Malformed {
        what: "schedule entry",
        source,
    })
}

/// Undecodable periods read as absent so one bad document cannot take the
/// whole schedule down.
fn decode_period(raw: Option<String>, day: &str, period: Period) -> Option<ScheduleEntry> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(day, %period, "ignoring malformed schedule entry: {e}");
            None
        }
    }
}

fn decode_day(row: &SqliteRow) -> Result<Option<ScheduleDay>, sqlx::Error> {
    let key: String = row.try_get("day")?;
    let Ok(day) = key.parse::<Day>() else {
        warn!(day = %key, "ignoring schedule document with unknown day");
        return Ok(None);
    };
    Ok(Some(ScheduleDay {
        day,
        morning: decode_period(row.try_get("morning")?, &key, Period::Morning),
        midday: decode_period(row.try_get("midday")?, &key, Period::Midday),
        afternoon: decode_period(row.try_get("afternoon")?, &key, Period::Afternoon),
        updated_at: from_ms(row.try_get("updated_at")?),
    }))
}

fn decode_session(row: &SqliteRow) -> Result<ManualSession, sqlx::Error> {
    Ok(ManualSession {
        running: row.try_get("running")?,
        started_at: from_ms(row.try_get("started_at")?),
        total_litres: litres(row.try_get("total_litres")?),
        used_litres: row.try_get::<Option<i64>, _>("used_litres")?.map(litres),
        remaining_litres: row.try_get::<Option<i64>, _>("remaining_litres")?.map(litres),
        stopped_at: row.try_get::<Option<i64>, _>("stopped_at")?.map(from_ms),
    })
}

fn decode_log_entry(row: &SqliteRow) -> Result<IrrigationLogEntry, sqlx::Error> {
    let zones_raw: String = row.try_get("zones")?;
    let zones = serde_json::from_str(&zones_raw).unwrap_or_else(|e| {
        warn!("ignoring malformed log zones {zones_raw:?}: {e}");
        Vec::new()
    });
    Ok(IrrigationLogEntry {
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        zones,
        litres: litres(row.try_get("litres")?),
        scheduled: row.try_get("scheduled")?,
    })
}

/// Negative or oversized legacy values clamp to zero rather than fail.
fn litres(v: i64) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

fn to_ms(dt: OffsetDateTime) -> i64 {
    (dt.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_ms(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

// ===========================================================================
// Tests
// ===========================================================================
