//! Adapter interfaces over the document store.
//!
//! The engine only talks to persistence through these two traits. Writes are
//! field-level merges: an operation touches exactly the fields it names and
//! leaves everything else in the document as another writer left it.

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::StoreResult;
use crate::model::{DailyLog, Day, DayUpdate, ManualSession, Period, ScheduleDay, ScheduleEntry, SiteId};

/// What `end_manual_session` reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub used_litres: u32,
    pub remaining_litres: u32,
    /// A running session was actually ended by this call.
    #[serde(skip)]
    pub stopped: bool,
}

/// Weekly schedule documents.
///
/// Note the deliberate asymmetry: `upsert_period` and `upsert_day` create or
/// overwrite periods but never clear one, and `delete_period` clears a period
/// but never creates a document. Saving a whole day that should lose a period
/// therefore takes an `upsert_day` *and* a `delete_period`.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Merge one period (plus `updatedAt`) into the day, creating the day
    /// document if needed.
    async fn upsert_period(
        &self,
        site: &SiteId,
        day: Day,
        period: Period,
        entry: &ScheduleEntry,
    ) -> StoreResult<()>;

    /// Clear one period and bump `updatedAt`. Other periods are untouched.
    async fn delete_period(&self, site: &SiteId, day: Day, period: Period) -> StoreResult<()>;

    /// Merge every `Some` period of `update` in one write. `None` periods are
    /// left as stored; they are not cleared.
    async fn upsert_day(&self, site: &SiteId, day: Day, update: &DayUpdate) -> StoreResult<()>;

    async fn get_day(&self, site: &SiteId, day: Day) -> StoreResult<Option<ScheduleDay>>;

    /// Every stored day, ordered Monday first.
    async fn get_all_days(&self, site: &SiteId) -> StoreResult<Vec<ScheduleDay>>;

    /// Live view of all days: a full snapshot now and after every change.
    fn subscribe_all(&self, site: &SiteId) -> Subscription<Vec<ScheduleDay>>;
}

/// The manual session singleton and the daily history.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Mark the session running from `now` with `total_litres`, clearing the
    /// stop fields left behind by the previous session. Not atomic with any
    /// history write.
    async fn begin_manual_session(
        &self,
        site: &SiteId,
        total_litres: u32,
        now: OffsetDateTime,
    ) -> StoreResult<()>;

    /// Stop the session and record its history entry. Ending a session that
    /// is not running only writes `running = false` and reports zeros, so
    /// calling this twice is harmless. With no record at all, that write
    /// creates one holding only `running = false`: its start reads as the
    /// Unix epoch and its total as zero.
    async fn end_manual_session(&self, site: &SiteId, now: OffsetDateTime)
        -> StoreResult<StopOutcome>;

    async fn get_session(&self, site: &SiteId) -> StoreResult<Option<ManualSession>>;

    /// Live view of the session record.
    fn subscribe_session(&self, site: &SiteId) -> Subscription<Option<ManualSession>>;

    async fn get_all_logs(&self, site: &SiteId) -> StoreResult<Vec<DailyLog>>;

    async fn get_log(&self, site: &SiteId, date: &str) -> StoreResult<Option<DailyLog>>;

    /// Daily logs with `from <= date <= to` (ISO dates), oldest first.
    async fn get_logs_in_range(&self, site: &SiteId, from: &str, to: &str)
        -> StoreResult<Vec<DailyLog>>;

    /// Write the missing history entry of a stopped session, if any, using
    /// `now`'s offset for the wall-clock strings. Returns whether something
    /// was written. Idempotent.
    async fn repair_session_log(&self, site: &SiteId, now: OffsetDateTime) -> StoreResult<bool>;
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Receiving end of a live query. Each item is the full current value; an
/// `Err` item is terminal. Dropping the handle (or `unsubscribe`) stops the
/// feeding task.
pub struct Subscription<T> {
    rx: mpsc::Receiver<StoreResult<T>>,
    task: JoinHandle<()>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::Receiver<StoreResult<T>>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Next snapshot; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<StoreResult<T>> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Send one snapshot. Returns `false` when the feed should stop: the
/// receiver is gone or the item was an error.
pub(crate) async fn forward<T>(tx: &mpsc::Sender<StoreResult<T>>, item: StoreResult<T>) -> bool {
    let terminal = item.is_err();
    if tx.send(item).await.is_err() {
        return false;
    }
    !terminal
}
