use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::model::{Day, ManualSession, ScheduleDay, SiteId};
use crate::resolver::{find_active_window_opt, ActiveWindow};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Latest engine view, written by the coordinator and read by the web API.
pub struct SystemState {
    pub started_at: Instant,
    pub site: SiteId,
    /// Last session record observed from the store (or written locally and
    /// not yet confirmed by the subscription).
    pub session: Option<ManualSession>,
    /// Latest weekly schedule snapshot; windows are resolved against the
    /// caller's `now`, not the last tick.
    pub schedule: Vec<ScheduleDay>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ManualStart,
    ManualStop,
    ScheduledStart,
    ScheduledStop,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualStatus {
    pub total_litres: u32,
    pub remaining_litres: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub site: SiteId,
    pub label: &'static str,
    pub manual: Option<ManualStatus>,
    pub scheduled: Option<ActiveWindow>,
    /// Manual litre selection is disabled while a scheduled window is open.
    pub manual_controls_locked: bool,
    pub events: Vec<SystemEvent>,
}

/// Manual state wins the label when both a manual session and a scheduled
/// window are active.
pub fn status_label(manual_running: bool, scheduled_running: bool) -> &'static str {
    match (manual_running, scheduled_running) {
        (true, _) => "Running (Manual)",
        (false, true) => "Running (Scheduled)",
        (false, false) => "Stopped",
    }
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(site: SiteId) -> Self {
        Self {
            started_at: Instant::now(),
            site,
            session: None,
            schedule: Vec::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }

    pub fn record_error(&mut self, detail: String) {
        self.record(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.record(EventKind::System, detail);
    }

    /// Events of one kind, oldest first.
    pub fn events_of(&self, kind: EventKind) -> impl Iterator<Item = &SystemEvent> {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    /// Scheduled window open at `now`, from today's document.
    pub fn scheduled_at(&self, now: OffsetDateTime) -> Option<ActiveWindow> {
        let today = Day::of(now);
        find_active_window_opt(self.schedule.iter().find(|d| d.day == today), now)
    }

    /// Build the JSON-serialisable status snapshot. Remaining volume and the
    /// scheduled window are both derived from `now`, never cached.
    pub fn to_status(&self, now: OffsetDateTime) -> StatusResponse {
        let manual = self.session.as_ref().and_then(|s| {
            s.remaining_at(now).map(|remaining| ManualStatus {
                total_litres: s.total_litres,
                remaining_litres: remaining,
                started_at: s.started_at,
            })
        });

        let scheduled = self.scheduled_at(now);

        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            site: self.site.clone(),
            label: status_label(manual.is_some(), scheduled.is_some()),
            manual_controls_locked: scheduled.is_some(),
            manual,
            scheduled,
            events: self.events.iter().rev().cloned().collect(),
        }
    }
}
