//! Session coordinator: the single owner of "is water running, and why".
//!
//! Manual sessions are persisted through the [`SessionStore`]; scheduled runs
//! are derived every tick from today's schedule and never written anywhere.
//! The subscribed session record is authoritative: any local copy written
//! after a start/stop is replaced as soon as the subscription delivers.
//!
//! ## States
//!
//! ```text
//!            start(litres)                       stop() / remaining == 0
//! Idle ─────────────────────▶ ManualRunning ─────────────────────────────▶ Idle
//!  ▲
//!  └──[window closes]── ScheduledRunning ◀──[window opens]── Idle (derived)
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::model::{format_schedule_time, Day, ManualSession, ScheduleDay, SiteId};
use crate::resolver::{find_active_window_opt, ActiveWindow};
use crate::state::{EventKind, SharedState};
use crate::store::{ScheduleStore, SessionStore, StopOutcome};

/// Default clock tick for auto-stop and schedule detection.
pub const TICK_INTERVAL_SEC: u64 = 30;

/// Pause before re-subscribing after a subscription fails.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("litres must be greater than zero")]
    InvalidLitres,

    #[error("a manual session is already running")]
    AlreadyRunning,

    #[error("coordinator is not running")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    User,
    AutoStop,
}

/// Derived engine state at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    ManualRunning { remaining_litres: u32 },
    ScheduledRunning(ActiveWindow),
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator<S> {
    site: SiteId,
    store: Arc<S>,
    shared: SharedState,
    offset: UtcOffset,
    session: Option<ManualSession>,
    schedule: Vec<ScheduleDay>,
    /// Set by the first schedule snapshot. Ticks before it never evaluate
    /// scheduled windows.
    schedule_loaded: bool,
    /// Scheduled-window state seen at the previous evaluation; `None` until
    /// the first one so startup never fires a notification.
    prev_scheduled: Option<bool>,
}

impl<S> Coordinator<S>
where
    S: SessionStore + ScheduleStore + 'static,
{
    pub fn new(site: SiteId, store: Arc<S>, shared: SharedState, offset: UtcOffset) -> Self {
        Self {
            site,
            store,
            shared,
            offset,
            session: None,
            schedule: Vec::new(),
            schedule_loaded: false,
            prev_scheduled: None,
        }
    }

    /// Current time in the site's offset.
    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    pub fn session(&self) -> Option<&ManualSession> {
        self.session.as_ref()
    }

    pub fn manual_running(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.running)
    }

    /// Scheduled window open at `now`, from today's schedule document.
    pub fn scheduled_window(&self, now: OffsetDateTime) -> Option<ActiveWindow> {
        let today = Day::of(now);
        find_active_window_opt(self.schedule.iter().find(|d| d.day == today), now)
    }

    /// Manual state takes precedence over a scheduled window.
    pub fn state(&self, now: OffsetDateTime) -> EngineState {
        if let Some(remaining_litres) = self.session.as_ref().and_then(|s| s.remaining_at(now)) {
            return EngineState::ManualRunning { remaining_litres };
        }
        match self.scheduled_window(now) {
            Some(w) => EngineState::ScheduledRunning(w),
            None => EngineState::Idle,
        }
    }

    // ── User operations ─────────────────────────────────────────────

    pub async fn start(&mut self, litres: u32, now: OffsetDateTime) -> Result<(), CoordinatorError> {
        if litres == 0 {
            return Err(CoordinatorError::InvalidLitres);
        }
        if self.manual_running() {
            return Err(CoordinatorError::AlreadyRunning);
        }

        if let Err(e) = self.store.begin_manual_session(&self.site, litres, now).await {
            error!(site = %self.site, litres, "coordinator: begin_manual_session failed: {e}");
            self.shared
                .write()
                .await
                .record_error(format!("could not start irrigation: {e}"));
            return Err(e.into());
        }

        // Local copy until the subscription confirms it.
        self.session = Some(ManualSession {
            running: true,
            started_at: now,
            total_litres: litres,
            used_litres: None,
            remaining_litres: None,
            stopped_at: None,
        });

        let mut st = self.shared.write().await;
        st.session = self.session.clone();
        st.record(
            EventKind::ManualStart,
            format!("Started at {} • {litres}L", format_schedule_time(now)),
        );
        Ok(())
    }

    pub async fn stop(
        &mut self,
        now: OffsetDateTime,
        reason: StopReason,
    ) -> Result<StopOutcome, CoordinatorError> {
        let outcome = match self.store.end_manual_session(&self.site, now).await {
            Ok(o) => o,
            Err(e) => {
                // Nothing is rolled back; whatever the store applied stays.
                error!(site = %self.site, ?reason, "coordinator: end_manual_session failed: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("could not stop irrigation: {e}"));
                return Err(e.into());
            }
        };

        if let Some(s) = self.session.as_mut().filter(|s| s.running) {
            s.running = false;
            s.used_litres = Some(outcome.used_litres);
            s.remaining_litres = Some(outcome.remaining_litres);
            s.stopped_at = Some(now);
        }

        let mut st = self.shared.write().await;
        st.session = self.session.clone();
        // Reported by the store, so a start from another device that has not
        // reached us yet still gets its stop event.
        if outcome.stopped {
            let verb = match reason {
                StopReason::User => "Stopped",
                StopReason::AutoStop => "Auto-stopped",
            };
            st.record(
                EventKind::ManualStop,
                format!(
                    "{verb} at {} • {}L used",
                    format_schedule_time(now),
                    outcome.used_litres
                ),
            );
        }
        info!(
            site = %self.site,
            ?reason,
            used_litres = outcome.used_litres,
            remaining_litres = outcome.remaining_litres,
            "coordinator: manual session stopped"
        );
        Ok(outcome)
    }

    // ── Subscription updates ────────────────────────────────────────

    /// Adopt the store's session record, discarding any local copy.
    pub async fn apply_session(&mut self, session: Option<ManualSession>, now: OffsetDateTime) {
        debug!(site = %self.site, running = ?session.as_ref().map(|s| s.running), "session update");
        self.session = session;
        self.shared.write().await.session = self.session.clone();

        if self.session.as_ref().is_some_and(|s| !s.running && s.stopped_at.is_some()) {
            match self.store.repair_session_log(&self.site, now).await {
                Ok(true) => self
                    .shared
                    .write()
                    .await
                    .record_system("repaired missing history entry".to_string()),
                Ok(false) => {}
                Err(e) => warn!(site = %self.site, "coordinator: repair_session_log failed: {e}"),
            }
        }

        // A session that ran out while we were away must stop now.
        self.check_auto_stop(now).await;
    }

    pub async fn apply_schedule(&mut self, days: Vec<ScheduleDay>, now: OffsetDateTime) {
        debug!(site = %self.site, days = days.len(), "schedule update");
        self.shared.write().await.schedule = days.clone();
        self.schedule = days;
        self.schedule_loaded = true;
        self.detect_scheduled_edge(now).await;
    }

    // ── Clock ───────────────────────────────────────────────────────

    pub async fn tick(&mut self, now: OffsetDateTime) {
        self.check_auto_stop(now).await;
        self.detect_scheduled_edge(now).await;
    }

    /// Stop a running manual session once its volume is used up. Remaining
    /// volume comes from the persisted start and total only.
    async fn check_auto_stop(&mut self, now: OffsetDateTime) {
        let Some(remaining) = self.session.as_ref().and_then(|s| s.remaining_at(now)) else {
            return;
        };
        if remaining > 0 {
            return;
        }

        info!(site = %self.site, "coordinator: manual volume delivered, auto-stopping");
        if let Err(e) = self.stop(now, StopReason::AutoStop).await {
            // Re-evaluated on the next tick.
            warn!(site = %self.site, "coordinator: auto-stop failed: {e}");
        }
    }

    /// Notify on scheduled-window transitions. The edge state is tracked on
    /// every call, but notifications are suppressed while a manual session
    /// runs.
    async fn detect_scheduled_edge(&mut self, now: OffsetDateTime) {
        if !self.schedule_loaded {
            return;
        }
        let window = self.scheduled_window(now);
        let prev = self.prev_scheduled.replace(window.is_some());
        if self.manual_running() {
            return;
        }

        let mut st = self.shared.write().await;
        match (prev, &window) {
            (Some(false), Some(w)) => {
                info!(site = %self.site, period = %w.period, litres = w.litres, "coordinator: scheduled run started");
                st.record(
                    EventKind::ScheduledStart,
                    format!("Started at {} • {}L", format_schedule_time(now), w.litres),
                );
            }
            (Some(true), None) => {
                info!(site = %self.site, "coordinator: scheduled run stopped");
                st.record(
                    EventKind::ScheduledStop,
                    format!("Stopped at {}", format_schedule_time(now)),
                );
            }
            _ => {}
        }
    }

    // ── Task ────────────────────────────────────────────────────────

    async fn handle(&mut self, cmd: Command) {
        let now = self.now();
        match cmd {
            Command::Start { litres, reply } => {
                let _ = reply.send(self.start(litres, now).await);
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.stop(now, StopReason::User).await);
            }
            Command::Tick { reply } => {
                self.tick(now).await;
                let _ = reply.send(());
            }
        }
    }

    /// Run until every [`CoordinatorHandle`] is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, tick: Duration) {
        let mut session_sub = self.store.subscribe_session(&self.site);
        let mut schedule_sub = self.store.subscribe_all(&self.site);

        match self.store.repair_session_log(&self.site, self.now()).await {
            Ok(true) => info!(site = %self.site, "coordinator: repaired history at startup"),
            Ok(false) => {}
            Err(e) => warn!(site = %self.site, "coordinator: startup repair failed: {e}"),
        }

        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(site = %self.site, tick_sec = tick.as_secs(), "coordinator started");
        self.shared
            .write()
            .await
            .record_system(format!("coordinator started (tick {}s)", tick.as_secs()));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.now();
                    self.tick(now).await;
                }
                update = session_sub.recv() => match update {
                    Some(Ok(session)) => {
                        let now = self.now();
                        self.apply_session(session, now).await;
                    }
                    other => {
                        self.subscription_lost("session", other.and_then(Result::err)).await;
                        session_sub = self.store.subscribe_session(&self.site);
                    }
                },
                update = schedule_sub.recv() => match update {
                    Some(Ok(days)) => {
                        let now = self.now();
                        self.apply_schedule(days, now).await;
                    }
                    other => {
                        self.subscription_lost("schedule", other.and_then(Result::err)).await;
                        schedule_sub = self.store.subscribe_all(&self.site);
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
            }
        }

        info!(site = %self.site, "coordinator stopped");
    }

    async fn subscription_lost(&self, what: &str, err: Option<StoreError>) {
        match err {
            Some(e) => {
                error!(site = %self.site, "coordinator: {what} subscription failed: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("{what} updates interrupted: {e}"));
            }
            None => warn!(site = %self.site, "coordinator: {what} subscription closed"),
        }
        sleep(RESUBSCRIBE_DELAY).await;
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

pub enum Command {
    Start {
        litres: u32,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<StopOutcome, CoordinatorError>>,
    },
    Tick {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    pub async fn start(&self, litres: u32) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { litres, reply }).await?;
        rx.await.map_err(|_| CoordinatorError::Stopped)?
    }

    pub async fn stop(&self) -> Result<StopOutcome, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply }).await?;
        rx.await.map_err(|_| CoordinatorError::Stopped)?
    }

    /// Evaluate auto-stop and the schedule immediately.
    pub async fn tick_now(&self) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Tick { reply }).await?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    async fn send(&self, cmd: Command) -> Result<(), CoordinatorError> {
        self.tx.send(cmd).await.map_err(|_| CoordinatorError::Stopped)
    }
}

/// Spawn `coordinator` on the runtime. The task ends when every handle is
/// dropped.
pub fn spawn<S>(coordinator: Coordinator<S>, tick: Duration) -> (CoordinatorHandle, JoinHandle<()>)
where
    S: SessionStore + ScheduleStore + 'static,
{
    let (tx, rx) = mpsc::channel(32);
    let task = tokio::spawn(coordinator.run(rx, tick));
    (CoordinatorHandle { tx }, task)
}

// ===========================================================================
// Tests
// ===========================================================================
