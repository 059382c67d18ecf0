//! JSON API over the coordinator and the store adapters.

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::coordinator::{CoordinatorError, CoordinatorHandle};
use crate::db::Db;
use crate::error::StoreError;
use crate::model::{parse_schedule_time, Day, DayUpdate, Period, ScheduleEntry, SiteId};
use crate::state::SharedState;
use crate::store::{ScheduleStore, SessionStore};

const DATE_FMT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Open bounds for `/api/logs` when only one side is given.
const FIRST_DATE: &str = "0000-01-01";
const LAST_DATE: &str = "9999-12-31";

#[derive(Clone)]
pub struct AppState {
    pub site: SiteId,
    pub offset: UtcOffset,
    pub shared: SharedState,
    pub coordinator: CoordinatorHandle,
    pub db: Arc<Db>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Store(StoreError),
    Unavailable(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::Store(e) => ApiError::Store(e),
            CoordinatorError::InvalidLitres => ApiError::BadRequest(e.to_string()),
            CoordinatorError::AlreadyRunning => ApiError::Conflict(e.to_string()),
            CoordinatorError::Stopped => ApiError::Unavailable(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Store(e) if e.is_transient() => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            ApiError::Store(e) => {
                error!("web: store error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn parse_day(raw: &str) -> Result<Day, ApiError> {
    raw.parse().map_err(ApiError::BadRequest)
}

fn parse_period(raw: &str) -> Result<Period, ApiError> {
    raw.parse().map_err(ApiError::BadRequest)
}

fn parse_date(raw: &str) -> Result<String, ApiError> {
    Date::parse(raw, DATE_FMT)
        .map(|_| raw.to_string())
        .map_err(|_| ApiError::BadRequest(format!("'{raw}' is not a YYYY-MM-DD date")))
}

/// Blank times are allowed (the period is then inactive); anything else must
/// be "h:mm AM/PM".
fn check_entry(entry: &ScheduleEntry) -> Result<(), ApiError> {
    let blank = entry.start_time.trim().is_empty();
    if !blank && parse_schedule_time(&entry.start_time).is_none() {
        return Err(ApiError::BadRequest(format!(
            "startTime '{}' is not of the form \"7:00 AM\"",
            entry.start_time
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/manual/start", post(manual_start))
        .route("/api/manual/stop", post(manual_stop))
        .route("/api/schedule", get(schedule_all))
        .route("/api/schedule/{day}", get(schedule_day).put(schedule_put_day))
        .route(
            "/api/schedule/{day}/{period}",
            put(schedule_put_period).delete(schedule_delete_period),
        )
        .route("/api/logs", get(logs))
        .route("/api/logs/{date}", get(log_for_date))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let now = OffsetDateTime::now_utc().to_offset(state.offset);
    let st = state.shared.read().await;
    Json(st.to_status(now))
}

#[derive(Deserialize)]
struct StartRequest {
    litres: u32,
}

async fn manual_start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.coordinator.start(req.litres).await?;
    let now = OffsetDateTime::now_utc().to_offset(state.offset);
    let status = state.shared.read().await.to_status(now);
    Ok((StatusCode::CREATED, Json(status)))
}

async fn manual_stop(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.coordinator.stop().await?;
    Ok(Json(outcome))
}

async fn schedule_all(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.get_all_days(&state.site).await?))
}

async fn schedule_day(
    State(state): State<AppState>,
    Path(day): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let day = parse_day(&day)?;
    match state.db.get_day(&state.site, day).await? {
        Some(d) => Ok(Json(d)),
        None => Err(ApiError::NotFound(format!("no schedule for {day}"))),
    }
}

async fn schedule_put_day(
    State(state): State<AppState>,
    Path(day): Path<String>,
    Json(update): Json<DayUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let day = parse_day(&day)?;
    if update.is_empty() {
        return Err(ApiError::BadRequest("no periods given".to_string()));
    }
    for p in Period::ALL {
        if let Some(e) = update.get(p) {
            check_entry(e)?;
        }
    }
    state.db.upsert_day(&state.site, day, &update).await?;
    info!(site = %state.site, %day, "web: day schedule saved");
    Ok(StatusCode::NO_CONTENT)
}

async fn schedule_put_period(
    State(state): State<AppState>,
    Path((day, period)): Path<(String, String)>,
    Json(entry): Json<ScheduleEntry>,
) -> Result<impl IntoResponse, ApiError> {
    let day = parse_day(&day)?;
    let period = parse_period(&period)?;
    check_entry(&entry)?;
    state.db.upsert_period(&state.site, day, period, &entry).await?;
    info!(site = %state.site, %day, %period, "web: period saved");
    Ok(StatusCode::NO_CONTENT)
}

async fn schedule_delete_period(
    State(state): State<AppState>,
    Path((day, period)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let day = parse_day(&day)?;
    let period = parse_period(&period)?;
    state.db.delete_period(&state.site, day, period).await?;
    info!(site = %state.site, %day, %period, "web: period deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct LogsQuery {
    from: Option<String>,
    to: Option<String>,
}

async fn logs(
    State(state): State<AppState>,
    Query(q): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = match (q.from, q.to) {
        (None, None) => state.db.get_all_logs(&state.site).await?,
        (from, to) => {
            let from = from.as_deref().map(parse_date).transpose()?;
            let to = to.as_deref().map(parse_date).transpose()?;
            state
                .db
                .get_logs_in_range(
                    &state.site,
                    from.as_deref().unwrap_or(FIRST_DATE),
                    to.as_deref().unwrap_or(LAST_DATE),
                )
                .await?
        }
    };
    Ok(Json(logs))
}

async fn log_for_date(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let date = parse_date(&date)?;
    match state.db.get_log(&state.site, &date).await? {
        Some(log) => Ok(Json(log)),
        None => Err(ApiError::NotFound(format!("no log for {date}"))),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{self, Coordinator};
    use crate::retry::RetryPolicy;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<Db>) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let db = Arc::new(db.with_retry(RetryPolicy::none()));

        let site = SiteId::new("Site-01");
        let shared: SharedState = Arc::new(RwLock::new(SystemState::new(site.clone())));
        let c = Coordinator::new(site.clone(), Arc::clone(&db), Arc::clone(&shared), UtcOffset::UTC);
        let (handle, _task) = coordinator::spawn(c, Duration::from_secs(3600));

        let state = AppState {
            site,
            offset: UtcOffset::UTC,
            shared,
            coordinator: handle,
            db: Arc::clone(&db),
        };
        (router(state), db)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn status_starts_stopped() {
        let (app, _db) = test_app().await;
        let (status, body) = call(&app, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "Stopped");
        assert_eq!(body["site"], "Site-01");
        assert_eq!(body["manualControlsLocked"], false);
        assert!(body["manual"].is_null());
    }

    #[tokio::test]
    async fn manual_start_and_stop() {
        let (app, db) = test_app().await;

        let (status, body) =
            call(&app, Method::POST, "/api/manual/start", Some(json!({ "litres": 500 }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["label"], "Running (Manual)");
        assert_eq!(body["manual"]["totalLitres"], 500);

        let (status, _) =
            call(&app, Method::POST, "/api/manual/start", Some(json!({ "litres": 10 }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&app, Method::POST, "/api/manual/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["usedLitres"].is_u64());
        assert!(body["remainingLitres"].is_u64());

        let s = db.get_session(&SiteId::new("Site-01")).await.unwrap().unwrap();
        assert!(!s.running);
    }

    #[tokio::test]
    async fn manual_start_rejects_zero() {
        let (app, _db) = test_app().await;
        let (status, body) =
            call(&app, Method::POST, "/api/manual/start", Some(json!({ "litres": 0 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "litres must be greater than zero");
    }

    #[tokio::test]
    async fn schedule_crud() {
        let (app, _db) = test_app().await;

        let (status, _) = call(&app, Method::GET, "/api/schedule/monday", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let entry = json!({ "startTime": "7:00 AM", "litres": 20, "enabled": true, "zones": ["0"] });
        let (status, _) = call(&app, Method::PUT, "/api/schedule/MONDAY/morning", Some(entry)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let day = json!({ "afternoon": { "startTime": "4:00 PM", "litres": 30, "enabled": true } });
        let (status, _) = call(&app, Method::PUT, "/api/schedule/monday", Some(day)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&app, Method::GET, "/api/schedule/MONDAY", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["day"], "MONDAY");
        assert_eq!(body["morning"]["litres"], 20);
        assert_eq!(body["afternoon"]["startTime"], "4:00 PM");

        let (status, _) = call(&app, Method::DELETE, "/api/schedule/monday/morning", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(&app, Method::GET, "/api/schedule", None).await;
        let days = body.as_array().unwrap();
        assert_eq!(days.len(), 1);
        assert!(days[0].get("morning").is_none());
        assert_eq!(days[0]["afternoon"]["litres"], 30);
    }

    #[tokio::test]
    async fn schedule_validation() {
        let (app, _db) = test_app().await;

        let (status, _) = call(&app, Method::GET, "/api/schedule/funday", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let entry = json!({ "startTime": "07:00", "litres": 20, "enabled": true });
        let (status, _) = call(&app, Method::PUT, "/api/schedule/monday/morning", Some(entry)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let entry = json!({ "startTime": "7:00 AM", "litres": 20, "enabled": true });
        let (status, _) = call(&app, Method::PUT, "/api/schedule/monday/evening", Some(entry)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::PUT, "/api/schedule/monday", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logs_by_range_and_date() {
        let (app, db) = test_app().await;
        let site = SiteId::new("Site-01");
        let t0 = time::macros::datetime!(2025-09-29 07:00 UTC);
        db.begin_manual_session(&site, 100, t0).await.unwrap();
        db.end_manual_session(&site, t0 + time::Duration::minutes(2)).await.unwrap();
        db.ensure_daily_log(&site, "2025-09-20", t0).await.unwrap();

        let (status, body) = call(&app, Method::GET, "/api/logs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (_, body) = call(&app, Method::GET, "/api/logs?from=2025-09-25", None).await;
        let logs = body.as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["logs"]["07:00:00"]["litres"], 54);

        let (status, body) = call(&app, Method::GET, "/api/logs/2025-09-29", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["date"], "2025-09-29");

        let (status, _) = call(&app, Method::GET, "/api/logs/2025-09-30", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::GET, "/api/logs?to=yesterday", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
