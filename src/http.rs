//! JSON-over-HTTP surface for clients, vendors and admins.
//!
//! Identity comes from the `x-user-id` header set by the fronting gateway;
//! a missing or unknown user is a 401. Every other refusal is decided by
//! the engine and mapped onto a status code here.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::error;
use ulid::Ulid;

use crate::config::RateLimitPolicy;
use crate::engine::{Engine, EngineError, SubmitVisit};
use crate::model::*;
use crate::observability::{REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::ratelimit::RateLimiter;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub limiter: Arc<RateLimiter>,
    /// Applied per user to booking submissions and edits.
    pub submit_rate: RateLimitPolicy,
}

// ── Wire types ───────────────────────────────────────────

/// Error body for every non-2xx answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: bool,
    pub message: String,
    /// Set on 409: which booking rule refused the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<ConflictRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitView {
    pub id: Ulid,
    pub property_id: PropertyId,
    pub user_id: UserId,
    pub requested_at: NaiveDate,
    pub preferred_date: Option<NaiveDate>,
    pub preferred_time: Option<SlotTime>,
    pub phone: Option<String>,
    pub status: VisitStatus,
    pub admin_id: Option<UserId>,
    pub admin_note: Option<String>,
    pub decided_at: Option<NaiveDate>,
}

impl From<VisitRequest> for VisitView {
    fn from(v: VisitRequest) -> Self {
        Self {
            id: v.id,
            preferred_date: v.preferred_date(),
            preferred_time: v.preferred_time(),
            property_id: v.property_id,
            user_id: v.user_id,
            requested_at: v.requested_at,
            phone: v.phone,
            status: v.status,
            admin_id: v.admin_id,
            admin_note: v.admin_note,
            decided_at: v.decided_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub time: SlotTime,
    pub available: bool,
    pub rule: Option<ConflictRule>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityView {
    pub property_id: PropertyId,
    pub date: NaiveDate,
    pub slots: Vec<SlotView>,
    pub vendor_count: usize,
    pub vendor_limit: usize,
    pub platform_count: usize,
    pub platform_limit: usize,
}

impl From<DayAvailability> for AvailabilityView {
    fn from(day: DayAvailability) -> Self {
        Self {
            property_id: day.property_id,
            date: day.date,
            slots: day
                .slots
                .into_iter()
                .map(|s| SlotView {
                    time: s.time,
                    available: s.available,
                    rule: s.blocked_reason,
                    reason: s.blocked_reason.map(|r| r.reason().to_string()),
                })
                .collect(),
            vendor_count: day.vendor_count,
            vendor_limit: day.vendor_limit,
            platform_count: day.platform_count,
            platform_limit: day.platform_limit,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub date: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusFilter {
    pub status: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SubmitBody {
    pub preferred_date: Option<String>,
    pub preferred_time: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RescheduleBody {
    pub preferred_date: Option<String>,
    pub preferred_time: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DecisionBody {
    pub status: String,
    pub admin_note: Option<String>,
}

// ── Errors ───────────────────────────────────────────────

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    body: ErrorResponse,
}

impl HttpError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: true,
                message: message.into(),
                rule: None,
                count: None,
                limit: None,
                retry_after_secs: None,
            },
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let retry_after = self.body.retry_after_secs;
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<EngineError> for HttpError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::InvalidInput(_) => Self::bad_request(message),
            EngineError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, message),
            EngineError::Forbidden(_) => Self::new(StatusCode::FORBIDDEN, message),
            EngineError::Conflict(c) => {
                let mut e = Self::new(StatusCode::CONFLICT, message);
                e.body.rule = Some(c.rule);
                e.body.count = c.count;
                e.body.limit = c.limit;
                e
            }
            EngineError::TooManyRequests { retry_after_secs } => {
                let mut e = Self::new(StatusCode::TOO_MANY_REQUESTS, message);
                e.body.retry_after_secs = Some(retry_after_secs);
                e
            }
            EngineError::Unavailable(_) => {
                error!(error = %message, "store unavailable");
                Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
            }
        }
    }
}

// ── Extraction helpers ───────────────────────────────────

/// The calling user, from the gateway header.
async fn actor(state: &AppState, headers: &HeaderMap) -> Result<UserRecord, HttpError> {
    let id = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HttpError::unauthorized(format!("missing {USER_HEADER} header")))?;
    state
        .engine
        .directory()
        .get_user(id)
        .await?
        .ok_or_else(|| HttpError::unauthorized(format!("unknown user {id}")))
}

fn parse_visit_id(raw: &str) -> Result<Ulid, HttpError> {
    raw.parse()
        .map_err(|_| HttpError::bad_request(format!("invalid visit request id '{raw}'")))
}

fn parse_status_filter(filter: &StatusFilter) -> Result<Option<VisitStatus>, HttpError> {
    match filter.status.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(HttpError::bad_request),
    }
}

fn views(visits: Vec<VisitRequest>) -> Json<Vec<VisitView>> {
    Json(visits.into_iter().map(VisitView::from).collect())
}

// ── Handlers ─────────────────────────────────────────────

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "visits": state.engine.visit_count(),
    }))
}

async fn handle_availability(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(property_id): Path<String>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityView>, HttpError> {
    let user = actor(&state, &headers).await?;
    let day = state
        .engine
        .availability(&property_id, &query.date, &user.id)
        .await?;
    Ok(Json(day.into()))
}

async fn handle_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(property_id): Path<String>,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<VisitView>), HttpError> {
    let user = actor(&state, &headers).await?;
    let policy = state.submit_rate;
    state
        .limiter
        .check(&format!("submit:{}", user.id), policy.max_requests, policy.window())?;
    let visit = state
        .engine
        .submit(SubmitVisit {
            property_id,
            client: user.id,
            preferred_date: body.preferred_date,
            preferred_time: body.preferred_time,
            phone: body.phone,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(visit.into())))
}

async fn handle_list_own(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<StatusFilter>,
) -> Result<Json<Vec<VisitView>>, HttpError> {
    list(&state, &headers, VisitScope::Own, &filter).await
}

async fn handle_list_all(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<StatusFilter>,
) -> Result<Json<Vec<VisitView>>, HttpError> {
    list(&state, &headers, VisitScope::All, &filter).await
}

async fn handle_list_vendor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<StatusFilter>,
) -> Result<Json<Vec<VisitView>>, HttpError> {
    list(&state, &headers, VisitScope::Vendor, &filter).await
}

async fn list(
    state: &AppState,
    headers: &HeaderMap,
    scope: VisitScope,
    filter: &StatusFilter,
) -> Result<Json<Vec<VisitView>>, HttpError> {
    let user = actor(state, headers).await?;
    let status = parse_status_filter(filter)?;
    let visits = state.engine.list_visits(&user.id, scope, status).await?;
    Ok(views(visits))
}

async fn handle_reschedule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RescheduleBody>,
) -> Result<Json<VisitView>, HttpError> {
    let user = actor(&state, &headers).await?;
    let id = parse_visit_id(&id)?;
    let (Some(date), Some(time)) = (body.preferred_date, body.preferred_time) else {
        return Err(HttpError::bad_request(
            "preferred_date and preferred_time are both required",
        ));
    };
    let policy = state.submit_rate;
    state
        .limiter
        .check(&format!("edit:{}", user.id), policy.max_requests, policy.window())?;
    let visit = state.engine.reschedule(id, &user.id, &date, &time).await?;
    Ok(Json(visit.into()))
}

async fn handle_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, HttpError> {
    let user = actor(&state, &headers).await?;
    let id = parse_visit_id(&id)?;
    state.engine.cancel(id, &user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Shared by the admin and vendor routes; the engine decides who may act.
async fn handle_decide(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<VisitView>, HttpError> {
    let user = actor(&state, &headers).await?;
    let id = parse_visit_id(&id)?;
    let visit = state
        .engine
        .decide(id, &user.id, &body.status, body.admin_note)
        .await?;
    Ok(Json(visit.into()))
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let method = req.method().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();
    metrics::histogram!(REQUEST_DURATION_SECONDS, "route" => route.clone())
        .record(started.elapsed().as_secs_f64());
    metrics::counter!(REQUESTS_TOTAL, "method" => method, "route" => route, "status" => status)
        .increment(1);
    response
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/properties/{id}/availability", get(handle_availability))
        .route("/properties/{id}/visit-requests", post(handle_submit))
        .route("/my/visit-requests", get(handle_list_own))
        .route(
            "/my/visit-requests/{id}",
            patch(handle_reschedule).delete(handle_cancel),
        )
        .route("/visit-requests", get(handle_list_all))
        .route("/visit-requests/{id}", patch(handle_decide))
        .route("/vendor/visit-requests", get(handle_list_vendor))
        .route("/vendor/visit-requests/{id}", patch(handle_decide))
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(state)
}
