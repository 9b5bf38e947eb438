use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use tower::ServiceExt;
use ulid::Ulid;

use visitd::clock::ManualClock;
use visitd::config::RateLimitPolicy;
use visitd::directory::{Directory, DirectorySeed, InMemoryDirectory};
use visitd::engine::{Engine, EngineError};
use visitd::http::{build_router, AppState, AvailabilityView, ErrorResponse, VisitView};
use visitd::model::{ConflictRule, NotificationKind, PropertyRecord, UserRecord, VisitStatus};
use visitd::notify::{Dispatcher, NotifyHub};
use visitd::ratelimit::RateLimiter;

// ── Test infrastructure ──────────────────────────────────────

const SEED: &str = r#"{
    "users": [
        {"id": "1", "role": "cliente", "nome": "Joao", "phone": "+258841234567"},
        {"id": "5", "role": "cliente"},
        {"id": "2", "role": "vendedor"},
        {"id": "6", "role": "vendedor"},
        {"id": "3", "role": "admin"},
        {"id": "4", "role": "admin", "nome": "ImovelTop"}
    ],
    "properties": [
        {"id": "1", "vendedorId": "2"},
        {"id": "2", "vendedorId": "2"},
        {"id": "3", "vendedorId": "6"},
        {"id": "9", "vendedorId": "6", "deleted": true}
    ]
}"#;

struct TestApp {
    router: Router,
    hub: Arc<NotifyHub>,
}

/// Knows every seeded user but cannot reach the listing store.
struct ListingsOffline(InMemoryDirectory);

#[async_trait]
impl Directory for ListingsOffline {
    async fn get_property(&self, _: &str) -> Result<Option<PropertyRecord>, EngineError> {
        Err(EngineError::Unavailable("listing store unreachable".into()))
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, EngineError> {
        self.0.get_user(id).await
    }

    async fn list_admins(&self) -> Result<Vec<UserRecord>, EngineError> {
        self.0.list_admins().await
    }
}

fn seeded_directory() -> InMemoryDirectory {
    let seed: DirectorySeed = serde_json::from_str(SEED).unwrap();
    InMemoryDirectory::from_seed(seed)
}

fn test_app_with_policy(policy: RateLimitPolicy) -> TestApp {
    build_test_app(Arc::new(seeded_directory()), policy)
}

fn build_test_app(directory: Arc<dyn Directory>, policy: RateLimitPolicy) -> TestApp {
    let dir = std::env::temp_dir().join(format!("visitd_http_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let clock = Arc::new(ManualClock::at_date(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()));
    let hub = Arc::new(NotifyHub::new());
    let engine = Engine::new(
        dir.join("visits.wal"),
        directory,
        Dispatcher::in_process(hub.clone()),
        clock.clone(),
    )
    .unwrap();

    let router = build_router(AppState {
        engine: Arc::new(engine),
        limiter: Arc::new(RateLimiter::new(clock, 1000)),
        submit_rate: policy,
    });
    TestApp { router, hub }
}

fn test_app() -> TestApp {
    test_app_with_policy(RateLimitPolicy::default())
}

fn request(method: &str, uri: &str, user: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body.to_vec())
}

fn json<T: DeserializeOwned>(body: &[u8]) -> T {
    serde_json::from_slice(body).unwrap()
}

async fn submit(app: &TestApp, user: &str, property: &str, date: &str, time: &str) -> (StatusCode, Vec<u8>) {
    let (status, _, body) = send(
        app,
        request(
            "POST",
            &format!("/properties/{property}/visit-requests"),
            Some(user),
            Some(serde_json::json!({"preferred_date": date, "preferred_time": time})),
        ),
    )
    .await;
    (status, body)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn health_is_public() {
    let app = test_app();
    let (status, _, body) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    let v: serde_json::Value = json(&body);
    assert_eq!(v["status"], "ok");
}

#[tokio::test]
async fn missing_or_unknown_user_is_unauthorized() {
    let app = test_app();
    let (status, _, body) = send(&app, request("GET", "/my/visit-requests", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let err: ErrorResponse = json(&body);
    assert!(err.error);

    let (status, _, _) = send(&app, request("GET", "/my/visit-requests", Some("42"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submit_returns_created_request() {
    let app = test_app();
    let (status, body) = submit(&app, "1", "1", "2026-03-10", "10:00").await;
    assert_eq!(status, StatusCode::CREATED);
    let visit: VisitView = json(&body);
    assert_eq!(visit.status, VisitStatus::Pending);
    assert_eq!(visit.user_id, "1");
    assert_eq!(visit.preferred_date, NaiveDate::from_ymd_opt(2026, 3, 10));
    assert_eq!(visit.preferred_time.map(|t| t.to_string()).as_deref(), Some("10:00"));
    assert_eq!(visit.phone.as_deref(), Some("+258841234567"));

    let (status, _, body) = send(&app, request("GET", "/my/visit-requests", Some("1"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let mine: Vec<VisitView> = json(&body);
    assert_eq!(mine, vec![visit]);
}

#[tokio::test]
async fn conflict_is_409_with_rule() {
    let app = test_app();
    submit(&app, "1", "1", "2026-03-10", "10:00").await;
    let (status, body) = submit(&app, "1", "1", "2026-03-10", "14:00").await;
    assert_eq!(status, StatusCode::CONFLICT);
    let err: ErrorResponse = json(&body);
    assert_eq!(err.rule, Some(ConflictRule::ClientPropertyDay));
    assert!(err.message.contains("already booked this property today"));
}

#[tokio::test]
async fn bad_input_and_missing_property() {
    let app = test_app();
    let (status, _) = submit(&app, "1", "1", "2026-03-10", "18:00").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = submit(&app, "1", "1", "2026-03-10", "9:5").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = submit(&app, "1", "9", "2026-03-10", "10:00").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = submit(&app, "1", "77", "2026-03-10", "10:00").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn availability_reports_blocked_slots() {
    let app = test_app();
    submit(&app, "1", "1", "2026-03-10", "10:00").await;

    let (status, _, body) = send(
        &app,
        request("GET", "/properties/1/availability?date=2026-03-10", Some("5"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let day: AvailabilityView = json(&body);
    assert_eq!(day.slots.len(), 19);
    let ten = day.slots.iter().find(|s| s.time.to_string() == "10:00").unwrap();
    assert!(!ten.available);
    assert_eq!(ten.rule, Some(ConflictRule::PropertySlot));
    assert_eq!(ten.reason.as_deref(), Some("slot taken on this property"));
    assert_eq!(day.vendor_count, 1);
    assert_eq!(day.vendor_limit, 3);
    assert_eq!(day.platform_limit, 10);

    let (status, _, _) = send(
        &app,
        request("GET", "/properties/1/availability?date=2020-01-01", Some("5"), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_and_vendor_decisions() {
    let app = test_app();
    let mut rx = app.hub.subscribe("1");
    let (_, body) = submit(&app, "1", "1", "2026-03-10", "10:00").await;
    let visit: VisitView = json(&body);

    // vendor 6 does not own property 1
    let (status, _, _) = send(
        &app,
        request(
            "PATCH",
            &format!("/vendor/visit-requests/{}", visit.id),
            Some("6"),
            Some(serde_json::json!({"status": "approved"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, body) = send(
        &app,
        request(
            "PATCH",
            &format!("/visit-requests/{}", visit.id),
            Some("3"),
            Some(serde_json::json!({"status": "approved", "admin_note": "see you"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let decided: VisitView = json(&body);
    assert_eq!(decided.status, VisitStatus::Approved);
    assert_eq!(decided.admin_id.as_deref(), Some("3"));

    let note = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notification timed out")
        .unwrap();
    assert_eq!(note.kind, NotificationKind::VisitApproved);
    assert!(note.title.contains("approved"));

    let (status, _, _) = send(
        &app,
        request(
            "PATCH",
            &format!("/vendor/visit-requests/{}", visit.id),
            Some("2"),
            Some(serde_json::json!({"status": "pending"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn listing_scopes() {
    let app = test_app();
    submit(&app, "1", "1", "2026-03-10", "10:00").await;
    submit(&app, "5", "3", "2026-03-10", "11:00").await;

    let (status, _, body) = send(&app, request("GET", "/vendor/visit-requests", Some("2"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let vendor: Vec<VisitView> = json(&body);
    assert_eq!(vendor.len(), 1);
    assert_eq!(vendor[0].property_id, "1");

    let (status, _, body) = send(&app, request("GET", "/visit-requests?status=pending", Some("4"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let all: Vec<VisitView> = json(&body);
    assert_eq!(all.len(), 2);

    let (status, _, _) = send(&app, request("GET", "/visit-requests", Some("1"), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _, _) = send(&app, request("GET", "/visit-requests?status=lost", Some("4"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn client_edit_and_cancel() {
    let app = test_app();
    let (_, body) = submit(&app, "1", "1", "2026-03-10", "10:00").await;
    let visit: VisitView = json(&body);
    let uri = format!("/my/visit-requests/{}", visit.id);

    let (status, _, _) = send(
        &app,
        request("PATCH", &uri, Some("1"), Some(serde_json::json!({"preferred_date": "2026-03-10"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(
        &app,
        request(
            "PATCH",
            &uri,
            Some("1"),
            Some(serde_json::json!({"preferred_date": "2026-03-11", "preferred_time": "09:30"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let moved: VisitView = json(&body);
    assert_eq!(moved.preferred_date, NaiveDate::from_ymd_opt(2026, 3, 11));

    let (status, _, _) = send(&app, request("DELETE", &uri, Some("5"), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _, _) = send(&app, request("DELETE", &uri, Some("1"), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = send(&app, request("DELETE", &uri, Some("1"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = send(&app, request("DELETE", "/my/visit-requests/not-an-id", Some("1"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn submissions_are_rate_limited() {
    let app = test_app_with_policy(RateLimitPolicy {
        max_requests: 3,
        window_secs: 60,
    });
    for day in 10..13 {
        let (status, _) = submit(&app, "1", "1", &format!("2026-03-{day}"), "10:00").await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (status, headers, body) = send(
        &app,
        request(
            "POST",
            "/properties/1/visit-requests",
            Some("1"),
            Some(serde_json::json!({"preferred_date": "2026-03-20", "preferred_time": "10:00"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers.get("retry-after").unwrap(), "60");
    let err: ErrorResponse = json(&body);
    assert_eq!(err.retry_after_secs, Some(60));

    // other users have their own budget
    let (status, _) = submit(&app, "5", "1", "2026-03-20", "11:00").await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn store_failure_is_503_and_books_nothing() {
    let app = build_test_app(
        Arc::new(ListingsOffline(seeded_directory())),
        RateLimitPolicy::default(),
    );
    let (status, body) = submit(&app, "1", "1", "2026-03-10", "10:00").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let err: ErrorResponse = json(&body);
    assert!(err.error);
    assert!(err.message.contains("listing store unreachable"));
    assert!(app.hub.inbox("3").is_empty());

    let (status, _, body) = send(&app, request("GET", "/my/visit-requests", Some("1"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let mine: Vec<VisitView> = json(&body);
    assert!(mine.is_empty());
}
