//! Upstream client contract tests against a throwaway axum integrator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};

use fatigue_monitor::error::UpstreamError;
use fatigue_monitor::upstream::{AuthMode, EventQuery, UpstreamClient, UpstreamConfig};
use fatigue_monitor::Mode;

// ---

#[derive(Clone)]
struct Integrator {
    logins: Arc<AtomicUsize>,
    event_calls: Arc<AtomicUsize>,
    /// Tokens issued before this login number are rejected with 401.
    valid_from: usize,
    total_pages: u32,
    delay: Duration,
    /// Page answered with 500 instead of data.
    failing_page: Option<u64>,
}

impl Integrator {
    fn new(valid_from: usize, total_pages: u32) -> Self {
        Self {
            logins: Arc::new(AtomicUsize::new(0)),
            event_calls: Arc::new(AtomicUsize::new(0)),
            valid_from,
            total_pages,
            delay: Duration::ZERO,
            failing_page: None,
        }
    }
}

async fn login(State(s): State<Integrator>, Json(body): Json<Value>) -> Response {
    // ---
    if body["username"] != "ops" || body["password"] != "hunter2" {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }
    let n = s.logins.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "access_token": format!("tok-{n}") })).into_response()
}

async fn events(State(s): State<Integrator>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    // ---
    s.event_calls.fetch_add(1, Ordering::SeqCst);
    if !s.delay.is_zero() {
        tokio::time::sleep(s.delay).await;
    }

    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer tok-"))
        .and_then(|n| n.parse::<usize>().ok())
        .is_some_and(|n| n >= s.valid_from);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "token expired").into_response();
    }

    let page = body["page"].as_u64().unwrap_or(1);
    if s.failing_page == Some(page) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "page unavailable").into_response();
    }
    Json(json!({
        "success": true,
        "data": {
            "list": [{
                "id": format!("evt-{page}"),
                "device_id": "DSM-01",
                "alarm_time": "2025-03-26 03:00:00",
                "alarm_type": "Eyes Closed"
            }],
            "pagination": { "total_pages": s.total_pages }
        }
    }))
    .into_response()
}

async fn devices() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response()
}

async fn spawn(integrator: Integrator) -> Result<String> {
    // ---
    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/fatigue/events", post(events))
        .route("/api/devices", get(devices))
        .with_state(integrator);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

fn client(base_url: String, max_pages: u32) -> Result<UpstreamClient> {
    let cfg = UpstreamConfig {
        base_url,
        auth_mode: AuthMode::Auto,
        username: Some("ops".into()),
        password: Some("hunter2".into()),
        max_pages,
        timeout: Duration::from_secs(2),
        ..UpstreamConfig::default()
    };
    Ok(UpstreamClient::new(cfg)?)
}

fn query() -> EventQuery {
    let day = NaiveDate::from_ymd_opt(2025, 3, 26).unwrap();
    EventQuery {
        range_start: day.and_hms_opt(0, 0, 0).unwrap(),
        range_end: day.and_hms_opt(23, 59, 59).unwrap(),
        source_ids: vec!["DSM-01".into()],
    }
}

#[tokio::test]
async fn reauthenticates_once_on_401() -> Result<()> {
    // ---
    let integrator = Integrator::new(2, 1);
    let base = spawn(integrator.clone()).await?;
    let client = client(base, 50)?;

    let batch = client.fetch_batch(Mode::Live, &query(), Utc::now()).await?;

    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].origin, Mode::Live);
    assert_eq!(integrator.logins.load(Ordering::SeqCst), 2);
    assert_eq!(integrator.event_calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn second_401_propagates_as_auth_error() -> Result<()> {
    // ---
    let integrator = Integrator::new(usize::MAX, 1);
    let base = spawn(integrator.clone()).await?;
    let client = client(base, 50)?;

    let err = client
        .fetch_batch(Mode::Live, &query(), Utc::now())
        .await
        .unwrap_err();

    assert!(matches!(&err, UpstreamError::Auth(msg) if msg.contains("still unauthorized")));
    assert_eq!(integrator.logins.load(Ordering::SeqCst), 2);
    assert_eq!(integrator.event_calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn follows_pagination_to_the_last_page() -> Result<()> {
    // ---
    let integrator = Integrator::new(1, 3);
    let base = spawn(integrator.clone()).await?;
    let client = client(base, 50)?;

    let batch = client.fetch_batch(Mode::Live, &query(), Utc::now()).await?;

    let ids: Vec<&str> = batch.iter().filter_map(|e| e.payload["id"].as_str()).collect();
    assert_eq!(ids, vec!["evt-1", "evt-2", "evt-3"]);
    assert_eq!(integrator.logins.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn stops_at_the_page_cap() -> Result<()> {
    // ---
    let integrator = Integrator::new(1, 1_000);
    let base = spawn(integrator.clone()).await?;
    let client = client(base, 3)?;

    let batch = client.fetch_batch(Mode::Live, &query(), Utc::now()).await?;

    assert_eq!(batch.len(), 3);
    assert_eq!(integrator.event_calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn failure_mid_pagination_discards_the_batch() -> Result<()> {
    // ---
    let mut integrator = Integrator::new(1, 3);
    integrator.failing_page = Some(2);
    let base = spawn(integrator.clone()).await?;
    let client = client(base, 50)?;

    let err = client
        .fetch_batch(Mode::Live, &query(), Utc::now())
        .await
        .unwrap_err();

    assert!(matches!(&err, UpstreamError::Http { status: 500, .. }));
    assert_eq!(integrator.event_calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn slow_upstream_times_out() -> Result<()> {
    // ---
    let mut integrator = Integrator::new(1, 1);
    integrator.delay = Duration::from_millis(500);
    let base = spawn(integrator).await?;

    let cfg = UpstreamConfig {
        base_url: base,
        auth_mode: AuthMode::Auto,
        username: Some("ops".into()),
        password: Some("hunter2".into()),
        events_timeout: Some(Duration::from_millis(50)),
        ..UpstreamConfig::default()
    };
    let client = UpstreamClient::new(cfg)?;

    let err = client
        .fetch_batch(Mode::Live, &query(), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, UpstreamError::Timeout { endpoint: "events", timeout_ms: 50 }));
    Ok(())
}

#[tokio::test]
async fn non_2xx_maps_to_http_error_with_body() -> Result<()> {
    // ---
    let base = spawn(Integrator::new(1, 1)).await?;
    let cfg = UpstreamConfig {
        base_url: base,
        auth_mode: AuthMode::None,
        ..UpstreamConfig::default()
    };
    let client = UpstreamClient::new(cfg)?;

    let err = client.fetch_devices(Mode::Live).await.unwrap_err();
    assert!(matches!(&err, UpstreamError::Http { status: 503, body } if body == "maintenance"));
    Ok(())
}

#[tokio::test]
async fn mock_mode_never_touches_the_network() -> Result<()> {
    // ---
    let cfg = UpstreamConfig {
        base_url: "http://127.0.0.1:9".into(),
        source_ids: vec!["DSM-01".into(), "DSM-02".into(), "DSM-03".into()],
        ..UpstreamConfig::default()
    };
    let client = UpstreamClient::new(cfg)?;
    let mut query = query();
    query.source_ids.clear();

    let batch = client.fetch_batch(Mode::Mock, &query, Utc::now()).await?;
    assert_eq!(batch.len(), 3);
    assert!(batch.iter().all(|e| e.origin == Mode::Mock));

    let devices = client.fetch_devices(Mode::Mock).await?;
    assert_eq!(devices.len(), 3);
    Ok(())
}
