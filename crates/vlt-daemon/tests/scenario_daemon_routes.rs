//! In-process scenario tests for vlt-daemon HTTP endpoints.
//!
//! These tests drive the Axum router via `tower::ServiceExt::oneshot` —
//! no TCP socket, no Postgres. DB-free handlers are exercised directly;
//! snapshot reads go through an in-memory `UpsReader`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{Request, StatusCode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use http_body_util::BodyExt;
use httpmock::prelude::*;
use tower::ServiceExt; // oneshot
use uuid::Uuid;
use vlt_bus::EventBus;
use vlt_config::RelaySettings;
use vlt_daemon::state::AppState;
use vlt_daemon::storage::UpsReader;
use vlt_daemon::routes;
use vlt_relay::{DeviceTokenCipher, RelayClient, RelayConfig, PAIR_CODE_ALPHABET};
use vlt_schemas::{DataSource, Environment, UpsRow, UpsSnapshot, UpsStatus};

const TOKEN: &str = "test-api-token";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lazy_pool() -> sqlx::PgPool {
    // Never actually connects: handlers under test either skip the DB or
    // go through the injected UpsReader.
    let options = sqlx::postgres::PgConnectOptions::new()
        .host("127.0.0.1")
        .port(1)
        .username("nobody")
        .database("nothing");
    sqlx::postgres::PgPoolOptions::new().connect_lazy_with(options)
}

fn cipher() -> DeviceTokenCipher {
    DeviceTokenCipher::from_base64_key(&BASE64.encode([0u8; 32])).unwrap()
}

fn make_state(api_token: Option<&str>) -> AppState {
    AppState::new(
        lazy_pool(),
        Arc::new(EventBus::new()),
        None,
        cipher(),
        api_token,
        false,
    )
}

fn relay_client(server: &MockServer) -> Arc<RelayClient> {
    let settings = RelaySettings {
        base_url: server.base_url(),
        tenant_id: Uuid::new_v4(),
        secret: "relay-secret".to_string(),
        server_id: Uuid::new_v4(),
        environment: Environment::Sandbox,
    };
    Arc::new(RelayClient::new(RelayConfig::from_settings(&settings).unwrap()).unwrap())
}

struct MemoryReader(Vec<UpsRow>);

#[async_trait]
impl UpsReader for MemoryReader {
    async fn fetch_all(&self) -> anyhow::Result<Vec<UpsRow>> {
        Ok(self.0.clone())
    }

    async fn fetch_by_id(&self, ups_id: &str) -> anyhow::Result<Option<UpsRow>> {
        Ok(self.0.iter().find(|r| r.snapshot.ups_id == ups_id).cloned())
    }
}

fn row(ups_id: &str, status: UpsStatus) -> UpsRow {
    UpsRow {
        snapshot: UpsSnapshot {
            ups_id: ups_id.to_string(),
            status,
            ups_status_raw: Some("OL".to_string()),
            battery_percent: Some(87),
            ..Default::default()
        },
        data_source: DataSource::Nut,
        consecutive_failures: 0,
        created_at: Utc::now(),
        updated_at: None,
    }
}

fn get(path: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn authed_get(path: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("Authorization", format!("Bearer {TOKEN}"))
        .body(axum::body::Body::empty())
        .unwrap()
}

fn authed_post_json(path: &str, body: serde_json::Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("Authorization", format!("Bearer {TOKEN}"))
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

async fn call(
    router: axum::Router,
    req: Request<axum::body::Body>,
) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

// ---------------------------------------------------------------------------
// Public routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_ok_text() {
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let (status, body) = call(router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn ready_is_503_in_degraded_mode() {
    let router = routes::build_router(Arc::new(make_state(None)));
    let (status, body) = call(router, get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(&body[..], b"not_ready");
}

#[tokio::test]
async fn metrics_returns_prometheus_text() {
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let (status, body) = call(router, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("# TYPE volteec_http_requests_total counter"));
    assert!(text.contains("volteec_sse_clients 0"));
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let (status, _) = call(router, get("/v1/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_authorization_is_401_with_reason() {
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let (status, body) = call(router, get("/v1/status")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let json = parse_json(body);
    assert_eq!(json["error"], true);
    assert_eq!(json["reason"], "Missing or invalid Authorization header");
}

#[tokio::test]
async fn non_bearer_scheme_is_401_with_header_reason() {
    let state = Arc::new(make_state(Some(TOKEN)));
    let req = Request::builder()
        .method("GET")
        .uri("/v1/status")
        .header("Authorization", "Basic dXNlcjpwdw==")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, body) = call(routes::build_router(state), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(parse_json(body)["reason"], "Missing or invalid Authorization header");
}

#[tokio::test]
async fn wrong_token_is_401_regardless_of_length() {
    let state = Arc::new(make_state(Some(TOKEN)));

    for wrong in ["x", &"x".repeat(10_000)] {
        let req = Request::builder()
            .method("GET")
            .uri("/v1/status")
            .header("Authorization", format!("Bearer {wrong}"))
            .body(axum::body::Body::empty())
            .unwrap();
        let (status, body) = call(routes::build_router(Arc::clone(&state)), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(parse_json(body)["reason"], "Invalid authentication token");
    }
}

#[tokio::test]
async fn valid_token_reaches_status_handler() {
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let (status, body) = call(router, authed_get("/v1/status")).await;
    assert_eq!(status, StatusCode::OK);
    let json = parse_json(body);
    assert_eq!(json["protocolVersion"], "1.1");
    assert_eq!(json["compatibility"], "supported");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn degraded_mode_does_not_register_v1_routes() {
    let router = routes::build_router(Arc::new(make_state(None)));
    let (status, _) = call(router, authed_get("/v1/status")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Request-ID echo
// ---------------------------------------------------------------------------

#[tokio::test]
async fn request_id_is_echoed_when_present() {
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .header("X-Request-ID", "req-42")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(
        resp.headers().get("x-request-id").unwrap().to_str().unwrap(),
        "req-42"
    );
}

#[tokio::test]
async fn request_id_is_generated_when_absent() {
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let resp = router.oneshot(get("/health")).await.unwrap();
    let id = resp.headers().get("x-request-id").unwrap().to_str().unwrap();
    assert!(id.parse::<Uuid>().is_ok(), "generated id is a uuid: {id}");
}

// ---------------------------------------------------------------------------
// Rate limit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sixty_first_request_in_window_is_429() {
    let state = Arc::new(make_state(Some(TOKEN)));

    for _ in 0..60 {
        let (status, _) =
            call(routes::build_router(Arc::clone(&state)), authed_get("/v1/status")).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) =
        call(routes::build_router(Arc::clone(&state)), authed_get("/v1/status")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(parse_json(body)["error"], true);
}

// ---------------------------------------------------------------------------
// Snapshot reads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_ups_returns_camel_case_payloads() {
    let state = make_state(Some(TOKEN)).with_ups_reader(Arc::new(MemoryReader(vec![
        row("ups1", UpsStatus::Online),
        row("ups2", UpsStatus::OnBattery),
    ])));
    let (status, body) = call(routes::build_router(Arc::new(state)), authed_get("/v1/ups")).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    let list = json.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["upsId"], "ups1");
    assert_eq!(list[0]["schemaVersion"], "1.0");
    assert_eq!(list[0]["batteryPercent"], 87);
    assert_eq!(list[0]["dataSource"], "nut");
    assert_eq!(list[1]["status"], "on_battery");
    assert!(list[0]["updatedAt"].is_string());
}

#[tokio::test]
async fn ups_status_lowercases_the_path_id() {
    let state = make_state(Some(TOKEN))
        .with_ups_reader(Arc::new(MemoryReader(vec![row("ups1", UpsStatus::Online)])));
    let (status, body) = call(
        routes::build_router(Arc::new(state)),
        authed_get("/v1/ups/UPS1/status"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["upsId"], "ups1");
}

#[tokio::test]
async fn unknown_ups_is_404_with_error_body() {
    let state = make_state(Some(TOKEN)).with_ups_reader(Arc::new(MemoryReader(vec![])));
    let (status, body) = call(
        routes::build_router(Arc::new(state)),
        authed_get("/v1/ups/ghost/status"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let json = parse_json(body);
    assert_eq!(json["error"], true);
    assert_eq!(json["reason"], "Unknown UPS");
}

// ---------------------------------------------------------------------------
// Device registration validation (pre-DB)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn register_rejects_unsupported_api_version() {
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let (status, body) = call(
        router,
        authed_post_json(
            "/v1/register-device",
            serde_json::json!({
                "apiVersion": "2.0",
                "upsId": "ups1",
                "deviceToken": "tok"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(body)["reason"], "Unsupported apiVersion");
}

#[tokio::test]
async fn register_accepts_empty_api_version_field_shape() {
    // Empty string is tolerated (treated as absent) — it must not 400 on
    // the version check; with no DB behind the lazy pool the request then
    // fails as a 500, which is good enough to prove the gate passed.
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let (status, _) = call(
        router,
        authed_post_json(
            "/v1/register-device",
            serde_json::json!({
                "apiVersion": "",
                "upsId": "ups1",
                "deviceToken": "tok"
            }),
        ),
    )
    .await;
    assert_ne!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn register_rejects_blank_ups_id_and_token() {
    let state = Arc::new(make_state(Some(TOKEN)));

    let (status, body) = call(
        routes::build_router(Arc::clone(&state)),
        authed_post_json(
            "/v1/register-device",
            serde_json::json!({"upsId": "  ", "deviceToken": "tok"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(body)["reason"], "upsId must not be empty");

    let (status, body) = call(
        routes::build_router(Arc::clone(&state)),
        authed_post_json(
            "/v1/register-device",
            serde_json::json!({"upsId": "ups1", "deviceToken": ""}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(body)["reason"], "deviceToken must not be empty");
}

#[tokio::test]
async fn register_rejects_unknown_environment() {
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let (status, body) = call(
        router,
        authed_post_json(
            "/v1/register-device",
            serde_json::json!({
                "upsId": "ups1",
                "deviceToken": "tok",
                "environment": "staging"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(parse_json(body)["reason"], "Unknown environment");
}

// ---------------------------------------------------------------------------
// Relay pairing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pair_without_relay_is_503() {
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let (status, body) = call(
        router,
        authed_post_json("/v1/relay/pair", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(parse_json(body)["reason"], "Relay not configured");
}

#[tokio::test]
async fn pair_returns_code_url_and_server_id() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/pair");
            then.status(200);
        })
        .await;

    let relay = relay_client(&server);
    let server_id = relay.server_id();
    let state = AppState::new(
        lazy_pool(),
        Arc::new(EventBus::new()),
        Some(relay),
        cipher(),
        Some(TOKEN),
        false,
    );

    let (status, body) = call(
        routes::build_router(Arc::new(state)),
        authed_post_json("/v1/relay/pair", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["apiVersion"], "1.0");
    assert_eq!(json["relayUrl"], server.base_url().trim_end_matches('/'));
    assert_eq!(json["serverId"], server_id.to_string());
    let code = json["pairCode"].as_str().unwrap();
    assert_eq!(code.len(), 8);
    assert!(code.bytes().all(|b| PAIR_CODE_ALPHABET.contains(&b)));
    mock.assert_async().await;
}

#[tokio::test]
async fn pair_surfaces_relay_failure_as_502() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/pair");
            then.status(500);
        })
        .await;

    let state = AppState::new(
        lazy_pool(),
        Arc::new(EventBus::new()),
        Some(relay_client(&server)),
        cipher(),
        Some(TOKEN),
        false,
    );

    let (status, body) = call(
        routes::build_router(Arc::new(state)),
        authed_post_json("/v1/relay/pair", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(parse_json(body)["reason"], "Relay pairing failed");
}

// ---------------------------------------------------------------------------
// simulate-push gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn simulate_push_is_absent_in_production() {
    let state = AppState::new(
        lazy_pool(),
        Arc::new(EventBus::new()),
        None,
        cipher(),
        Some(TOKEN),
        true, // production
    );
    let (status, _) = call(
        routes::build_router(Arc::new(state)),
        authed_post_json("/v1/status/simulate-push", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn simulate_push_without_relay_is_503() {
    let router = routes::build_router(Arc::new(make_state(Some(TOKEN))));
    let (status, _) = call(
        router,
        authed_post_json("/v1/status/simulate-push", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn simulate_push_fires_relay_event() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/event").matches(|req| {
                let body = req.body.clone().unwrap_or_default();
                let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) else {
                    return false;
                };
                json["eventType"] == "test_push"
            });
            then.status(200);
        })
        .await;

    let state = AppState::new(
        lazy_pool(),
        Arc::new(EventBus::new()),
        Some(relay_client(&server)),
        cipher(),
        Some(TOKEN),
        false,
    );

    let (status, _) = call(
        routes::build_router(Arc::new(state)),
        authed_post_json(
            "/v1/status/simulate-push",
            serde_json::json!({"upsId": "UPS1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // The push is spawned; give it a moment to land.
    for _ in 0..50 {
        if mock.hits_async().await > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(mock.hits_async().await, 1);
}
