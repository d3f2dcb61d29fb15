//! Axum router and all HTTP handlers for vlt-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. Handlers are `pub(crate)` so the scenario
//! tests in `tests/` can compose the router directly.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;
use vlt_relay::{generate_pair_code, token_hash, RelayEventType, UpsEvent};
use vlt_schemas::{Environment, UpsStatusPayload};

use crate::api_types::{
    ErrorResponse, OkResponse, PairResponse, RegisterDeviceRequest, ServerStatusResponse,
    SimulatePushRequest, UnregisterDeviceRequest,
};
use crate::state::AppState;
use crate::{auth, ratelimit, request_id, sse};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// In degraded mode (no API_TOKEN) only the public routes exist; /v1 is
/// not registered at all. TraceLayer is **not** applied here; `main.rs`
/// attaches it so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> axum::Router {
    let mut router = axum::Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics));

    if !state.degraded() {
        let mut v1 = axum::Router::new()
            .route("/ups", get(list_ups))
            .route("/ups/:ups_id/status", get(ups_status))
            .route("/register-device", post(register_device))
            .route("/unregister-device", post(unregister_device))
            .route("/relay/pair", post(relay_pair))
            .route("/events", get(sse::events))
            .route("/status", get(server_status));
        if !state.production {
            v1 = v1.route("/status/simulate-push", post(simulate_push));
        }
        let v1 = v1
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                auth::require_bearer,
            ))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                ratelimit::limit_by_ip,
            ));
        router = router.nest("/v1", v1);
    }

    router
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            request_id::stamp_request_id,
        ))
        .with_state(state)
}

fn internal_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("Internal server error")),
    )
        .into_response()
}

fn bad_request(reason: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(reason))).into_response()
}

// ---------------------------------------------------------------------------
// Public routes
// ---------------------------------------------------------------------------

pub(crate) async fn health() -> &'static str {
    "ok"
}

pub(crate) async fn ready(State(state): State<Arc<AppState>>) -> Response {
    if state.degraded() {
        return (StatusCode::SERVICE_UNAVAILABLE, "not_ready").into_response();
    }
    match vlt_db::status(&state.db).await {
        Ok(status) if status.ok && status.has_ups_table => {
            (StatusCode::OK, "ready").into_response()
        }
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not_ready").into_response(),
    }
}

pub(crate) async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        state.metrics.render(),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/ups and /v1/ups/:ups_id/status
// ---------------------------------------------------------------------------

pub(crate) async fn list_ups(State(state): State<Arc<AppState>>) -> Response {
    match state.ups_reader.fetch_all().await {
        Ok(rows) => {
            let now = Utc::now();
            let payloads: Vec<UpsStatusPayload> = rows
                .iter()
                .map(|row| UpsStatusPayload::from_row(row, now))
                .collect();
            Json(payloads).into_response()
        }
        Err(err) => internal_error(err),
    }
}

pub(crate) async fn ups_status(
    State(state): State<Arc<AppState>>,
    Path(ups_id): Path<String>,
) -> Response {
    let ups_id = ups_id.to_lowercase();
    match state.ups_reader.fetch_by_id(&ups_id).await {
        Ok(Some(row)) => Json(UpsStatusPayload::from_row(&row, Utc::now())).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Unknown UPS")),
        )
            .into_response(),
        Err(err) => internal_error(err),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/register-device and /v1/unregister-device
// ---------------------------------------------------------------------------

fn parse_environment(raw: Option<&str>) -> Result<Environment, Response> {
    match raw {
        None | Some("") => Ok(Environment::Sandbox),
        Some(value) => {
            Environment::parse(value).ok_or_else(|| bad_request("Unknown environment"))
        }
    }
}

pub(crate) async fn register_device(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterDeviceRequest>,
) -> Response {
    if let Some(version) = body.api_version.as_deref() {
        if !version.is_empty() && version != "1.0" && version != "1.1" {
            return bad_request("Unsupported apiVersion");
        }
    }
    let ups_id = body.ups_id.trim().to_lowercase();
    if ups_id.is_empty() {
        return bad_request("upsId must not be empty");
    }
    if body.device_token.is_empty() {
        return bad_request("deviceToken must not be empty");
    }
    let environment = match parse_environment(body.environment.as_deref()) {
        Ok(environment) => environment,
        Err(response) => return response,
    };

    let ups_alias = body
        .ups_alias
        .as_deref()
        .map(str::trim)
        .filter(|alias| !alias.is_empty())
        .map(str::to_string);

    let registration = vlt_db::NewDeviceRegistration {
        ups_id,
        ups_alias,
        device_token_ciphertext: state.cipher.encrypt(&body.device_token),
        token_hash: token_hash(&body.device_token),
        installation_id: body.installation_id,
        server_id: state.relay.as_ref().map(|relay| relay.server_id()),
        ups_hidden: body.ups_hidden.unwrap_or(false),
        environment,
    };

    match vlt_db::register_device(&state.db, &registration).await {
        Ok(vlt_db::RegisterOutcome::Created) => {
            info!(ups = %registration.ups_id, "device registered");
            (StatusCode::CREATED, Json(OkResponse { ok: true })).into_response()
        }
        Ok(vlt_db::RegisterOutcome::Updated) => {
            (StatusCode::OK, Json(OkResponse { ok: true })).into_response()
        }
        Err(err) => internal_error(err),
    }
}

pub(crate) async fn unregister_device(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UnregisterDeviceRequest>,
) -> Response {
    let environment = match parse_environment(body.environment.as_deref()) {
        Ok(environment) => environment,
        Err(response) => return response,
    };
    let ups_id = body.ups_id.trim().to_lowercase();

    match vlt_db::unregister_device(&state.db, &token_hash(&body.device_token), &ups_id, environment)
        .await
    {
        Ok(removed) => {
            if removed > 0 {
                info!(ups = %ups_id, "device unregistered");
            }
            (StatusCode::OK, Json(OkResponse { ok: true })).into_response()
        }
        Err(err) => internal_error(err),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/relay/pair
// ---------------------------------------------------------------------------

pub(crate) async fn relay_pair(State(state): State<Arc<AppState>>) -> Response {
    let Some(relay) = &state.relay else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("Relay not configured")),
        )
            .into_response();
    };

    let pair_code = generate_pair_code();
    match relay
        .create_pair_code(&pair_code, Utc::now().timestamp())
        .await
    {
        Ok(()) => Json(PairResponse {
            api_version: "1.0",
            relay_url: relay.relay_url().to_string(),
            pair_code,
            server_id: relay.server_id(),
        })
        .into_response(),
        Err(err) => {
            warn!(error = %err, "relay pairing failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::new("Relay pairing failed")),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /v1/status and POST /v1/status/simulate-push
// ---------------------------------------------------------------------------

pub(crate) async fn server_status(State(state): State<Arc<AppState>>) -> Response {
    let compatibility = *state.compatibility.read().await;
    Json(ServerStatusResponse {
        version: state.build.version,
        protocol_version: state.build.protocol_version,
        compatibility: compatibility.as_str(),
    })
    .into_response()
}

/// Dev/staging helper: push a synthetic event through the Relay so the
/// app's notification path can be exercised end to end. Not registered
/// when ENVIRONMENT=production.
pub(crate) async fn simulate_push(
    State(state): State<Arc<AppState>>,
    body: Option<Json<SimulatePushRequest>>,
) -> Response {
    let Some(relay) = &state.relay else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("Relay not configured")),
        )
            .into_response();
    };

    let body = body.map(|Json(body)| body).unwrap_or_default();
    let event = UpsEvent {
        event_type: RelayEventType::TestPush,
        status: body.status.or_else(|| Some("online".to_string())),
        ups_id: body.ups_id.unwrap_or_default().to_lowercase(),
        environment: relay.environment(),
        timestamp: Utc::now().timestamp(),
        battery_level: None,
        installation_id: None,
    };

    let relay = Arc::clone(relay);
    let request_id = Uuid::new_v4();
    tokio::spawn(async move {
        if let Err(err) = relay.send_event(&event).await {
            warn!(error = %err, push = %request_id, "simulated push dropped");
        }
    });

    (StatusCode::ACCEPTED, Json(OkResponse { ok: true })).into_response()
}
