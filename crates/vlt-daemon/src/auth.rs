//! Bearer-token auth for /v1/*.
//!
//! The presented token is hashed and compared against the stored hash of
//! `API_TOKEN` with a constant-time equality, so neither token length nor
//! matching-prefix length leaks through timing.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header::AUTHORIZATION, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use subtle::ConstantTimeEq;

use crate::api_types::ErrorResponse;
use crate::state::{token_fingerprint, AppState};

const MISSING_HEADER: &str = "Missing or invalid Authorization header";
const BAD_TOKEN: &str = "Invalid authentication token";

pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    // Degraded mode never registers /v1 routes, but fail closed anyway.
    let Some(expected) = state.api_token_hash else {
        return unauthorized(MISSING_HEADER);
    };

    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let Some(token) = header.and_then(|h| h.strip_prefix("Bearer ")) else {
        return unauthorized(MISSING_HEADER);
    };

    let presented = token_fingerprint(token);
    if bool::from(presented.as_slice().ct_eq(expected.as_slice())) {
        next.run(request).await
    } else {
        unauthorized(BAD_TOKEN)
    }
}

fn unauthorized(reason: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(reason))).into_response()
}
