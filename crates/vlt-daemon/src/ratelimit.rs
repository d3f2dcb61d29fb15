//! Fixed-window per-IP rate limiting for /v1/*.
//!
//! In-memory and single-instance by design: 60 requests per rolling
//! 60-second fixed window per remote IP, everything beyond answers 429.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::time::Instant;

use crate::api_types::ErrorResponse;
use crate::state::AppState;

pub const WINDOW: Duration = Duration::from_secs(60);
pub const MAX_REQUESTS: u32 = 60;

pub struct IpRateLimiter {
    max: u32,
    window: Duration,
    windows: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl IpRateLimiter {
    pub fn new() -> Self {
        Self::with_limits(MAX_REQUESTS, WINDOW)
    }

    pub fn with_limits(max: u32, window: Duration) -> Self {
        IpRateLimiter {
            max,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();
        let entry = windows.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 < self.max {
            entry.1 += 1;
            true
        } else {
            false
        }
    }
}

impl Default for IpRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn limit_by_ip(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    // ConnectInfo is absent when the router is driven in-process (tests);
    // those requests share one bucket.
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    if state.ip_limiter.check(ip) {
        next.run(request).await
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse::new("Rate limit exceeded")),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fixed_window_counts_and_resets() {
        let limiter = IpRateLimiter::with_limits(3, Duration::from_secs(60));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip), "fourth request in the window");

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.check(ip), "new window");
    }

    #[tokio::test(start_paused = true)]
    async fn ips_are_tracked_independently() {
        let limiter = IpRateLimiter::with_limits(1, Duration::from_secs(60));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b), "other IP has its own window");
    }
}
