//! Metrics-frame rate limiters for SSE connections.
//!
//! Both limiters are serialized behind a plain mutex (actor-style: one
//! logical owner, short critical sections, no await inside). Clocks use
//! `tokio::time::Instant` so paused-time tests can drive them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Per-connection, per-UPS limiter: a `metrics_update` frame for one
/// `ups_id` may pass at most once per `interval`.
///
/// Check and commit are split: "last emission" means a frame that was
/// actually written, so a frame this limiter would pass but another gate
/// (the global cap) vetoes must not consume the per-UPS window. Callers
/// `would_allow` first and `commit` only once the frame is going out.
pub struct MetricsRateLimiter {
    interval: Duration,
    last_emit: Mutex<HashMap<String, Instant>>,
}

impl MetricsRateLimiter {
    pub fn new(interval: Duration) -> Self {
        MetricsRateLimiter {
            interval,
            last_emit: Mutex::new(HashMap::new()),
        }
    }

    /// Non-mutating check: true when at least `interval` has passed
    /// since the last committed emission for this UPS.
    pub fn would_allow(&self, ups_id: &str) -> bool {
        let last = self.last_emit.lock().expect("rate limiter mutex poisoned");
        match last.get(ups_id) {
            Some(stamp) => Instant::now().duration_since(*stamp) >= self.interval,
            None => true,
        }
    }

    /// Stamp an actually-delivered frame for this UPS.
    pub fn commit(&self, ups_id: &str) {
        self.last_emit
            .lock()
            .expect("rate limiter mutex poisoned")
            .insert(ups_id.to_string(), Instant::now());
    }
}

/// Process-wide cap across all SSE connections: at most `max` metrics
/// frames per rolling-reset window (the window restarts when the first
/// frame after expiry arrives).
pub struct GlobalMetricsLimiter {
    max: u32,
    window: Duration,
    state: Mutex<Window>,
}

struct Window {
    started: Instant,
    count: u32,
}

impl GlobalMetricsLimiter {
    /// Production shape: 50 frames per 1 s window.
    pub fn new() -> Self {
        Self::with_limits(50, Duration::from_secs(1))
    }

    pub fn with_limits(max: u32, window: Duration) -> Self {
        GlobalMetricsLimiter {
            max,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();
        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.count = 0;
        }
        if state.count < self.max {
            state.count += 1;
            true
        } else {
            false
        }
    }
}

impl Default for GlobalMetricsLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
