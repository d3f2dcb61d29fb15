//! Hand-rendered Prometheus text exposition for /metrics.
//!
//! Deliberately small: request/frame counters and the SSE client gauge.
//! Poll-level numbers live in the ups table itself and are not duplicated
//! here.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    started: Instant,
    pub http_requests_total: AtomicU64,
    pub sse_clients: AtomicI64,
    pub sse_frames_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            started: Instant::now(),
            http_requests_total: AtomicU64::new(0),
            sse_clients: AtomicI64::new(0),
            sse_frames_total: AtomicU64::new(0),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP volteec_uptime_seconds Process uptime.\n");
        out.push_str("# TYPE volteec_uptime_seconds gauge\n");
        out.push_str(&format!(
            "volteec_uptime_seconds {}\n",
            self.started.elapsed().as_secs()
        ));
        out.push_str("# HELP volteec_http_requests_total HTTP requests handled.\n");
        out.push_str("# TYPE volteec_http_requests_total counter\n");
        out.push_str(&format!(
            "volteec_http_requests_total {}\n",
            self.http_requests_total.load(Ordering::Relaxed)
        ));
        out.push_str("# HELP volteec_sse_clients Currently connected SSE clients.\n");
        out.push_str("# TYPE volteec_sse_clients gauge\n");
        out.push_str(&format!(
            "volteec_sse_clients {}\n",
            self.sse_clients.load(Ordering::Relaxed)
        ));
        out.push_str("# HELP volteec_sse_frames_total SSE frames written.\n");
        out.push_str("# TYPE volteec_sse_frames_total counter\n");
        out.push_str(&format!(
            "volteec_sse_frames_total {}\n",
            self.sse_frames_total.load(Ordering::Relaxed)
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
