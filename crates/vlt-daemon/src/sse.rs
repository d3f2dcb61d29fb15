//! Server-Sent Events endpoint: GET /v1/events?rate=1s|3s|5s.
//!
//! Per connection: subscribe to the bus (limit 100 process-wide), replay
//! a `metrics_update` snapshot frame per UPS row, then stream live events
//! merged with a 10 s heartbeat. `status_change` frames always go out;
//! `metrics_update` frames pass only when both the per-connection per-UPS
//! limiter and the process-wide cap allow.
//!
//! Dead clients are detected lazily: a failed body write drops the
//! stream, the bus subscription's drop guard unsubscribes, and the
//! heartbeat stops with the stream.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::header::{HeaderValue, CACHE_CONTROL, CONNECTION};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::IntervalStream;
use tracing::{error, warn};
use vlt_bus::MetricsRateLimiter;
use vlt_schemas::{EventKind, HeartbeatPayload, UpsRow, UpsStatusPayload};

use crate::metrics::Metrics;
use crate::state::AppState;

pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_RATE: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    rate: Option<String>,
}

/// `"1s"`, `"3s"`, `"5s"` map to their duration; anything else (or no
/// parameter) falls back to 3 s.
pub fn parse_rate(raw: Option<&str>) -> Duration {
    match raw {
        Some("1s") => Duration::from_secs(1),
        Some("5s") => Duration::from_secs(5),
        _ => DEFAULT_RATE,
    }
}

pub async fn events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let interval = parse_rate(query.rate.as_deref());

    let subscription = match state.bus.subscribe().await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(error = %err, "sse connection refused");
            return sse_response(stream::empty().boxed());
        }
    };

    // Snapshot phase: one metrics_update frame per persisted row. A
    // failed query tears the connection down before any frame is sent;
    // dropping the subscription unsubscribes.
    let rows = match state.ups_reader.fetch_all().await {
        Ok(rows) => rows,
        Err(err) => {
            error!(error = %err, "sse snapshot query failed");
            return sse_response(stream::empty().boxed());
        }
    };
    let snapshot: Vec<Event> = rows
        .iter()
        .map(|row| ups_frame(EventKind::MetricsUpdate, row))
        .collect();

    let connection_limiter = MetricsRateLimiter::new(interval);
    let global_limiter = Arc::clone(&state.global_limiter);
    let live = subscription.filter_map(move |event| {
        let frame = match event.kind {
            EventKind::StatusChange => Some(ups_frame(event.kind, &event.ups)),
            EventKind::MetricsUpdate => {
                let ups_id = &event.ups.snapshot.ups_id;
                // Peek the per-UPS window first, then let the global cap
                // (check-and-commit, the final gate) decide; the per-UPS
                // stamp lands only for a frame that is actually emitted,
                // so a globally vetoed frame cannot consume the window.
                let pass = connection_limiter.would_allow(ups_id) && global_limiter.allow();
                if pass {
                    connection_limiter.commit(ups_id);
                }
                pass.then(|| ups_frame(event.kind, &event.ups))
            }
        };
        futures_util::future::ready(frame)
    });

    let heartbeats = IntervalStream::new(tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_PERIOD,
        HEARTBEAT_PERIOD,
    ))
    .map(|_| heartbeat_frame());

    let frames = stream::iter(snapshot)
        .chain(stream::select(live, heartbeats))
        .map(Ok::<Event, Infallible>);

    let counted = Counted {
        inner: frames.boxed(),
        _gauge: ClientGauge::register(Arc::clone(&state.metrics)),
        metrics: Arc::clone(&state.metrics),
    };

    sse_response(counted)
}

fn ups_frame(kind: EventKind, row: &UpsRow) -> Event {
    let payload = UpsStatusPayload::from_row(row, Utc::now());
    let data = serde_json::to_string(&payload).expect("payload serialization must not fail");
    Event::default().event(kind.as_str()).data(data)
}

fn heartbeat_frame() -> Event {
    let payload = HeartbeatPayload::at(Utc::now());
    let data = serde_json::to_string(&payload).expect("payload serialization must not fail");
    Event::default().event("heartbeat").data(data)
}

fn sse_response(
    stream: impl Stream<Item = Result<Event, Infallible>> + Send + 'static,
) -> Response {
    let mut response = Sse::new(stream).into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

// ---------------------------------------------------------------------------
// Connection accounting
// ---------------------------------------------------------------------------

/// Holds the sse_clients gauge up for the lifetime of one stream and
/// counts frames as they pass through.
struct Counted {
    inner: BoxStream<'static, Result<Event, Infallible>>,
    _gauge: ClientGauge,
    metrics: Arc<Metrics>,
}

impl Stream for Counted {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.poll_next_unpin(cx);
        if matches!(polled, Poll::Ready(Some(_))) {
            this.metrics.sse_frames_total.fetch_add(1, Ordering::Relaxed);
        }
        polled
    }
}

struct ClientGauge(Arc<Metrics>);

impl ClientGauge {
    fn register(metrics: Arc<Metrics>) -> Self {
        metrics.sse_clients.fetch_add(1, Ordering::Relaxed);
        ClientGauge(metrics)
    }
}

impl Drop for ClientGauge {
    fn drop(&mut self) {
        self.0.sse_clients.fetch_sub(1, Ordering::Relaxed);
    }
}
