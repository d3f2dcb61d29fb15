//! The polling loop: fetch NUT variables, persist snapshots, detect
//! status transitions, publish bus events, and fan out Relay pushes.
//!
//! One poller task per process. It is the single writer of the UPS table
//! (through [`SnapshotStore`]) and of its in-memory `last_status` map,
//! which takes precedence over the DB-derived previous status because
//! the row is rewritten before the comparison could read it.
//!
//! Relay calls are spawned, never awaited: a slow or dead Relay cannot
//! stall a poll cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use vlt_bus::EventBus;
use vlt_nut::{map_snapshot, NutError, NutFetcher};
use vlt_relay::{RelayClient, RelayEventType, UpsEvent};
use vlt_schemas::{BusEvent, Environment, EventKind, FailureOutcome, UpsRow, UpsSnapshot, UpsStatus};

/// Fetch attempts per UPS per cycle; delay before attempt N is
/// `RETRY_DELAYS[N]` seconds.
pub const FETCH_ATTEMPTS: usize = 3;
const RETRY_DELAYS: [u64; FETCH_ATTEMPTS] = [0, 1, 2];

/// Relay heartbeats are throttled to one per this interval, attempted
/// after each full list pass.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// One fetch attempt against the NUT server. Implementations must use a
/// fresh connection per call.
#[async_trait]
pub trait VariableFetcher: Send + Sync {
    async fn fetch(&self, ups_name: &str) -> Result<HashMap<String, String>, NutError>;
}

#[async_trait]
impl VariableFetcher for NutFetcher {
    async fn fetch(&self, ups_name: &str) -> Result<HashMap<String, String>, NutError> {
        self.fetch_once(ups_name).await
    }
}

/// Snapshot persistence as the poller sees it.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn upsert(&self, snapshot: &UpsSnapshot)
        -> anyhow::Result<(UpsRow, Option<UpsStatus>)>;
    async fn register_failure(&self, ups_id: &str) -> anyhow::Result<Option<FailureOutcome>>;
}

/// The Postgres-backed store used in production.
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        PgSnapshotStore { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn upsert(
        &self,
        snapshot: &UpsSnapshot,
    ) -> anyhow::Result<(UpsRow, Option<UpsStatus>)> {
        vlt_db::upsert_snapshot(&self.pool, snapshot).await
    }

    async fn register_failure(&self, ups_id: &str) -> anyhow::Result<Option<FailureOutcome>> {
        vlt_db::register_failure(&self.pool, ups_id).await
    }
}

/// Fire-and-forget push notifications. Implementations log their own
/// failures; the poller never sees them.
#[async_trait]
pub trait RelayNotifier: Send + Sync {
    fn environment(&self) -> Environment;
    async fn ups_event(&self, event: UpsEvent);
    async fn heartbeat(&self, timestamp: i64);
}

#[async_trait]
impl RelayNotifier for RelayClient {
    fn environment(&self) -> Environment {
        RelayClient::environment(self)
    }

    async fn ups_event(&self, event: UpsEvent) {
        if let Err(err) = self.send_event(&event).await {
            error!(
                event_type = event.event_type.as_str(),
                ups_id = %event.ups_id,
                error = %err,
                "relay event dropped"
            );
        }
    }

    async fn heartbeat(&self, timestamp: i64) {
        if let Err(err) = self.send_heartbeat(timestamp).await {
            warn!(error = %err, "relay heartbeat dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// UPS names exactly as configured; ids are the lowercased form.
    pub ups_names: Vec<String>,
    pub poll_interval: Duration,
}

pub struct Poller {
    config: PollerConfig,
    fetcher: Arc<dyn VariableFetcher>,
    store: Arc<dyn SnapshotStore>,
    bus: Arc<EventBus>,
    relay: Option<Arc<dyn RelayNotifier>>,
    /// Last status written per ups_id during this poller's lifetime;
    /// authoritative for change detection, DB value is the fallback.
    last_status: HashMap<String, UpsStatus>,
    last_heartbeat: Option<Instant>,
}

impl Poller {
    pub fn new(
        config: PollerConfig,
        fetcher: Arc<dyn VariableFetcher>,
        store: Arc<dyn SnapshotStore>,
        bus: Arc<EventBus>,
        relay: Option<Arc<dyn RelayNotifier>>,
    ) -> Self {
        Poller {
            config,
            fetcher,
            store,
            bus,
            relay,
            last_status: HashMap::new(),
            last_heartbeat: None,
        }
    }

    /// Long-running loop: sleeps first (no eager poll at startup), then
    /// polls the configured list sequentially. The shutdown signal is
    /// observed between sleeps, between individual UPS polls, and inside
    /// a poll: an in-flight fetch or backoff sleep is abandoned.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval = ?self.config.poll_interval,
            upses = ?self.config.ups_names,
            "poller started"
        );
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("poller shutting down");
                    return;
                }
                _ = sleep(self.config.poll_interval) => {}
            }

            let cycle_started = Instant::now();
            let names = self.config.ups_names.clone();
            for name in &names {
                if !self.poll_one(name, &mut shutdown).await {
                    info!("poller shutting down mid-cycle");
                    return;
                }
            }
            self.maybe_send_heartbeat();

            // Cycles run back-to-back on one task, so a slow cycle can
            // never overlap the next; it only delays it.
            let elapsed = cycle_started.elapsed();
            if elapsed > self.config.poll_interval {
                warn!(
                    ?elapsed,
                    interval = ?self.config.poll_interval,
                    "poll cycle overran the interval; next tick delayed"
                );
            }
        }
    }

    /// One full list pass plus the heartbeat attempt — the body of a
    /// single `run` iteration. Public for scenario tests, which have no
    /// shutdown channel of their own.
    pub async fn poll_cycle(&mut self) {
        // Keep the sender alive so the receiver stays pending instead of
        // reading the channel as closed.
        let (keep_alive, mut never_fires) = broadcast::channel(1);
        let names = self.config.ups_names.clone();
        for name in &names {
            self.poll_one(name, &mut never_fires).await;
        }
        self.maybe_send_heartbeat();
        drop(keep_alive);
    }

    /// Poll a single UPS. Returns false when the shutdown signal fired,
    /// abandoning whatever fetch or backoff sleep was in flight.
    async fn poll_one(
        &mut self,
        ups_name: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let ups_id = ups_name.to_lowercase();

        let mut vars = None;
        for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
            if *delay > 0 {
                tokio::select! {
                    _ = shutdown.recv() => return false,
                    _ = sleep(Duration::from_secs(*delay)) => {}
                }
            }
            let fetched = tokio::select! {
                _ = shutdown.recv() => return false,
                fetched = self.fetcher.fetch(ups_name) => fetched,
            };
            match fetched {
                Ok(fetched) => {
                    vars = Some(fetched);
                    break;
                }
                Err(err) => {
                    warn!(
                        ups = %ups_name,
                        attempt = attempt + 1,
                        error = %err,
                        "nut fetch failed"
                    );
                }
            }
        }

        let Some(vars) = vars else {
            self.handle_poll_failure(&ups_id).await;
            return true;
        };

        let snapshot = map_snapshot(ups_name, &vars);
        let (row, stored_previous) = match self.store.upsert(&snapshot).await {
            Ok(result) => result,
            Err(err) => {
                error!(ups = %ups_id, error = %err, "snapshot upsert failed");
                return true;
            }
        };

        let previous = self.last_status.get(&ups_id).copied().or(stored_previous);
        self.last_status.insert(ups_id.clone(), row.snapshot.status);

        let has_low_battery = row.snapshot.has_low_battery();
        if previous.is_some_and(|p| p != row.snapshot.status) {
            info!(
                ups = %ups_id,
                from = previous.map(|p| p.as_str()).unwrap_or("-"),
                to = row.snapshot.status.as_str(),
                "ups status changed"
            );
            self.bus
                .publish(&BusEvent {
                    kind: EventKind::StatusChange,
                    ups: row.clone(),
                    has_low_battery,
                })
                .await;
            self.notify_status_change(&row, has_low_battery);
        }

        self.bus
            .publish(&BusEvent {
                kind: EventKind::MetricsUpdate,
                ups: row,
                has_low_battery,
            })
            .await;
        true
    }

    async fn handle_poll_failure(&mut self, ups_id: &str) {
        let outcome = match self.store.register_failure(ups_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(ups = %ups_id, error = %err, "failure registration failed");
                return;
            }
        };

        let Some(outcome) = outcome else {
            debug!(ups = %ups_id, "fetch failed before first successful poll");
            return;
        };

        debug!(
            ups = %ups_id,
            failures = outcome.row.consecutive_failures,
            "registered poll failure"
        );

        if outcome.status_changed {
            warn!(
                ups = %ups_id,
                failures = outcome.row.consecutive_failures,
                "ups promoted to offline"
            );
            self.last_status
                .insert(ups_id.to_string(), UpsStatus::UpsOffline);
            // Offline promotion publishes the status change only; there
            // are no fresh metrics to announce.
            self.bus
                .publish(&BusEvent {
                    kind: EventKind::StatusChange,
                    ups: outcome.row.clone(),
                    has_low_battery: false,
                })
                .await;
            self.notify_status_change(&outcome.row, false);
        }
    }

    fn notify_status_change(&self, row: &UpsRow, has_low_battery: bool) {
        let Some(relay) = &self.relay else {
            return;
        };
        let event = UpsEvent {
            event_type: if has_low_battery {
                RelayEventType::BatteryLow
            } else {
                RelayEventType::UpsStatusChange
            },
            status: Some(row.snapshot.status.as_str().to_string()),
            ups_id: row.snapshot.ups_id.clone(),
            environment: relay.environment(),
            timestamp: Utc::now().timestamp(),
            battery_level: row.snapshot.battery_percent,
            installation_id: None,
        };
        let relay = Arc::clone(relay);
        tokio::spawn(async move { relay.ups_event(event).await });
    }

    fn maybe_send_heartbeat(&mut self) {
        let Some(relay) = &self.relay else {
            return;
        };
        let due = self
            .last_heartbeat
            .map_or(true, |sent| sent.elapsed() >= HEARTBEAT_INTERVAL);
        if !due {
            return;
        }
        self.last_heartbeat = Some(Instant::now());
        let relay = Arc::clone(relay);
        let timestamp = Utc::now().timestamp();
        tokio::spawn(async move { relay.heartbeat(timestamp).await });
    }
}
