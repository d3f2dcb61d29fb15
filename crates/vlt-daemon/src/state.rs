//! Shared runtime state for vlt-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum; this module owns
//! nothing async itself.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::RwLock;
use vlt_bus::{EventBus, GlobalMetricsLimiter};
use vlt_relay::{DeviceTokenCipher, RelayClient};

use crate::metrics::Metrics;
use crate::ratelimit::IpRateLimiter;
use crate::storage::{PgUpsReader, UpsReader};
use crate::update::Compatibility;

/// Protocol version this server speaks toward the Relay / iOS client.
pub const PROTOCOL_VERSION: &str = "1.1";

/// Static build metadata included in status responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub protocol_version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub db: PgPool,
    /// Read path for snapshots; swapped for an in-memory reader in tests.
    pub ups_reader: Arc<dyn UpsReader>,
    /// Event bus the poller publishes into and SSE connections subscribe to.
    pub bus: Arc<EventBus>,
    /// Process-wide metrics-frame cap shared by every SSE connection.
    pub global_limiter: Arc<GlobalMetricsLimiter>,
    pub build: BuildInfo,
    /// SHA-256 of API_TOKEN; `None` = degraded mode (public routes only).
    pub api_token_hash: Option<[u8; 32]>,
    /// `ENVIRONMENT=production`: hides the simulate-push route.
    pub production: bool,
    pub relay: Option<Arc<RelayClient>>,
    pub cipher: Arc<DeviceTokenCipher>,
    pub compatibility: Arc<RwLock<Compatibility>>,
    pub metrics: Arc<Metrics>,
    pub ip_limiter: Arc<IpRateLimiter>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        bus: Arc<EventBus>,
        relay: Option<Arc<RelayClient>>,
        cipher: DeviceTokenCipher,
        api_token: Option<&str>,
        production: bool,
    ) -> Self {
        AppState {
            ups_reader: Arc::new(PgUpsReader::new(db.clone())),
            db,
            bus,
            global_limiter: Arc::new(GlobalMetricsLimiter::new()),
            build: BuildInfo {
                service: "vlt-daemon",
                version: env!("CARGO_PKG_VERSION"),
                protocol_version: PROTOCOL_VERSION,
            },
            api_token_hash: api_token.map(token_fingerprint),
            production,
            relay,
            cipher: Arc::new(cipher),
            compatibility: Arc::new(RwLock::new(Compatibility::Supported)),
            metrics: Arc::new(Metrics::new()),
            ip_limiter: Arc::new(IpRateLimiter::new()),
        }
    }

    /// Replace the snapshot read path; scenario tests use an in-memory
    /// reader so the router runs without a database.
    pub fn with_ups_reader(mut self, reader: Arc<dyn UpsReader>) -> Self {
        self.ups_reader = reader;
        self
    }

    pub fn degraded(&self) -> bool {
        self.api_token_hash.is_none()
    }
}

/// SHA-256 of a bearer token; both sides of the auth comparison go
/// through this so the compare runs over fixed-length digests.
pub fn token_fingerprint(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}
