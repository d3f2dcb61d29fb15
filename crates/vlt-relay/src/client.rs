//! HMAC-signed HTTP client for the Relay service.
//!
//! Every call POSTs JSON with three extra headers:
//! `X-Request-ID` (fresh UUID), `X-Volteec-Nonce` (fresh UUID) and
//! `X-Volteec-Signature` = hex(HMAC-SHA256(secret,
//! `"<timestamp>\n<nonce>\n<rawBody>"`)) over the exact bytes sent.
//! The timestamp inside the body is the one signed.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;
use vlt_config::RelaySettings;
use vlt_schemas::Environment;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const EVENT_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum RelayError {
    /// Bad base URL or unusable client configuration.
    Config(String),
    /// Network-level failure (connect, timeout, body).
    Transport(String),
    /// The Relay answered outside 2xx.
    Status(u16),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Config(msg) => write!(f, "relay config error: {msg}"),
            RelayError::Transport(msg) => write!(f, "relay transport error: {msg}"),
            RelayError::Status(code) => write!(f, "relay returned status {code}"),
        }
    }
}

impl std::error::Error for RelayError {}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

type HmacSha256 = Hmac<Sha256>;

/// Signature over `"<timestamp>\n<nonce>\n<body>"`, hex-encoded.
pub fn sign(secret: &str, timestamp: &str, nonce: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b"\n");
    mac.update(nonce.as_bytes());
    mac.update(b"\n");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub base_url: String,
    pub tenant_id: Uuid,
    pub secret: String,
    pub server_id: Uuid,
    pub environment: Environment,
}

impl RelayConfig {
    pub fn from_settings(settings: &RelaySettings) -> Result<Self, RelayError> {
        if settings.secret.is_empty() {
            return Err(RelayError::Config("relay secret is empty".to_string()));
        }
        let parsed = reqwest::Url::parse(&settings.base_url)
            .map_err(|e| RelayError::Config(format!("bad relay url {:?}: {e}", settings.base_url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RelayError::Config(format!(
                "relay url must be http(s): {:?}",
                settings.base_url
            )));
        }
        Ok(RelayConfig {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            tenant_id: settings.tenant_id,
            secret: settings.secret.clone(),
            server_id: settings.server_id,
            environment: settings.environment,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventBody<'a> {
    tenant_id: Uuid,
    event_id: Uuid,
    event_type: &'a str,
    timestamp: i64,
    environment: &'a str,
    ups_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'a str>,
    server_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    battery_level: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    installation_id: Option<Uuid>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatBody {
    tenant_id: Uuid,
    server_id: Uuid,
    timestamp: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PairBody<'a> {
    tenant_id: Uuid,
    server_id: Uuid,
    code: &'a str,
    timestamp: i64,
    environment: &'a str,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEventType {
    UpsStatusChange,
    BatteryLow,
    ServerUpdateRequired,
    ServerUpdateAvailable,
    TestPush,
}

impl RelayEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayEventType::UpsStatusChange => "ups_status_change",
            RelayEventType::BatteryLow => "battery_low",
            RelayEventType::ServerUpdateRequired => "server_update_required",
            RelayEventType::ServerUpdateAvailable => "server_update_available",
            RelayEventType::TestPush => "test_push",
        }
    }
}

/// One outbound push event. `ups_id` stays empty for tenant-level
/// broadcasts (server update notices).
#[derive(Debug, Clone)]
pub struct UpsEvent {
    pub event_type: RelayEventType,
    pub status: Option<String>,
    pub ups_id: String,
    pub environment: Environment,
    pub timestamp: i64,
    pub battery_level: Option<i32>,
    pub installation_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct RelayClient {
    config: RelayConfig,
    http: reqwest::Client,
    retry_delay: Duration,
}

impl RelayClient {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Config(e.to_string()))?;
        Ok(RelayClient {
            config,
            http,
            retry_delay: RETRY_DELAY,
        })
    }

    /// Shrink the inter-attempt delay; scenario tests use this to avoid
    /// sleeping wall-clock seconds.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn relay_url(&self) -> &str {
        &self.config.base_url
    }

    pub fn server_id(&self) -> Uuid {
        self.config.server_id
    }

    pub fn environment(&self) -> Environment {
        self.config.environment
    }

    /// POST `/event`, retrying once after [`RETRY_DELAY`]. Any 2xx wins.
    pub async fn send_event(&self, event: &UpsEvent) -> Result<(), RelayError> {
        let body = serde_json::to_vec(&EventBody {
            tenant_id: self.config.tenant_id,
            event_id: Uuid::new_v4(),
            event_type: event.event_type.as_str(),
            timestamp: event.timestamp,
            environment: event.environment.as_str(),
            ups_id: &event.ups_id,
            status: event.status.as_deref(),
            server_id: self.config.server_id,
            battery_level: event.battery_level,
            installation_id: event.installation_id,
        })
        .map_err(|e| RelayError::Transport(format!("encode event body: {e}")))?;

        let mut attempt = 1;
        loop {
            match self.post_signed("event", &body, event.timestamp).await {
                Ok(()) => {
                    debug!(
                        event_type = event.event_type.as_str(),
                        ups_id = %event.ups_id,
                        attempt,
                        "relay event delivered"
                    );
                    return Ok(());
                }
                Err(err) if attempt < EVENT_ATTEMPTS => {
                    warn!(
                        event_type = event.event_type.as_str(),
                        error = %err,
                        attempt,
                        "relay event attempt failed; retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// POST `/heartbeat`; single attempt, caller decides what to log.
    pub async fn send_heartbeat(&self, timestamp: i64) -> Result<(), RelayError> {
        let body = serde_json::to_vec(&HeartbeatBody {
            tenant_id: self.config.tenant_id,
            server_id: self.config.server_id,
            timestamp,
        })
        .map_err(|e| RelayError::Transport(format!("encode heartbeat body: {e}")))?;
        self.post_signed("heartbeat", &body, timestamp).await
    }

    /// POST `/pair`. Unlike the event paths this propagates failure: the
    /// HTTP handler surfaces it as 502.
    pub async fn create_pair_code(&self, code: &str, timestamp: i64) -> Result<(), RelayError> {
        let body = serde_json::to_vec(&PairBody {
            tenant_id: self.config.tenant_id,
            server_id: self.config.server_id,
            code,
            timestamp,
            environment: self.config.environment.as_str(),
        })
        .map_err(|e| RelayError::Transport(format!("encode pair body: {e}")))?;
        self.post_signed("pair", &body, timestamp).await
    }

    /// Tenant-level broadcast: tell every registered device the server
    /// must be updated. Skipped entirely when no devices exist.
    pub async fn send_server_update_required(&self, pool: &PgPool) -> anyhow::Result<()> {
        self.send_update_broadcast(RelayEventType::ServerUpdateRequired, pool)
            .await
    }

    /// Same fan-out for "an update is available".
    pub async fn send_server_update_available(&self, pool: &PgPool) -> anyhow::Result<()> {
        self.send_update_broadcast(RelayEventType::ServerUpdateAvailable, pool)
            .await
    }

    async fn send_update_broadcast(
        &self,
        event_type: RelayEventType,
        pool: &PgPool,
    ) -> anyhow::Result<()> {
        let devices = vlt_db::count_devices(pool).await?;
        if devices == 0 {
            debug!(
                event_type = event_type.as_str(),
                "no registered devices; skipping broadcast"
            );
            return Ok(());
        }

        let timestamp = Utc::now().timestamp();
        for environment in [Environment::Sandbox, Environment::Production] {
            let event = UpsEvent {
                event_type,
                status: None,
                ups_id: String::new(),
                environment,
                timestamp,
                battery_level: None,
                installation_id: None,
            };
            if let Err(err) = self.send_event(&event).await {
                warn!(
                    event_type = event_type.as_str(),
                    environment = environment.as_str(),
                    error = %err,
                    "update broadcast dropped"
                );
            }
        }
        Ok(())
    }

    async fn post_signed(
        &self,
        path: &str,
        body: &[u8],
        timestamp: i64,
    ) -> Result<(), RelayError> {
        let nonce = Uuid::new_v4().to_string();
        let request_id = Uuid::new_v4().to_string();
        let signature = sign(&self.config.secret, &timestamp.to_string(), &nonce, body);
        let url = format!("{}/{path}", self.config.base_url);

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Request-ID", request_id)
            .header("X-Volteec-Nonce", nonce)
            .header("X-Volteec-Signature", signature)
            .body(body.to_vec())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(RelayError::Status(response.status().as_u16()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
