//! Update checker: daily `GET <relay>/meta`, classify this server's
//! protocol version against what the Relay advertises, and notify
//! registered devices on the transitions that matter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use vlt_relay::RelayClient;

use crate::state::PROTOCOL_VERSION;

pub const CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const META_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Supported,
    Deprecated,
    Unsupported,
    Unreachable,
    Invalid,
}

impl Compatibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compatibility::Supported => "supported",
            Compatibility::Deprecated => "deprecated",
            Compatibility::Unsupported => "unsupported",
            Compatibility::Unreachable => "unreachable",
            Compatibility::Invalid => "invalid",
        }
    }
}

/// Classify `version` against a Relay /meta document.
///
/// Two advertised shapes are accepted: a `protocolVersions` map of
/// version -> state, or `supportedVersions`/`deprecatedVersions` lists.
/// Anything else is `Invalid`.
pub fn classify_meta(meta: &Value, version: &str) -> Compatibility {
    if let Some(map) = meta.get("protocolVersions").and_then(Value::as_object) {
        return match map.get(version).and_then(Value::as_str) {
            Some("supported") => Compatibility::Supported,
            Some("deprecated") => Compatibility::Deprecated,
            Some(_) | None => Compatibility::Unsupported,
        };
    }

    if let Some(supported) = meta.get("supportedVersions").and_then(Value::as_array) {
        if supported.iter().any(|v| v.as_str() == Some(version)) {
            return Compatibility::Supported;
        }
        let deprecated = meta
            .get("deprecatedVersions")
            .and_then(Value::as_array)
            .is_some_and(|list| list.iter().any(|v| v.as_str() == Some(version)));
        return if deprecated {
            Compatibility::Deprecated
        } else {
            Compatibility::Unsupported
        };
    }

    Compatibility::Invalid
}

/// Whether the Relay advertises a protocol version numerically newer
/// than ours (in either meta shape).
pub fn newer_version_advertised(meta: &Value, version: &str) -> bool {
    let ours: f64 = match version.parse() {
        Ok(v) => v,
        Err(_) => return false,
    };

    let advertised: Vec<f64> = if let Some(map) =
        meta.get("protocolVersions").and_then(Value::as_object)
    {
        map.keys().filter_map(|k| k.parse().ok()).collect()
    } else if let Some(list) = meta.get("supportedVersions").and_then(Value::as_array) {
        list.iter()
            .filter_map(Value::as_str)
            .filter_map(|s| s.parse().ok())
            .collect()
    } else {
        Vec::new()
    };

    advertised.into_iter().any(|v| v > ours)
}

// ---------------------------------------------------------------------------
// Checker task
// ---------------------------------------------------------------------------

pub struct UpdateChecker {
    http: reqwest::Client,
    meta_url: String,
    state: Arc<RwLock<Compatibility>>,
    relay: Arc<RelayClient>,
    db: PgPool,
    available_notified: AtomicBool,
}

impl UpdateChecker {
    pub fn new(
        relay: Arc<RelayClient>,
        db: PgPool,
        state: Arc<RwLock<Compatibility>>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(META_TIMEOUT)
            .build()?;
        Ok(UpdateChecker {
            http,
            meta_url: format!("{}/meta", relay.relay_url()),
            state,
            relay,
            db,
            available_notified: AtomicBool::new(false),
        })
    }

    /// Check once at startup, then daily until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            self.check_once().await;
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("update checker shutting down");
                    return;
                }
                _ = tokio::time::sleep(CHECK_INTERVAL) => {}
            }
        }
    }

    pub async fn check_once(&self) {
        let (compatibility, meta) = self.fetch_classification().await;

        let previous = {
            let mut state = self.state.write().await;
            let previous = *state;
            *state = compatibility;
            previous
        };

        if compatibility != previous {
            info!(
                from = previous.as_str(),
                to = compatibility.as_str(),
                "relay compatibility changed"
            );
            if compatibility == Compatibility::Unsupported {
                if let Err(err) = self.relay.send_server_update_required(&self.db).await {
                    warn!(error = %err, "update-required broadcast failed");
                }
            }
        }

        // Tell devices once per process lifetime that a newer protocol
        // exists while we are still supported.
        if compatibility == Compatibility::Supported {
            if let Some(meta) = &meta {
                if newer_version_advertised(meta, PROTOCOL_VERSION)
                    && !self.available_notified.swap(true, Ordering::SeqCst)
                {
                    if let Err(err) = self.relay.send_server_update_available(&self.db).await {
                        warn!(error = %err, "update-available broadcast failed");
                    }
                }
            }
        }
    }

    async fn fetch_classification(&self) -> (Compatibility, Option<Value>) {
        let response = match self.http.get(&self.meta_url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "relay meta unreachable");
                return (Compatibility::Unreachable, None);
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "relay meta answered non-2xx");
            return (Compatibility::Unreachable, None);
        }
        match response.json::<Value>().await {
            Ok(meta) => (classify_meta(&meta, PROTOCOL_VERSION), Some(meta)),
            Err(err) => {
                warn!(error = %err, "relay meta is not valid JSON");
                (Compatibility::Invalid, None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
