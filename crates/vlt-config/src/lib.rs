//! Environment-variable configuration for the Volteec daemon.
//!
//! Everything is read through [`Lookup`] so tests can feed a plain map
//! instead of mutating the process environment. `AppConfig::from_env()`
//! is the production entry point; `main` calls it once after the
//! dotenvy bootstrap.
//!
//! Failure policy (mirrors the startup error taxonomy):
//! - missing/invalid DB, NUT, or device-token settings are fatal;
//! - a missing `API_TOKEN` puts the daemon in degraded mode (public
//!   routes only) instead of failing;
//! - a broken Relay block is reported via `RelayConfigState::Invalid`
//!   so the caller can warn and continue without push.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use uuid::Uuid;
use vlt_schemas::Environment;

/// Relay base URL used when `VOLTEEC_DEPLOYMENT=production`.
pub const RELAY_URL_PRODUCTION: &str = "https://relay.volteec.com";
/// Relay base URL for every other deployment.
pub const RELAY_URL_STAGING: &str = "https://relay-staging.volteec.com";

/// Environment lookup indirection. `None` means the variable is unset;
/// an empty string is treated as unset everywhere below.
pub trait Lookup {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process environment.
pub struct ProcessEnv;

impl Lookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl Lookup for &[(&str, &str)] {
    fn get(&self, key: &str) -> Option<String> {
        self.iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    }
}

fn get_trimmed(env: &impl Lookup, key: &str) -> Option<String> {
    env.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require(env: &impl Lookup, key: &str) -> Result<String> {
    get_trimmed(env, key).ok_or_else(|| anyhow!("missing env var {key}"))
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Require,
    Prefer,
    Disable,
}

impl TlsMode {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "require" => Ok(TlsMode::Require),
            "prefer" => Ok(TlsMode::Prefer),
            "disable" => Ok(TlsMode::Disable),
            other => bail!("DATABASE_TLS_MODE must be require|prefer|disable, got {other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub name: String,
    pub tls_mode: TlsMode,
}

impl DatabaseConfig {
    pub fn load(env: &impl Lookup) -> Result<Self> {
        let port = get_trimmed(env, "DATABASE_PORT").unwrap_or_else(|| "5432".to_string());
        Ok(DatabaseConfig {
            host: require(env, "DATABASE_HOST")?,
            port: port
                .parse()
                .with_context(|| format!("DATABASE_PORT is not a port: {port:?}"))?,
            username: require(env, "DATABASE_USERNAME")?,
            password: require(env, "DATABASE_PASSWORD")?,
            name: require(env, "DATABASE_NAME")?,
            tls_mode: match get_trimmed(env, "DATABASE_TLS_MODE") {
                Some(v) => TlsMode::parse(&v)?,
                None => TlsMode::Prefer,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// NUT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NutConfig {
    pub host: String,
    pub port: u16,
    /// UPS names to poll, in configured order.
    pub ups_names: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub poll_interval: Duration,
}

impl NutConfig {
    pub fn load(env: &impl Lookup) -> Result<Self> {
        let port = get_trimmed(env, "NUT_PORT").unwrap_or_else(|| "3493".to_string());
        let ups_names: Vec<String> = require(env, "NUT_UPS")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if ups_names.is_empty() {
            bail!("NUT_UPS lists no UPS names");
        }

        let poll_interval = match get_trimmed(env, "NUT_POLL_INTERVAL") {
            Some(v) => {
                let secs: f64 = v
                    .parse()
                    .with_context(|| format!("NUT_POLL_INTERVAL is not a number: {v:?}"))?;
                if !secs.is_finite() || secs <= 0.0 {
                    bail!("NUT_POLL_INTERVAL must be positive, got {v:?}");
                }
                Duration::from_secs_f64(secs)
            }
            None => Duration::from_secs(1),
        };

        Ok(NutConfig {
            host: require(env, "NUT_HOST")?,
            port: port
                .parse()
                .with_context(|| format!("NUT_PORT is not a port: {port:?}"))?,
            ups_names,
            username: get_trimmed(env, "NUT_USERNAME"),
            password: get_trimmed(env, "NUT_PASSWORD"),
            poll_interval,
        })
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub base_url: String,
    pub tenant_id: Uuid,
    pub secret: String,
    pub server_id: Uuid,
    pub environment: Environment,
}

/// Relay configuration is tri-state: absent (no push), present, or broken
/// (warn + continue without push).
#[derive(Debug, Clone)]
pub enum RelayConfigState {
    Unconfigured,
    Configured(RelaySettings),
    Invalid(String),
}

impl RelayConfigState {
    pub fn load(env: &impl Lookup) -> Self {
        let tenant = get_trimmed(env, "RELAY_TENANT_ID");
        let secret = get_trimmed(env, "RELAY_SECRET");
        let server = get_trimmed(env, "RELAY_SERVER_ID");

        if tenant.is_none() && secret.is_none() && server.is_none() {
            return RelayConfigState::Unconfigured;
        }

        let (Some(tenant), Some(secret), Some(server)) = (tenant, secret, server) else {
            return RelayConfigState::Invalid(
                "RELAY_TENANT_ID, RELAY_SECRET and RELAY_SERVER_ID must all be set".to_string(),
            );
        };

        let tenant_id = match tenant.parse::<Uuid>() {
            Ok(id) => id,
            Err(_) => {
                return RelayConfigState::Invalid(format!(
                    "RELAY_TENANT_ID is not a UUID: {tenant:?}"
                ))
            }
        };
        let server_id = match server.parse::<Uuid>() {
            Ok(id) => id,
            Err(_) => {
                return RelayConfigState::Invalid(format!(
                    "RELAY_SERVER_ID is not a UUID: {server:?}"
                ))
            }
        };

        let deployment = get_trimmed(env, "VOLTEEC_DEPLOYMENT");
        let base_url = if deployment.as_deref() == Some("production") {
            RELAY_URL_PRODUCTION.to_string()
        } else {
            RELAY_URL_STAGING.to_string()
        };

        let environment = match deployment.as_deref() {
            Some("production") => Environment::Production,
            _ => Environment::Sandbox,
        };

        RelayConfigState::Configured(RelaySettings {
            base_url,
            tenant_id,
            secret,
            server_id,
            environment,
        })
    }
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` = degraded mode: only /health, /ready, /metrics are served.
    pub api_token: Option<String>,
    /// Base64 of the 32-byte AES key for device tokens.
    pub device_token_key: String,
    pub database: DatabaseConfig,
    pub nut: NutConfig,
    pub relay: RelayConfigState,
    /// `ENVIRONMENT=production` hides the simulate-push route.
    pub production: bool,
    pub bind_addr: SocketAddr,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::load(&ProcessEnv)
    }

    pub fn load(env: &impl Lookup) -> Result<Self> {
        let bind = get_trimmed(env, "BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string());
        Ok(AppConfig {
            api_token: get_trimmed(env, "API_TOKEN"),
            device_token_key: require(env, "DEVICE_TOKEN_KEY")?,
            database: DatabaseConfig::load(env)?,
            nut: NutConfig::load(env)?,
            relay: RelayConfigState::load(env),
            production: get_trimmed(env, "ENVIRONMENT").as_deref() == Some("production"),
            bind_addr: bind
                .parse()
                .with_context(|| format!("BIND_ADDR is not host:port: {bind:?}"))?,
        })
    }

    pub fn degraded(&self) -> bool {
        self.api_token.is_none()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
