//! Shared domain and wire types for the Volteec backend.
//!
//! Everything here is plain data: no I/O, no async. Wire-facing structs
//! serialize camelCase (the iOS client and Relay both speak camelCase);
//! internal enums serialize snake_case to match the persisted column
//! values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire schema version stamped on every SSE payload.
pub const SCHEMA_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// UpsStatus
// ---------------------------------------------------------------------------

/// Canonical UPS status derived from the raw NUT flag string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsStatus {
    Online,
    OnBattery,
    UpsOffline,
}

impl UpsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsStatus::Online => "online",
            UpsStatus::OnBattery => "on_battery",
            UpsStatus::UpsOffline => "ups_offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(UpsStatus::Online),
            "on_battery" => Some(UpsStatus::OnBattery),
            "ups_offline" => Some(UpsStatus::UpsOffline),
            _ => None,
        }
    }
}

impl Default for UpsStatus {
    fn default() -> Self {
        UpsStatus::UpsOffline
    }
}

// ---------------------------------------------------------------------------
// DataSource
// ---------------------------------------------------------------------------

/// Where a snapshot row came from. Only `nut` is produced today; `snmp`
/// is reserved in the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Nut,
    Snmp,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Nut => "nut",
            DataSource::Snmp => "snmp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "nut" => Some(DataSource::Nut),
            "snmp" => Some(DataSource::Snmp),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// APNs-style environment a device registration (and Relay event) targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Sandbox,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Production => "production",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sandbox" => Some(Environment::Sandbox),
            "production" => Some(Environment::Production),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// UpsSnapshot
// ---------------------------------------------------------------------------

/// A mapped UPS snapshot as produced by the canonical mapper.
///
/// Every metric is optional: a NUT server only reports the variables the
/// driver knows about, and a missing key is not an error. Field names
/// mirror the NUT variable tree (`battery.charge` -> `battery_percent`
/// for the legacy fields, one-to-one for the extended ones).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpsSnapshot {
    /// Lowercased UPS identifier; unique per row.
    pub ups_id: String,
    pub status: UpsStatus,
    /// Verbatim `ups.status` flag string (e.g. `"OL CHRG"`).
    pub ups_status_raw: Option<String>,

    pub battery_percent: Option<i32>,
    /// Derived: `battery.runtime` seconds / 60, floored.
    pub runtime_minutes: Option<i32>,
    pub runtime_seconds: Option<i32>,
    pub load_percent: Option<i32>,
    pub input_voltage: Option<f64>,
    pub output_voltage: Option<f64>,

    pub battery_voltage: Option<f64>,
    pub battery_voltage_nominal: Option<f64>,
    pub battery_type: Option<String>,
    pub battery_date: Option<String>,
    pub battery_mfr_date: Option<String>,
    pub battery_charge_low: Option<i32>,
    pub battery_charge_warning: Option<i32>,
    pub battery_runtime_low: Option<i32>,

    pub device_mfr: Option<String>,
    pub device_model: Option<String>,
    pub device_serial: Option<String>,
    pub device_type: Option<String>,

    pub driver_name: Option<String>,
    pub driver_version: Option<String>,
    pub driver_version_internal: Option<String>,
    pub driver_version_data: Option<String>,
    pub driver_poll_freq: Option<i32>,
    pub driver_poll_interval: Option<i32>,

    pub input_voltage_nominal: Option<f64>,
    pub input_sensitivity: Option<String>,
    pub input_transfer_high: Option<f64>,
    pub input_transfer_low: Option<f64>,

    pub output_frequency: Option<f64>,
    pub output_frequency_nominal: Option<f64>,
    pub output_voltage_nominal: Option<f64>,

    pub ups_beeper_status: Option<String>,
    pub ups_delay_shutdown: Option<i32>,
    pub ups_delay_start: Option<i32>,
    pub ups_timer_shutdown: Option<i32>,
    pub ups_timer_start: Option<i32>,
    pub ups_firmware: Option<String>,
    pub ups_firmware_aux: Option<String>,
    pub ups_mfr: Option<String>,
    pub ups_model: Option<String>,
    pub ups_productid: Option<String>,
    pub ups_vendorid: Option<String>,
    pub ups_serial: Option<String>,
    pub ups_test_result: Option<String>,
    pub ups_realpower_nominal: Option<i32>,
}

impl UpsSnapshot {
    /// An all-null snapshot for `ups_id`, status `ups_offline`. This is the
    /// shape a row takes after the offline promotion clears its metrics.
    pub fn offline(ups_id: &str) -> Self {
        UpsSnapshot {
            ups_id: ups_id.to_lowercase(),
            status: UpsStatus::UpsOffline,
            ..Default::default()
        }
    }

    /// Whether the raw NUT status carries the low-battery flag.
    pub fn has_low_battery(&self) -> bool {
        self.ups_status_raw
            .as_deref()
            .map(|raw| raw.to_uppercase().contains("LB"))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// UpsRow
// ---------------------------------------------------------------------------

/// A persisted UPS row: the snapshot plus bookkeeping columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsRow {
    #[serde(flatten)]
    pub snapshot: UpsSnapshot,
    pub data_source: DataSource,
    pub consecutive_failures: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event kinds published on the in-process bus and used as SSE event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StatusChange,
    MetricsUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StatusChange => "status_change",
            EventKind::MetricsUpdate => "metrics_update",
        }
    }
}

/// Payload carried across the event bus from the poller to SSE subscribers.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub kind: EventKind,
    pub ups: UpsRow,
    pub has_low_battery: bool,
}

/// Repository outcome of a failed poll registration.
#[derive(Debug, Clone)]
pub struct FailureOutcome {
    pub row: UpsRow,
    pub previous_status: UpsStatus,
    pub status_changed: bool,
}

// ---------------------------------------------------------------------------
// SSE payloads
// ---------------------------------------------------------------------------

/// Snapshot payload written as the `data:` line of UPS SSE frames and
/// returned by the REST snapshot endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsStatusPayload {
    pub schema_version: &'static str,
    /// Wall-clock send time, RFC 3339.
    pub updated_at: String,
    #[serde(flatten)]
    pub snapshot: UpsSnapshot,
    pub data_source: DataSource,
    pub consecutive_failures: i32,
}

impl UpsStatusPayload {
    pub fn from_row(row: &UpsRow, now: DateTime<Utc>) -> Self {
        UpsStatusPayload {
            schema_version: SCHEMA_VERSION,
            updated_at: now.to_rfc3339(),
            snapshot: row.snapshot.clone(),
            data_source: row.data_source,
            consecutive_failures: row.consecutive_failures,
        }
    }
}

/// Payload of the periodic SSE `heartbeat` frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub schema_version: &'static str,
    pub timestamp: String,
}

impl HeartbeatPayload {
    pub fn at(now: DateTime<Utc>) -> Self {
        HeartbeatPayload {
            schema_version: SCHEMA_VERSION,
            timestamp: now.to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
