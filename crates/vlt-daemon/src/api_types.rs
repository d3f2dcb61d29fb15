//! Request/response DTOs for the HTTP surface. Wire naming is camelCase.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Uniform error body: `{"error": true, "reason": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: bool,
    pub reason: String,
}

impl ErrorResponse {
    pub fn new(reason: impl Into<String>) -> Self {
        ErrorResponse {
            error: true,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    /// When present and non-empty, must be "1.0" or "1.1".
    pub api_version: Option<String>,
    pub ups_id: String,
    pub ups_alias: Option<String>,
    pub device_token: String,
    /// "sandbox" (default) or "production".
    pub environment: Option<String>,
    pub installation_id: Option<Uuid>,
    pub ups_hidden: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterDeviceRequest {
    pub ups_id: String,
    pub device_token: String,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairResponse {
    pub api_version: &'static str,
    pub relay_url: String,
    pub pair_code: String,
    pub server_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusResponse {
    pub version: &'static str,
    pub protocol_version: &'static str,
    pub compatibility: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatePushRequest {
    pub ups_id: Option<String>,
    pub status: Option<String>,
}
