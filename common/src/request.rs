//! Request bodies. The firmware expects a millisecond `timestamp` on every
//! POST/DELETE so that caches never serve a stale reply.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ConfigMap;

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimestampOnly {
    pub timestamp: u64,
}

impl TimestampOnly {
    pub fn now() -> Self {
        Self { timestamp: now_ms() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub timestamp: u64,
    pub ssid: String,
    #[serde(default)]
    pub pwd: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub timestamp: u64,
    pub command: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub timestamp: u64,
    pub config: ConfigMap,
}

/// Body of `POST /status.json`, used to flip the mock device switches
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub timestamp: u64,
    pub status: serde_json::Map<String, serde_json::Value>,
}

/// `{"result": "OK"}` from config/connect/reboot, `{"Result": "Success"}`
/// from commands
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultReply {
    #[serde(default, alias = "Result")]
    pub result: Option<String>,
}

impl ResultReply {
    pub fn ok() -> Self {
        Self {
            result: Some("OK".to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result.as_deref(), Some("OK") | Some("Success"))
    }
}
