use thiserror::Error;

use crate::ota::OtaState;

/// Failure talking to the device
#[derive(Debug, Error)]
pub enum ApiError {
    /// No answer in time, usually because the device is rebooting
    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("could not reach the device at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The running firmware does not implement this endpoint
    #[error("{endpoint} is not supported by the running firmware")]
    NotFound { endpoint: String },

    #[error("{endpoint} answered with HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("malformed JSON from {endpoint}: {source}")]
    Malformed {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Timeouts and refused connections are what a rebooting device looks like
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connect { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Rejected firmware update request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("Invalid url or file. Cannot start OTA")]
    InvalidTarget,

    #[error("an update is already running (state {0})")]
    Busy(OtaState),
}

/// The controller task has exited and no longer takes requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the device controller has stopped")]
pub struct ControllerClosed;
