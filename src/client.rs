//! Typed HTTP client for the device API

use std::{path::Path, time::Duration};

use common::{
    endpoints, AccessPoint, CommandRequest, CommandsDocument, ConfigDocument, ConfigUpdate,
    ConnectRequest, DeviceMessage, ResultReply, Status, StatusUpdate, TimestampOnly,
};
use futures_util::{stream, StreamExt};
use log::{debug, trace};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use crate::{config::Settings, error::ApiError};

/// Firmware uploads are streamed in chunks of this size
const UPLOAD_CHUNK: usize = 16 * 1024;

/// Per-endpoint request timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub status: Duration,
    pub messages: Duration,
    /// `commands.json`, `config.json` and the other POSTs
    pub commands: Duration,
    /// `scan.json` and `ap.json`
    pub scan: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for Timeouts {
    fn from(settings: &Settings) -> Self {
        Self {
            status: settings.status_interval(),
            messages: settings.message_interval(),
            commands: Duration::from_millis(settings.command_timeout_ms),
            scan: Duration::from_millis(settings.scan_timeout_ms),
        }
    }
}

/// Which reboot endpoint to call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootKind {
    /// Restart into whatever firmware is running
    Normal,
    /// Leave recovery for the main firmware
    Ota,
    /// Restart into the recovery firmware
    Recovery,
}

impl RebootKind {
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Normal => endpoints::REBOOT,
            Self::Ota => endpoints::REBOOT_OTA,
            Self::Recovery => endpoints::RECOVERY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceClient {
    base_url: String,
    http: Client,
    timeouts: Timeouts,
}

impl DeviceClient {
    pub fn new(base_url: impl Into<String>, timeouts: Timeouts) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
            timeouts,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.device_url.clone(), Timeouts::from(settings))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    pub async fn status(&self) -> Result<Status, ApiError> {
        self.get(endpoints::STATUS, self.timeouts.status).await
    }

    /// Merge fields into the device status. Only the mock device honours
    /// this, to flip its `mock_*` switches.
    pub async fn post_status(
        &self,
        status: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ResultReply, ApiError> {
        let body = StatusUpdate {
            timestamp: common::now_ms(),
            status,
        };
        self.post(endpoints::STATUS, &body, Some(self.timeouts.commands))
            .await
    }

    pub async fn config(&self) -> Result<ConfigDocument, ApiError> {
        self.get(endpoints::CONFIG, self.timeouts.commands).await
    }

    pub async fn post_config(&self, update: &ConfigUpdate) -> Result<ResultReply, ApiError> {
        self.post(endpoints::CONFIG, update, Some(self.timeouts.commands))
            .await
    }

    pub async fn commands(&self) -> Result<CommandsDocument, ApiError> {
        self.get(endpoints::COMMANDS, self.timeouts.commands).await
    }

    pub async fn run_command(&self, command: &str) -> Result<ResultReply, ApiError> {
        let body = CommandRequest {
            timestamp: common::now_ms(),
            command: command.to_string(),
        };
        self.post(endpoints::COMMANDS, &body, Some(self.timeouts.commands))
            .await
    }

    pub async fn messages(&self) -> Result<Vec<DeviceMessage>, ApiError> {
        self.get(endpoints::MESSAGES, self.timeouts.messages).await
    }

    pub async fn connect(&self, ssid: &str, password: &str) -> Result<ResultReply, ApiError> {
        let body = ConnectRequest {
            timestamp: common::now_ms(),
            ssid: ssid.to_string(),
            pwd: password.to_string(),
        };
        self.post(endpoints::CONNECT, &body, Some(self.timeouts.commands))
            .await
    }

    pub async fn disconnect(&self) -> Result<ResultReply, ApiError> {
        let request = self
            .http
            .delete(self.url(endpoints::CONNECT))
            .json(&TimestampOnly::now())
            .timeout(self.timeouts.commands);
        let response = self.send(endpoints::CONNECT, request).await?;
        Ok(lenient_reply(endpoints::CONNECT, response).await)
    }

    pub async fn reboot(&self, kind: RebootKind) -> Result<ResultReply, ApiError> {
        self.post(kind.endpoint(), &TimestampOnly::now(), Some(self.timeouts.commands))
            .await
    }

    pub async fn reboot_ota(&self) -> Result<ResultReply, ApiError> {
        self.reboot(RebootKind::Ota).await
    }

    pub async fn recovery(&self) -> Result<ResultReply, ApiError> {
        self.reboot(RebootKind::Recovery).await
    }

    /// Send a firmware image to the recovery firmware. `progress` is called
    /// with `(bytes sent, total bytes)` as the body is streamed out.
    pub async fn flash<F>(&self, path: &Path, mut progress: F) -> Result<ResultReply, ApiError>
    where
        F: FnMut(u64, u64) + Send + Sync + 'static,
    {
        let image = tokio::fs::read(path).await?;
        let total = image.len() as u64;
        debug!("client::flash: uploading {} ({} bytes)", path.display(), total);

        let chunks: Vec<Vec<u8>> = image.chunks(UPLOAD_CHUNK).map(<[u8]>::to_vec).collect();
        let mut sent = 0u64;
        let body = stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            progress(sent, total);
            Ok::<_, std::io::Error>(chunk)
        });

        let request = self
            .http
            .post(self.url(endpoints::FLASH))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(body));
        let response = self.send(endpoints::FLASH, request).await?;
        Ok(lenient_reply(endpoints::FLASH, response).await)
    }

    /// Ask the device to start a Wi-Fi scan
    pub async fn scan(&self) -> Result<(), ApiError> {
        let request = self
            .http
            .get(self.url(endpoints::SCAN))
            .timeout(self.timeouts.scan);
        self.send(endpoints::SCAN, request).await?;
        Ok(())
    }

    /// Access points found by the last scan
    pub async fn access_points(&self) -> Result<Vec<AccessPoint>, ApiError> {
        self.get(endpoints::AP, self.timeouts.scan).await
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, timeout: Duration) -> Result<T, ApiError> {
        let request = self.http.get(self.url(endpoint)).timeout(timeout);
        let response = self.send(endpoint, request).await?;
        decode(endpoint, response).await
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<ResultReply, ApiError> {
        let mut request = self.http.post(self.url(endpoint)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = self.send(endpoint, request).await?;
        Ok(lenient_reply(endpoint, response).await)
    }

    async fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<Response, ApiError> {
        trace!("client: {}", endpoint);
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(endpoint, e))?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound {
                endpoint: endpoint.to_string(),
            }),
            status => Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

fn transport_error(endpoint: &str, error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::Timeout {
            endpoint: endpoint.to_string(),
        }
    } else if error.is_connect() {
        ApiError::Connect {
            endpoint: endpoint.to_string(),
            source: error,
        }
    } else {
        ApiError::Transport(error)
    }
}

async fn decode<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T, ApiError> {
    let text = response
        .text()
        .await
        .map_err(|e| transport_error(endpoint, e))?;
    serde_json::from_str(&text).map_err(|source| ApiError::Malformed {
        endpoint: endpoint.to_string(),
        source,
    })
}

/// POST replies are informational; a 2xx with an odd body still counts as
/// accepted.
async fn lenient_reply(endpoint: &str, response: Response) -> ResultReply {
    match response.text().await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|_| {
            debug!("client: {} replied {:?}", endpoint, text);
            ResultReply::default()
        }),
        Err(e) => {
            debug!("client: {} reply unreadable: {}", endpoint, e);
            ResultReply::default()
        }
    }
}
