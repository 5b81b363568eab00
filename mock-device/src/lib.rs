//! A pretend Squeezelite-ESP32 device serving the same HTTP API as the
//! firmware.
//!
//! Reboots are simulated: for a while after one is requested every handler
//! holds its reply, the way a real device stops answering. Firmware updates
//! play back a canned sequence of OTA progress messages, one per poll. The
//! `mock_*` status switches, set through `POST /status.json`, make the
//! device misbehave:
//!
//! * `mock_old_recovery`: recovery without `messages.json`, `commands.json`
//!   or uploads; OTA progress is reported through `status.json` instead
//! * `mock_fail_recovery`: `recovery.json` answers 404
//! * `mock_fail_fw_update`: downloads break half way and uploads are refused
//! * `mock_plugin_has_proxy`: `y` or `x` makes the LMS plugin proxy check pass

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use common::{
    AccessPoint, CommandRequest, CommandsDocument, ConfigDocument, ConfigMap, ConfigUpdate,
    ConnectRequest, ConnectReturnCode, DeviceMessage, GpioEntry, OtaProgress, ResultReply, Status,
    StatusUpdate, TimestampOnly,
};
use serde_json::json;
use tokio::{
    net::TcpListener,
    sync::RwLock,
    time::{sleep, sleep_until, Instant},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

pub mod fixtures;

/// Config key that starts a firmware download
const FWURL_KEY: &str = "fwurl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockOptions {
    /// How long the device stays silent after a reboot
    pub reboot_duration: Duration,
    /// Delay before a `connect.json` request shows up in the status
    pub connect_delay: Duration,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            reboot_duration: Duration::from_secs(10),
            connect_delay: Duration::from_secs(1),
        }
    }
}

/// What happens once an OTA sequence has been played back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterSequence {
    /// Back to the main firmware without a visible reboot
    LeaveRecovery,
    /// Reboot into the main firmware
    Reboot,
}

struct DeviceState {
    status: Status,
    config: ConfigMap,
    gpio: Vec<GpioEntry>,
    commands: CommandsDocument,
    access_points: Vec<AccessPoint>,
    /// Replayed into the queue on every reboot
    boot_messages: Vec<DeviceMessage>,
    queue: Vec<DeviceMessage>,
    /// Fed into `messages.json`, one entry per poll
    message_sequence: VecDeque<DeviceMessage>,
    message_sequence_done: Option<AfterSequence>,
    /// Fed into `status.json` on old recovery, one entry per poll
    status_sequence: VecDeque<OtaProgress>,
    status_sequence_done: Option<AfterSequence>,
    rebooting_until: Option<Instant>,
    booted_at: Instant,
}

fn switch(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

impl DeviceState {
    fn new() -> Self {
        let config = fixtures::config();
        let boot_messages = fixtures::boot_messages();
        Self {
            status: fixtures::status(),
            config: config.entries().clone(),
            gpio: config.gpio().to_vec(),
            commands: fixtures::commands(),
            access_points: fixtures::access_points(),
            queue: boot_messages.clone(),
            boot_messages,
            message_sequence: VecDeque::new(),
            message_sequence_done: None,
            status_sequence: VecDeque::new(),
            status_sequence_done: None,
            rebooting_until: None,
            booted_at: Instant::now(),
        }
    }

    fn in_recovery(&self) -> bool {
        self.status.in_recovery()
    }

    fn is_old_recovery(&self) -> bool {
        self.in_recovery() && switch(&self.status.mock_old_recovery)
    }

    fn uptime_ms(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.booted_at)
            .as_millis() as u64
    }

    fn reboot(&mut self, duration: Duration) {
        info!("Simulating a reboot of {:?}", duration);
        let now = Instant::now();
        self.rebooting_until = Some(now + duration);
        self.booted_at = now + duration;
    }

    fn requeue_messages(&mut self) {
        let sent_time = self.uptime_ms();
        self.queue = self
            .boot_messages
            .iter()
            .cloned()
            .map(|mut m| {
                m.sent_time = sent_time;
                m
            })
            .collect();
        debug!("Re-queued {} messages", self.queue.len());
    }

    fn queue_message(&mut self, mut message: DeviceMessage) {
        message.sent_time = self.uptime_ms();
        debug!("Queued {:?} message: {}", message.class, message.message);
        self.queue.push(message);
    }

    fn finish_sequence(&mut self, after: AfterSequence, options: &MockOptions) {
        info!("Firmware update finished, leaving recovery");
        self.status.recovery = Some(0);
        if after == AfterSequence::Reboot {
            self.reboot(options.reboot_duration);
        }
        self.requeue_messages();
    }

    fn config_document(&self) -> ConfigDocument {
        if self.is_old_recovery() {
            debug!("Old recovery: config without gpio");
            ConfigDocument::Legacy(self.config.clone())
        } else {
            ConfigDocument::Full {
                config: self.config.clone(),
                gpio: Some(self.gpio.clone()),
            }
        }
    }

    /// Queue the download sequence for a new `fwurl`
    fn start_download(&mut self) {
        let failing = switch(&self.status.mock_fail_fw_update);
        let steps = if failing {
            fixtures::ota_download_fail()
        } else {
            fixtures::ota_download()
        };

        if !self.in_recovery() {
            self.status.recovery = Some(1);
            // Older recovery partitions do not send messages
            if !switch(&self.status.mock_old_recovery) {
                self.requeue_messages();
            }
        }

        info!("Queuing {} OTA messages", steps.len());
        if switch(&self.status.mock_old_recovery) {
            self.status_sequence.extend(steps);
            self.status_sequence_done = Some(AfterSequence::LeaveRecovery);
        } else {
            let last = steps.len().saturating_sub(1);
            self.message_sequence.extend(
                steps
                    .iter()
                    .enumerate()
                    .map(|(i, step)| fixtures::ota_message(step, failing && i == last)),
            );
            self.message_sequence_done = Some(AfterSequence::LeaveRecovery);
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    device: Arc<RwLock<DeviceState>>,
    options: MockOptions,
    message_polls: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(options: MockOptions) -> Self {
        Self {
            device: Arc::new(RwLock::new(DeviceState::new())),
            options,
            message_polls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Current status document, for inspection in tests
    pub async fn status(&self) -> Status {
        self.device.read().await.status.clone()
    }

    /// Number of `GET /messages.json` requests received, answered or not
    pub fn message_polls(&self) -> usize {
        self.message_polls.load(Ordering::SeqCst)
    }

    /// Hold the reply while a simulated reboot runs
    async fn wait_for_reboot(&self) {
        let until = self.device.read().await.rebooting_until;
        if let Some(until) = until.filter(|u| *u > Instant::now()) {
            debug!("Waiting for reboot to finish");
            sleep_until(until).await;
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status.json", get(get_status).post(post_status))
        .route("/config.json", get(get_config).post(post_config))
        .route("/commands.json", get(get_commands).post(post_commands))
        .route("/messages.json", get(get_messages))
        .route("/connect.json", axum::routing::post(connect).delete(disconnect))
        .route("/reboot.json", axum::routing::post(reboot))
        .route("/reboot_ota.json", axum::routing::post(reboot_ota))
        .route("/recovery.json", axum::routing::post(recovery))
        .route(
            "/flash.json",
            axum::routing::post(flash).layer(DefaultBodyLimit::disable()),
        )
        .route("/scan.json", get(scan))
        .route("/ap.json", get(access_points))
        .route("/plugins/SqueezeESP32/firmware/-check.bin", get(plugin_proxy))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the mock API until the listener fails
pub async fn serve(listener: TcpListener, options: MockOptions) -> anyhow::Result<()> {
    let app = router(AppState::new(options));
    axum::serve(listener, app).await?;
    Ok(())
}

/// Serve on an ephemeral local port in the background. Returns the address
/// and the state behind it.
pub async fn spawn(options: MockOptions) -> anyhow::Result<(SocketAddr, AppState)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = AppState::new(options);
    let app = router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Mock device stopped: {}", e);
        }
    });
    info!("Mock device listening on http://{}", addr);
    Ok((addr, state))
}

fn ok() -> Json<ResultReply> {
    Json(ResultReply::ok())
}

fn not_found(reason: &str) -> Response {
    debug!("404: {}", reason);
    StatusCode::NOT_FOUND.into_response()
}

async fn get_status(State(state): State<AppState>) -> Json<Status> {
    state.wait_for_reboot().await;
    let mut device = state.device.write().await;

    if let Some(step) = device.status_sequence.pop_front() {
        device.status.ota_pct = Some(step.ota_pct.unwrap_or(0.0));
        device.status.ota_dsc = Some(step.ota_dsc.unwrap_or_default());
        info!("Old recovery firmware update @{:?}%", device.status.ota_pct);
    } else if let Some(after) = device.status_sequence_done.take() {
        device.finish_sequence(after, &state.options);
    } else {
        device.status.ota_pct = None;
        device.status.ota_dsc = None;
    }

    device.status.message = None;
    if device.is_old_recovery() {
        if let Some(message) = device.message_sequence.pop_front() {
            device.status.message = Some(message.message);
        } else if let Some(after) = device.message_sequence_done.take() {
            device.finish_sequence(after, &state.options);
        }
    }

    Json(device.status.clone())
}

async fn post_status(
    State(state): State<AppState>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<ResultReply>, StatusCode> {
    state.wait_for_reboot().await;
    let mut device = state.device.write().await;

    let mut current =
        serde_json::to_value(&device.status).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if let Some(fields) = current.as_object_mut() {
        for (key, value) in update.status {
            info!("Status value {} set to {}", key, value);
            fields.insert(key, value);
        }
    }
    device.status = serde_json::from_value(current).map_err(|e| {
        warn!("Rejected status update: {}", e);
        StatusCode::BAD_REQUEST
    })?;
    Ok(ok())
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigDocument> {
    state.wait_for_reboot().await;
    Json(state.device.read().await.config_document())
}

async fn post_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Json<ResultReply> {
    state.wait_for_reboot().await;
    let mut device = state.device.write().await;

    let mut fwurl = None;
    for (key, entry) in update.config {
        if key == FWURL_KEY {
            fwurl = Some(entry.value_string());
            continue;
        }
        match device.config.get_mut(&key) {
            Some(current) if current.value != entry.value => {
                info!("Updated config value {}: {} -> {}", key, current.value, entry.value);
                current.value = entry.value;
            }
            Some(_) => {}
            None => {
                info!("Added config value {} [{}]", key, entry.value);
                device.config.insert(key, entry);
            }
        }
    }

    if let Some(url) = fwurl.filter(|u| !u.is_empty()) {
        info!("Firmware download requested from {}", url);
        device.start_download();
    }
    ok()
}

async fn get_commands(State(state): State<AppState>) -> Response {
    state.wait_for_reboot().await;
    let device = state.device.read().await;
    if device.is_old_recovery() {
        return not_found("old recovery has no commands backend");
    }
    Json(device.commands.clone()).into_response()
}

async fn post_commands(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> Response {
    state.wait_for_reboot().await;
    let mut device = state.device.write().await;
    if device.is_old_recovery() {
        return not_found("old recovery has no commands backend");
    }

    info!("Command: {}", request.command);
    let name = request
        .command
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    if device.commands.command(&name).is_some() {
        let options = parse_options(&request.command);
        let text = format!("Received Options: {}\n", serde_json::Value::Object(options));
        device.queue_message(fixtures::command_message(&name, &text));
    } else {
        warn!("Unknown command {}", name);
    }
    Json(json!({"Result": "Success"})).into_response()
}

/// `--long value`, `-s value` and bare flags, keyed by option name
fn parse_options(command: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in command.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    let mut options = serde_json::Map::new();
    let mut tokens = tokens.into_iter().skip(1).peekable();
    while let Some(token) = tokens.next() {
        let Some(name) = token.strip_prefix("--").or_else(|| token.strip_prefix('-')) else {
            continue;
        };
        let value = match tokens.peek() {
            Some(next) if !next.starts_with('-') => json!(tokens.next()),
            _ => json!(true),
        };
        options.insert(name.to_string(), value);
    }
    options
}

async fn get_messages(State(state): State<AppState>) -> Response {
    state.message_polls.fetch_add(1, Ordering::SeqCst);
    state.wait_for_reboot().await;
    let mut device = state.device.write().await;
    if device.is_old_recovery() {
        return not_found("old recovery has no messages backend");
    }

    if let Some(message) = device.message_sequence.pop_front() {
        device.queue_message(message);
    } else if let Some(after) = device.message_sequence_done.take() {
        device.finish_sequence(after, &state.options);
    }

    let now = device.uptime_ms();
    let messages: Vec<DeviceMessage> = std::mem::take(&mut device.queue)
        .into_iter()
        .map(|mut m| {
            m.current_time = now;
            m
        })
        .collect();
    Json(messages).into_response()
}

async fn connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> Json<ResultReply> {
    state.wait_for_reboot().await;
    info!("Connecting to {}", request.ssid);

    let delay = state.options.connect_delay;
    let device = state.device.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        let mut device = device.write().await;
        let has_ssid = device.status.ssid.as_deref().is_some_and(|s| !s.is_empty());
        let code = if request.ssid.contains("fail") {
            // The device goes back to the network it was on
            if has_ssid {
                ConnectReturnCode::Restore
            } else {
                ConnectReturnCode::Fail
            }
        } else {
            device.status.ssid = Some(request.ssid);
            ConnectReturnCode::Ok
        };
        info!("Connection attempt finished: {:?}", code);
        device.status.urc = Some(code.code());
    });
    ok()
}

async fn disconnect(State(state): State<AppState>) -> Json<ResultReply> {
    state.wait_for_reboot().await;
    state.device.write().await.status.ssid = Some(String::new());
    ok()
}

async fn reboot(
    State(state): State<AppState>,
    Json(_): Json<TimestampOnly>,
) -> Json<ResultReply> {
    state.wait_for_reboot().await;
    let mut device = state.device.write().await;
    device.reboot(state.options.reboot_duration);
    device.requeue_messages();
    ok()
}

async fn reboot_ota(
    State(state): State<AppState>,
    Json(_): Json<TimestampOnly>,
) -> Json<ResultReply> {
    state.wait_for_reboot().await;
    let mut device = state.device.write().await;
    device.status.recovery = Some(0);
    device.requeue_messages();
    device.reboot(state.options.reboot_duration);
    ok()
}

async fn recovery(State(state): State<AppState>, Json(_): Json<TimestampOnly>) -> Response {
    state.wait_for_reboot().await;
    let mut device = state.device.write().await;
    if switch(&device.status.mock_fail_recovery) {
        return not_found("recovery failure requested");
    }
    device.status.recovery = Some(1);
    device.requeue_messages();
    device.reboot(state.options.reboot_duration);
    ok().into_response()
}

async fn flash(State(state): State<AppState>, body: Bytes) -> Response {
    state.wait_for_reboot().await;
    let mut device = state.device.write().await;
    if !device.in_recovery() {
        return not_found("uploads need the recovery firmware");
    }
    if switch(&device.status.mock_fail_fw_update) || switch(&device.status.mock_old_recovery) {
        return not_found("old recovery, or firmware update failure requested");
    }

    let steps = fixtures::ota_flash();
    info!(
        "Received {} byte firmware image, queuing {} flash messages",
        body.len(),
        steps.len()
    );
    device
        .message_sequence
        .extend(steps.iter().map(|step| fixtures::ota_message(step, false)));
    device.message_sequence_done = Some(AfterSequence::Reboot);
    ok().into_response()
}

async fn scan(State(state): State<AppState>) -> Json<ResultReply> {
    state.wait_for_reboot().await;
    ok()
}

async fn access_points(State(state): State<AppState>) -> Json<Vec<AccessPoint>> {
    state.wait_for_reboot().await;
    Json(state.device.read().await.access_points.clone())
}

async fn plugin_proxy(State(state): State<AppState>) -> StatusCode {
    state.wait_for_reboot().await;
    let has_proxy = state
        .device
        .read()
        .await
        .status
        .mock_plugin_has_proxy
        .clone()
        .unwrap_or_default()
        .to_lowercase();
    if matches!(has_proxy.as_str(), "x" | "y") {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let options = parse_options(r#"cfg-syst-name --name "Living Room" -v --loudness 5"#);
        assert_eq!(options["name"], json!("Living Room"));
        assert_eq!(options["v"], json!(true));
        assert_eq!(options["loudness"], json!("5"));
    }

    #[test]
    fn test_download_goes_through_status_on_old_recovery() {
        let mut device = DeviceState::new();
        device.status.mock_old_recovery = Some("y".into());
        device.start_download();

        assert!(device.is_old_recovery());
        assert!(device.message_sequence.is_empty());
        assert_eq!(device.status_sequence.len(), fixtures::ota_download().len());
    }

    #[test]
    fn test_failing_download_ends_with_error() {
        let mut device = DeviceState::new();
        device.status.mock_fail_fw_update = Some("y".into());
        device.start_download();

        assert!(device.in_recovery());
        let last = device.message_sequence.back().unwrap();
        assert_eq!(last.kind, common::MessageType::Error);
        assert_eq!(device.message_sequence_done, Some(AfterSequence::LeaveRecovery));
    }

    #[test]
    fn test_finish_sequence_requeues_boot_messages() {
        let options = MockOptions {
            reboot_duration: Duration::from_millis(10),
            ..Default::default()
        };
        let mut device = DeviceState::new();
        device.queue.clear();
        device.status.recovery = Some(1);
        device.finish_sequence(AfterSequence::Reboot, &options);

        assert!(!device.in_recovery());
        assert!(device.rebooting_until.is_some());
        assert_eq!(device.queue.len(), device.boot_messages.len());
    }
}
