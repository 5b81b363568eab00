//! Poll loop that keeps a device's state in sync and drives firmware updates
//!
//! One task owns everything: the OTA state machine, the message log, the
//! last status. It interleaves the status poll, the message poll, requests
//! from the caller and upload progress with `tokio::select!`. The firmware
//! upload is the only work that runs on its own task; it reports back over
//! a channel.

use std::{
    path::PathBuf,
    time::{Duration, SystemTime},
};

use common::{
    BtSink, CommandsDocument, ConfigDocument, ConfigUpdate, DeviceMessage, MessageType, Status,
    TaskInfo,
};
use log::{debug, info, warn};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};

use crate::{
    client::{DeviceClient, RebootKind},
    config::Settings,
    error::{ApiError, ControllerClosed, OtaError},
    messages::{Dispatch, LogEntry, LogSource, MessageLog, SinkList},
    network,
    nvs,
    ota::{text, FlashState, OtaAction, OtaEvent, OtaState},
};

/// Endpoints an older firmware may not implement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Messages,
    Commands,
}

#[derive(Debug)]
pub enum Request {
    /// Start a firmware update from exactly one of a URL or a local file
    Flash {
        url: Option<String>,
        file: Option<PathBuf>,
    },
    Reboot(RebootKind),
    /// Run a console command; `apply` reboots once it succeeds
    RunCommand { command: String, apply: bool },
    SaveConfig { update: ConfigUpdate, apply: bool },
    /// Clear a finished or failed update
    ResetOta,
    /// Fetch commands and config again
    Refresh,
    ClearLog,
}

#[derive(Debug, Clone)]
pub enum Event {
    Ota(OtaEvent),
    OtaRejected(OtaError),
    Status(Status),
    ConnectionChanged(Status),
    RecoveryChanged(bool),
    Log(LogEntry),
    Commands(CommandsDocument),
    Config(ConfigDocument),
    CommandResult {
        command: String,
        kind: MessageType,
        text: String,
    },
    /// Task table, busiest first. Empty after a reboot.
    Tasks(Vec<TaskInfo>),
    BtSinks(Vec<BtSink>),
    FeatureUnavailable(Feature),
    Rebooting(RebootKind),
}

enum UploadEvent {
    Progress { sent: u64, total: u64 },
    Finished(Result<(), ApiError>),
}

/// Status poll delay: doubles while the device does not answer, back to
/// the base interval on the first answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn fail(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.max);
        self.current
    }

    pub fn reset(&mut self) -> Duration {
        self.current = self.base;
        self.current
    }
}

/// Sending half used by the caller
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    requests: mpsc::Sender<Request>,
}

impl ControllerHandle {
    pub async fn send(&self, request: Request) -> Result<(), ControllerClosed> {
        self.requests.send(request).await.map_err(|_| ControllerClosed)
    }

    pub async fn flash_url(&self, url: impl Into<String>) -> Result<(), ControllerClosed> {
        self.send(Request::Flash {
            url: Some(url.into()),
            file: None,
        })
        .await
    }

    pub async fn flash_file(&self, file: impl Into<PathBuf>) -> Result<(), ControllerClosed> {
        self.send(Request::Flash {
            url: None,
            file: Some(file.into()),
        })
        .await
    }

    pub async fn reboot(&self, kind: RebootKind) -> Result<(), ControllerClosed> {
        self.send(Request::Reboot(kind)).await
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct DeviceController {
    client: DeviceClient,
    settings: Settings,
    flash: FlashState,
    log: MessageLog,
    sinks: SinkList,
    last_status: Option<Status>,
    recovery: Option<bool>,
    messages_held: bool,
    backoff: Backoff,
    next_status: Instant,
    next_messages: Option<Instant>,
    reboot_at: Option<(Instant, RebootKind)>,
    refresh_at: Option<Instant>,
    events: mpsc::UnboundedSender<Event>,
    uploads: mpsc::UnboundedSender<UploadEvent>,
}

impl DeviceController {
    /// Start the controller on its own task
    pub fn spawn(
        client: DeviceClient,
        settings: Settings,
    ) -> (ControllerHandle, mpsc::UnboundedReceiver<Event>, JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();

        let controller = Self::init(client, settings, event_tx, upload_tx);
        let handle = tokio::spawn(controller.start(request_rx, upload_rx));

        (
            ControllerHandle {
                requests: request_tx,
            },
            event_rx,
            handle,
        )
    }

    fn init(
        client: DeviceClient,
        settings: Settings,
        events: mpsc::UnboundedSender<Event>,
        uploads: mpsc::UnboundedSender<UploadEvent>,
    ) -> Self {
        let mut flash = FlashState::new();
        let ota_events = events.clone();
        flash.subscribe(move |event| {
            let _ = ota_events.send(Event::Ota(event.clone()));
        });

        let now = Instant::now();
        Self {
            client,
            backoff: Backoff::new(settings.status_interval(), settings.max_backoff()),
            flash,
            log: MessageLog::new(),
            sinks: SinkList::default(),
            last_status: None,
            recovery: None,
            messages_held: false,
            next_status: now,
            next_messages: Some(now),
            reboot_at: None,
            // Commands and config are loaded once at start
            refresh_at: Some(now),
            events,
            uploads,
            settings,
        }
    }

    async fn start(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut uploads: mpsc::UnboundedReceiver<UploadEvent>,
    ) {
        info!("controller: watching {}", self.client.base_url());
        loop {
            let reboot_at = self.reboot_at.map(|(at, _)| at);
            tokio::select! {
                biased;
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(upload) = uploads.recv() => self.handle_upload(upload),
                () = sleep_until_some(reboot_at) => self.fire_reboot().await,
                () = sleep_until(self.next_status) => {
                    let delay = self.poll_status().await;
                    self.next_status = Instant::now() + delay;
                }
                () = sleep_until_some(self.next_messages) => self.poll_messages().await,
                () = sleep_until_some(self.refresh_at) => {
                    self.refresh_at = None;
                    self.refresh().await;
                }
            }
        }
        info!("controller: stopped");
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn log_local(&mut self, kind: MessageType, text: &str) {
        let entry = self.log.local(kind, text);
        self.emit(Event::Log(entry));
    }

    fn report(&mut self, error: &ApiError) {
        if error.is_timeout() {
            debug!("controller: {}", error);
        } else {
            self.log_local(MessageType::Error, &error.to_string());
        }
    }

    async fn handle_request(&mut self, request: Request) {
        debug!("controller: request {:?}", request);
        match request {
            Request::Flash { url, file } => match self.flash.start_ota(url, file) {
                Ok(actions) => self.execute(actions).await,
                Err(e) => {
                    warn!("controller: update refused: {}", e);
                    self.emit(Event::OtaRejected(e));
                }
            },
            Request::Reboot(kind) => self.schedule_reboot(kind),
            Request::RunCommand { command, apply } => self.run_command(&command, apply).await,
            Request::SaveConfig { update, apply } => match self.client.post_config(&update).await {
                Ok(_) => {
                    self.log_local(MessageType::Info, "Configuration saved.");
                    if apply {
                        self.schedule_reboot(RebootKind::Normal);
                    }
                }
                Err(e) => self.report(&e),
            },
            Request::ResetOta => self.flash.reset(),
            Request::Refresh => self.refresh().await,
            Request::ClearLog => self.log.clear(),
        }
    }

    async fn run_command(&mut self, command: &str, apply: bool) {
        let name = command.split_whitespace().next().unwrap_or_default().to_string();
        match self.client.run_command(command).await {
            Ok(reply) if reply.is_success() => {
                if apply {
                    self.schedule_reboot(RebootKind::Normal);
                }
            }
            Ok(reply) => self.emit(Event::CommandResult {
                command: name,
                kind: MessageType::Error,
                text: format!("Command failed: {}", reply.result.unwrap_or_default()),
            }),
            Err(e) if e.is_not_found() => {
                let text = if self.recovery == Some(true) {
                    "Limited recovery mode active. Unsupported action"
                } else {
                    "Unexpected error while processing command"
                };
                self.emit(Event::CommandResult {
                    command: name,
                    kind: MessageType::Error,
                    text: text.to_string(),
                });
            }
            Err(e) => {
                self.report(&e);
                self.emit(Event::CommandResult {
                    command: name,
                    kind: MessageType::Error,
                    text: format!("Unexpected error {}", e),
                });
            }
        }
    }

    fn schedule_reboot(&mut self, kind: RebootKind) {
        let at = Instant::now() + self.settings.reboot_delay();
        self.reboot_at = Some((at, kind));
    }

    async fn fire_reboot(&mut self) {
        let Some((_, kind)) = self.reboot_at.take() else {
            return;
        };
        info!("controller: rebooting ({:?})", kind);
        self.log_local(MessageType::Warning, "System is rebooting.");
        self.emit(Event::Rebooting(kind));
        self.emit(Event::Tasks(Vec::new()));
        self.sinks.clear();

        if let Err(e) = self.client.reboot(kind).await {
            self.report(&e);
        }
        self.refresh_at = Some(Instant::now() + self.settings.refresh_after_reboot());
    }

    async fn execute(&mut self, actions: Vec<OtaAction>) {
        for action in actions {
            match action {
                OtaAction::RebootToRecovery => {
                    let result = self.client.recovery().await;
                    if let Err(e) = &result {
                        self.report(e);
                    }
                    self.flash
                        .on_recovery_requested(result.map(|_| ()).map_err(|e| e.to_string()));
                }
                OtaAction::SetFirmwareUrl(url) => {
                    if let Err(e) = self.client.post_config(&nvs::fwurl_update(&url)).await {
                        self.report(&e);
                        self.flash
                            .set_error(&format!("Unable to send the firmware location. ({})", e));
                    }
                }
                OtaAction::UploadFirmware(path) => self.spawn_upload(path),
            }
        }
    }

    fn spawn_upload(&self, path: PathBuf) {
        let client = self.client.clone();
        let uploads = self.uploads.clone();
        tokio::spawn(async move {
            let progress = uploads.clone();
            let result = client
                .flash(&path, move |sent, total| {
                    let _ = progress.send(UploadEvent::Progress { sent, total });
                })
                .await;
            let _ = uploads.send(UploadEvent::Finished(result.map(|_| ())));
        });
    }

    fn handle_upload(&mut self, upload: UploadEvent) {
        match upload {
            UploadEvent::Progress { sent, total } => self.flash.on_upload_progress(sent, total),
            UploadEvent::Finished(Ok(())) => {
                info!("controller: firmware upload accepted");
                self.flash.on_upload_complete();
            }
            UploadEvent::Finished(Err(e)) => {
                warn!("controller: firmware upload failed: {}", e);
                if e.is_not_found() || e.is_timeout() {
                    self.flash.set_error(text::UPLOAD_UNSUPPORTED);
                } else {
                    self.flash.set_error(&format!("Upload failed. ({})", e));
                }
            }
        }
    }

    /// Poll `status.json` and return the delay before the next poll
    async fn poll_status(&mut self) -> Duration {
        match self.client.status().await {
            Ok(status) => {
                self.apply_status(status).await;
                self.backoff.reset()
            }
            Err(e) if e.is_timeout() => {
                let delay = self.backoff.fail();
                debug!("controller: no status, next try in {:?}", delay);
                delay
            }
            Err(e) => {
                self.report(&e);
                self.backoff.reset()
            }
        }
    }

    async fn apply_status(&mut self, status: Status) {
        let recovery = status.in_recovery();
        let left_recovery = self.recovery == Some(true) && !recovery;
        if self.recovery != Some(recovery) {
            info!("controller: device is in {} mode", if recovery { "recovery" } else { "normal" });
            self.recovery = Some(recovery);
            self.emit(Event::RecoveryChanged(recovery));
        }
        if !recovery && self.messages_held {
            info!("controller: device left recovery, polling messages again");
            self.messages_held = false;
            self.next_messages = Some(Instant::now() + self.settings.message_interval());
        }

        if network::has_connection_changed(self.last_status.as_ref(), &status) {
            self.emit(Event::ConnectionChanged(status.clone()));
        }

        if let Some(entry) = self.log.status_message(status.message.as_deref()) {
            self.emit(Event::Log(entry));
        }

        if left_recovery && self.flash_not_started() {
            self.flash.set_error(text::LEFT_RECOVERY);
        }

        let actions = self.flash.on_status_poll(&status);
        self.emit(Event::Status(status.clone()));
        self.last_status = Some(status);
        self.execute(actions).await;
    }

    /// An update was handed to the recovery firmware but no flash progress
    /// came back. Once some has, the device may reboot before its last
    /// progress message is polled, so leaving recovery is not a failure.
    fn flash_not_started(&self) -> bool {
        match self.flash.state() {
            OtaState::SetFirmwareUrl | OtaState::UploadComplete => true,
            OtaState::Flashing => self.flash.percent().unwrap_or(0) == 0,
            _ => false,
        }
    }

    async fn poll_messages(&mut self) {
        let interval = self.settings.message_interval();
        match self.client.messages().await {
            Ok(messages) => {
                for message in &messages {
                    self.dispatch(message);
                }
                self.next_messages = Some(Instant::now() + interval);
            }
            Err(e) if e.is_not_found() => {
                info!("controller: {} unavailable, holding message polls", e);
                self.messages_held = true;
                self.next_messages = None;
                self.emit(Event::FeatureUnavailable(Feature::Messages));
            }
            Err(e) if e.is_timeout() => {
                self.report(&e);
                self.next_messages = Some(Instant::now() + interval * 2);
            }
            Err(e) => {
                self.report(&e);
                self.next_messages = Some(Instant::now() + interval);
            }
        }
    }

    fn dispatch(&mut self, message: &DeviceMessage) {
        let dispatched = match Dispatch::decode(message) {
            Ok(dispatched) => dispatched,
            Err(e) => {
                self.log_local(
                    MessageType::Error,
                    &format!("Unable to decode {:?} message: {}", message.class, e),
                );
                return;
            }
        };

        match dispatched {
            Dispatch::Ota(progress) if message.kind == MessageType::Error => {
                let text = progress.ota_dsc.as_deref().unwrap_or(text::UPDATE_FAILED);
                self.flash.set_error(text);
            }
            Dispatch::Ota(progress) => self.flash.on_ota_message(&progress),
            Dispatch::Stats { tasks, .. } => self.emit(Event::Tasks(tasks)),
            Dispatch::System(message) => {
                let entry = self.log.device(&message);
                self.emit(Event::Log(entry));
            }
            Dispatch::CommandResult {
                command,
                kind,
                text,
            } => self.emit(Event::CommandResult {
                command,
                kind,
                text,
            }),
            Dispatch::BtSinks(found) => {
                for sink in self.sinks.merge(&found) {
                    let text = format!("BT Audio device found: {} RSSI: {}", sink.name, sink.rssi);
                    let entry =
                        self.log
                            .push(message.kind, &text, SystemTime::now(), LogSource::Device);
                    self.emit(Event::Log(entry));
                }
                self.emit(Event::BtSinks(self.sinks.sinks().to_vec()));
            }
            Dispatch::Unknown(_) => {}
        }
    }

    async fn refresh(&mut self) {
        match self.client.commands().await {
            Ok(commands) => self.emit(Event::Commands(commands)),
            Err(e) if e.is_not_found() => {
                info!("controller: {} unavailable", e);
                self.emit(Event::FeatureUnavailable(Feature::Commands));
            }
            Err(e) => self.report(&e),
        }
        match self.client.config().await {
            Ok(config) => self.emit(Event::Config(config)),
            Err(e) => self.report(&e),
        }
    }
}
