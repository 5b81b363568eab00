use std::{fmt, path::PathBuf};

use common::{OtaProgress, Status};
use log::{debug, info, warn};

use super::{text, OtaAction, OtaEvent, OtaState, OtaTarget};
use crate::error::OtaError;

type Listener = Box<dyn FnMut(&OtaEvent) + Send>;

/// Whether a status poll carries an OTA percentage worth applying.
///
/// Only a present, non-zero value counts. A recovery image that has not
/// started writing yet reports `0` in every poll, and applying it would
/// drag an idle machine into `Flashing`.
pub fn status_carries_progress(ota_pct: Option<f64>) -> bool {
    matches!(ota_pct, Some(pct) if pct != 0.0 && !pct.is_nan())
}

/// Firmware update progress and the transitions between [`OtaState`]s
pub struct FlashState {
    state: OtaState,
    status_text: String,
    percent: Option<u8>,
    target: Option<OtaTarget>,
    /// Last known device mode, from status polls
    recovery: bool,
    /// The recovery step already ran for the current update
    prev_recovery: bool,
    /// The device reports progress through status polls instead of messages
    older_recovery: bool,
    listeners: Vec<Listener>,
}

impl Default for FlashState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashState")
            .field("state", &self.state)
            .field("status_text", &self.status_text)
            .field("percent", &self.percent)
            .field("target", &self.target)
            .field("recovery", &self.recovery)
            .field("older_recovery", &self.older_recovery)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl FlashState {
    pub fn new() -> Self {
        Self {
            state: OtaState::None,
            status_text: String::new(),
            percent: None,
            target: None,
            recovery: false,
            prev_recovery: false,
            older_recovery: false,
            listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn percent(&self) -> Option<u8> {
        self.percent
    }

    pub fn target(&self) -> Option<&OtaTarget> {
        self.target.as_ref()
    }

    pub fn recovery(&self) -> bool {
        self.recovery
    }

    pub fn is_older_recovery(&self) -> bool {
        self.older_recovery
    }

    /// Something is being written to flash, either by us or by an update
    /// someone else started.
    pub fn is_flash_executing(&self) -> bool {
        self.state != OtaState::Uploading
            && (!self.status_text.is_empty() || self.percent.is_some())
    }

    /// No update running, a new one may start
    pub fn is_idle(&self) -> bool {
        matches!(self.state, OtaState::None | OtaState::Error)
    }

    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: FnMut(&OtaEvent) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Start an update from a URL or a local file, exactly one of them.
    pub fn start_ota(
        &mut self,
        url: Option<String>,
        file: Option<PathBuf>,
    ) -> Result<Vec<OtaAction>, OtaError> {
        if !self.is_idle() {
            return Err(OtaError::Busy(self.state));
        }
        if self.state == OtaState::Error {
            self.reset();
        }

        let target = match OtaTarget::from_inputs(url, file) {
            Ok(target) => target,
            Err(e) => {
                self.set_error(&e.to_string());
                return Err(e);
            }
        };

        info!("ota::start: {} (recovery={})", target, self.recovery);
        self.target = Some(target);
        self.prev_recovery = false;

        if self.recovery {
            self.enter(OtaState::Flashing);
            Ok(self.target_ready())
        } else {
            self.enter(OtaState::RebootToRecovery);
            self.set_status_text(text::STARTING_RECOVERY);
            Ok(vec![OtaAction::RebootToRecovery])
        }
    }

    /// Outcome of the `POST /recovery.json` issued for
    /// [`OtaAction::RebootToRecovery`].
    pub fn on_recovery_requested(&mut self, result: Result<(), String>) {
        if self.state != OtaState::RebootToRecovery {
            return;
        }
        match result {
            Ok(()) => self.set_status_text(text::WAITING_FOR_BOOT),
            Err(e) => self.set_error(&format!(
                "Unexpected error while trying to restart to recovery. ({})",
                e
            )),
        }
    }

    /// Apply a `/status.json` reply. Returns the action that hands the
    /// firmware over once the device is confirmed in recovery.
    pub fn on_status_poll(&mut self, status: &Status) -> Vec<OtaAction> {
        if status_carries_progress(status.ota_pct) {
            self.older_recovery = true;
            if let Some(pct) = status.ota_pct {
                self.set_percent(pct);
            }
        }
        if let Some(dsc) = status.ota_dsc.as_deref().filter(|d| !d.is_empty()) {
            self.older_recovery = true;
            self.set_status_text(dsc);
        }
        if let Some(recovery) = status.recovery {
            self.recovery = recovery == 1;
        }

        if self.state == OtaState::RebootToRecovery && self.recovery {
            return self.target_ready();
        }
        Vec::new()
    }

    /// Apply an OTA class message from `/messages.json`.
    pub fn on_ota_message(&mut self, progress: &OtaProgress) {
        if let Some(pct) = progress.ota_pct {
            self.set_percent(pct);
        }
        if let Some(dsc) = progress.ota_dsc.as_deref() {
            self.set_status_text(dsc);
        }
    }

    /// Bytes sent so far while uploading a firmware file
    pub fn on_upload_progress(&mut self, loaded: u64, total: u64) {
        if self.state != OtaState::Uploading {
            debug!("ota::upload: progress ignored in state {}", self.state);
            return;
        }
        if total == 0 {
            return;
        }
        let pct = (loaded.min(total) as f64 * 100.0 / total as f64).round();
        self.set_status_text(text::UPLOADING);
        self.set_percent(pct);
    }

    /// The upload request returned successfully
    pub fn on_upload_complete(&mut self) {
        if self.state == OtaState::Uploading {
            self.enter(OtaState::UploadComplete);
        }
    }

    pub fn set_percent(&mut self, pct: f64) {
        if self.state == OtaState::Error {
            debug!("ota::percent: {} ignored after error", pct);
            return;
        }
        let pct = pct.round().clamp(0.0, 100.0) as u8;
        if self.percent == Some(pct) {
            return;
        }

        match self.state {
            OtaState::Uploading | OtaState::Flashing => {
                if let Some(current) = self.percent {
                    if pct < current {
                        debug!("ota::percent: {} is behind {}, ignored", pct, current);
                        return;
                    }
                }
            }
            _ => self.enter(OtaState::Flashing),
        }

        self.percent = Some(pct);
        self.emit(OtaEvent::Progress(Some(pct)));

        if pct == 100 {
            match self.state {
                OtaState::Flashing => {
                    info!("ota::percent: flash complete");
                    self.enter(OtaState::Done);
                    self.reset();
                    return;
                }
                OtaState::Uploading => {
                    info!("ota::percent: upload complete, device is flashing");
                    self.percent = Some(0);
                    self.enter(OtaState::Flashing);
                    self.emit(OtaEvent::Progress(Some(0)));
                }
                _ => {}
            }
        }
        self.show_dialog();
    }

    pub fn set_status_text(&mut self, status_text: &str) {
        if self.status_text == status_text {
            return;
        }
        self.status_text = status_text.to_string();
        self.emit(OtaEvent::StatusText(self.status_text.clone()));
        self.show_dialog();
    }

    /// Enter [`OtaState::Error`]. The message stays visible until
    /// [`FlashState::reset`] or the next [`FlashState::start_ota`].
    pub fn set_error(&mut self, message: &str) {
        warn!("ota::error: {}", message);
        self.enter(OtaState::Error);
        if self.percent != Some(0) {
            self.percent = Some(0);
            self.emit(OtaEvent::Progress(Some(0)));
        }
        self.set_status_text(message);
    }

    pub fn reset(&mut self) {
        self.enter(OtaState::None);
        self.target = None;
        self.prev_recovery = false;
        self.older_recovery = false;
        if self.percent.take().is_some() {
            self.emit(OtaEvent::Progress(None));
        }
        if !self.status_text.is_empty() {
            self.status_text.clear();
            self.emit(OtaEvent::StatusText(String::new()));
        }
    }

    /// The device is in recovery; hand over the firmware. Runs once per
    /// update.
    fn target_ready(&mut self) -> Vec<OtaAction> {
        if !self.recovery {
            warn!("ota::target: device left recovery before the firmware was sent");
            return Vec::new();
        }
        if self.prev_recovery {
            return Vec::new();
        }
        self.prev_recovery = true;

        match self.target.clone() {
            Some(OtaTarget::File(path)) => {
                self.enter(OtaState::Uploading);
                self.set_status_text(text::SENDING_FILE);
                vec![OtaAction::UploadFirmware(path)]
            }
            Some(OtaTarget::Url(url)) => {
                self.enter(OtaState::SetFirmwareUrl);
                self.set_status_text(text::SENDING_URL);
                vec![OtaAction::SetFirmwareUrl(url)]
            }
            None => {
                self.set_error(text::NO_TARGET);
                Vec::new()
            }
        }
    }

    fn enter(&mut self, to: OtaState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("ota::state: {} -> {}", from, to);
        self.state = to;
        self.emit(OtaEvent::StateChanged { from, to });
    }

    fn show_dialog(&mut self) {
        if self.state != OtaState::None {
            self.emit(OtaEvent::ShowDialog);
        }
    }

    fn emit(&mut self, event: OtaEvent) {
        for listener in self.listeners.iter_mut() {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn status(recovery: u8) -> Status {
        Status {
            recovery: Some(recovery),
            ..Default::default()
        }
    }

    fn recording(flash: &mut FlashState) -> Arc<Mutex<Vec<OtaEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        flash.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    #[test]
    fn test_start_from_normal_mode_requests_recovery() {
        let mut flash = FlashState::new();
        let actions = flash
            .start_ota(Some("http://host/fw.bin".into()), None)
            .unwrap();

        assert_eq!(actions, vec![OtaAction::RebootToRecovery]);
        assert_eq!(flash.state(), OtaState::RebootToRecovery);
        assert_eq!(flash.status_text(), "Starting recovery mode.");
    }

    #[test]
    fn test_start_rejects_missing_or_double_target() {
        let mut flash = FlashState::new();
        assert_eq!(flash.start_ota(None, None), Err(OtaError::InvalidTarget));
        assert_eq!(flash.state(), OtaState::Error);
        assert_eq!(flash.status_text(), "Invalid url or file. Cannot start OTA");

        let mut flash = FlashState::new();
        let both = flash.start_ota(Some("http://a".into()), Some(PathBuf::from("fw.bin")));
        assert_eq!(both, Err(OtaError::InvalidTarget));

        let mut flash = FlashState::new();
        assert_eq!(
            flash.start_ota(Some("   ".into()), None),
            Err(OtaError::InvalidTarget)
        );
    }

    #[test]
    fn test_start_while_busy_is_refused() {
        let mut flash = FlashState::new();
        flash.start_ota(Some("http://a".into()), None).unwrap();
        assert_eq!(
            flash.start_ota(Some("http://b".into()), None),
            Err(OtaError::Busy(OtaState::RebootToRecovery))
        );
    }

    #[test]
    fn test_error_clears_on_new_start() {
        let mut flash = FlashState::new();
        flash.set_error("boom");
        flash.set_percent(50.0);
        assert_eq!(flash.state(), OtaState::Error);
        assert_eq!(flash.percent(), Some(0));

        let actions = flash.start_ota(Some("http://a".into()), None).unwrap();
        assert_eq!(actions, vec![OtaAction::RebootToRecovery]);
        assert_eq!(flash.state(), OtaState::RebootToRecovery);
    }

    #[test]
    fn test_url_target_ready_fires_once() {
        let mut flash = FlashState::new();
        flash.start_ota(Some("http://host/fw.bin".into()), None).unwrap();
        flash.on_recovery_requested(Ok(()));
        assert_eq!(flash.status_text(), "Waiting for system to boot.");

        // Still booting
        assert!(flash.on_status_poll(&status(0)).is_empty());
        assert_eq!(flash.state(), OtaState::RebootToRecovery);

        let actions = flash.on_status_poll(&status(1));
        assert_eq!(
            actions,
            vec![OtaAction::SetFirmwareUrl("http://host/fw.bin".into())]
        );
        assert_eq!(flash.state(), OtaState::SetFirmwareUrl);

        assert!(flash.on_status_poll(&status(1)).is_empty());
        assert_eq!(flash.state(), OtaState::SetFirmwareUrl);
    }

    #[test]
    fn test_file_target_uploads_once_after_recovery_boot() {
        let mut flash = FlashState::new();
        let actions = flash
            .start_ota(None, Some(PathBuf::from("squeezelite.bin")))
            .unwrap();
        assert_eq!(actions, vec![OtaAction::RebootToRecovery]);
        flash.on_recovery_requested(Ok(()));

        let mut actions = flash.on_status_poll(&status(1));
        actions.extend(flash.on_status_poll(&status(1)));
        let uploads = actions
            .iter()
            .filter(|a| matches!(a, OtaAction::UploadFirmware(_)))
            .count();
        assert_eq!(uploads, 1);
        assert_eq!(
            actions,
            vec![OtaAction::UploadFirmware(PathBuf::from("squeezelite.bin"))]
        );
        assert_eq!(flash.state(), OtaState::Uploading);
    }

    #[test]
    fn test_file_target_uploads_when_already_in_recovery() {
        let mut flash = FlashState::new();
        flash.on_status_poll(&status(1));

        let actions = flash
            .start_ota(None, Some(PathBuf::from("/tmp/fw.bin")))
            .unwrap();
        assert_eq!(
            actions,
            vec![OtaAction::UploadFirmware(PathBuf::from("/tmp/fw.bin"))]
        );
        assert_eq!(flash.state(), OtaState::Uploading);
    }

    #[test]
    fn test_recovery_request_failure_is_an_error() {
        let mut flash = FlashState::new();
        flash.start_ota(Some("http://a".into()), None).unwrap();
        flash.on_recovery_requested(Err("HTTP 500".into()));

        assert_eq!(flash.state(), OtaState::Error);
        assert!(flash
            .status_text()
            .starts_with("Unexpected error while trying to restart to recovery."));
    }

    #[test]
    fn test_percent_is_monotonic_until_done() {
        let mut flash = FlashState::new();
        let events = recording(&mut flash);

        for pct in [5.0, 20.0, 10.0, 45.0, 99.4] {
            flash.set_percent(pct);
            assert_eq!(flash.state(), OtaState::Flashing);
        }
        assert_eq!(flash.percent(), Some(99));

        flash.set_percent(100.0);
        assert_eq!(flash.state(), OtaState::None);
        assert_eq!(flash.percent(), None);

        let events = events.lock().unwrap();
        assert!(events.contains(&OtaEvent::StateChanged {
            from: OtaState::Flashing,
            to: OtaState::Done
        }));
        assert!(events.contains(&OtaEvent::StateChanged {
            from: OtaState::Done,
            to: OtaState::None
        }));
        assert!(!events.contains(&OtaEvent::Progress(Some(10))));
    }

    #[test]
    fn test_percent_is_clamped() {
        let mut flash = FlashState::new();
        flash.set_percent(-12.0);
        assert_eq!(flash.percent(), Some(0));
        assert_eq!(flash.state(), OtaState::Flashing);

        flash.set_percent(250.0);
        assert_eq!(flash.state(), OtaState::None);
    }

    #[test]
    fn test_upload_to_hundred_switches_to_flashing() {
        let mut flash = FlashState::new();
        flash.on_status_poll(&status(1));
        flash.start_ota(None, Some(PathBuf::from("fw.bin"))).unwrap();

        flash.on_upload_progress(512, 1024);
        assert_eq!(flash.percent(), Some(50));
        assert_eq!(flash.status_text(), "Uploading file to device");

        flash.on_upload_progress(1024, 1024);
        assert_eq!(flash.state(), OtaState::Flashing);
        assert_eq!(flash.percent(), Some(0));

        // Upload progress only counts while uploading
        flash.on_upload_progress(10, 1024);
        assert_eq!(flash.percent(), Some(0));
    }

    #[test]
    fn test_status_poll_progress() {
        let mut flash = FlashState::new();
        flash.set_percent(10.0);

        let poll = Status {
            ota_pct: Some(45.0),
            ota_dsc: Some("Writing".into()),
            ..Default::default()
        };
        flash.on_status_poll(&poll);

        assert_eq!(flash.percent(), Some(45));
        assert_eq!(flash.status_text(), "Writing");
        assert!(flash.is_older_recovery());
    }

    #[test]
    fn test_status_poll_zero_percent_is_not_progress() {
        assert!(!status_carries_progress(None));
        assert!(!status_carries_progress(Some(0.0)));
        assert!(status_carries_progress(Some(0.5)));

        let mut flash = FlashState::new();
        flash.on_status_poll(&Status {
            ota_pct: Some(0.0),
            ..Default::default()
        });
        assert_eq!(flash.state(), OtaState::None);
        assert!(!flash.is_older_recovery());
    }

    #[test]
    fn test_ota_message_while_idle_shows_foreign_flash() {
        let mut flash = FlashState::new();
        let events = recording(&mut flash);

        flash.on_ota_message(&OtaProgress {
            ota_pct: Some(30.0),
            ota_dsc: Some("Downloading".into()),
        });

        assert_eq!(flash.state(), OtaState::Flashing);
        assert!(flash.is_flash_executing());
        assert!(events.lock().unwrap().contains(&OtaEvent::ShowDialog));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut flash = FlashState::new();
        flash.start_ota(Some("http://a".into()), None).unwrap();
        flash.set_percent(20.0);
        flash.reset();

        assert_eq!(flash.state(), OtaState::None);
        assert_eq!(flash.percent(), None);
        assert_eq!(flash.status_text(), "");
        assert!(flash.target().is_none());
        assert!(!flash.is_flash_executing());
    }
}
