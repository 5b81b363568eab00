use std::{fmt, path::PathBuf};

use crate::error::OtaError;

/// OTA state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OtaState {
    /// No update in progress
    None,
    /// Reboot into recovery requested, waiting for the device to report it
    RebootToRecovery,
    /// Firmware URL sent to the recovery image
    SetFirmwareUrl,
    /// Device is writing the new image
    Flashing,
    /// Image written; the machine resets right after entering this
    Done,
    /// Local file being sent to the recovery image
    Uploading,
    /// Update failed; stays here until reset or a new start
    Error,
    /// Upload request finished before the device reported any progress
    UploadComplete,
}

impl fmt::Display for OtaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::RebootToRecovery => "REBOOT_TO_RECOVERY",
            Self::SetFirmwareUrl => "SET_FWURL",
            Self::Flashing => "FLASHING",
            Self::Done => "DONE",
            Self::Uploading => "UPLOADING",
            Self::Error => "ERROR",
            Self::UploadComplete => "UPLOADCOMPLETE",
        };
        f.write_str(name)
    }
}

/// Where the new firmware comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaTarget {
    /// The recovery image downloads the binary itself
    Url(String),
    /// The binary is uploaded from this machine
    File(PathBuf),
}

impl OtaTarget {
    /// Exactly one of the two inputs must be given. Blank URLs count as
    /// missing.
    pub fn from_inputs(url: Option<String>, file: Option<PathBuf>) -> Result<Self, OtaError> {
        let url = url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
        let file = file.filter(|f| !f.as_os_str().is_empty());

        match (url, file) {
            (Some(url), None) => Ok(Self::Url(url)),
            (None, Some(file)) => Ok(Self::File(file)),
            _ => Err(OtaError::InvalidTarget),
        }
    }
}

impl fmt::Display for OtaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => write!(f, "url {}", url),
            Self::File(path) => write!(f, "file {}", path.display()),
        }
    }
}

/// Side effect requested by a transition. The caller performs it and feeds
/// the outcome back into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaAction {
    /// `POST /recovery.json`
    RebootToRecovery,
    /// `POST /flash.json` with the file contents
    UploadFirmware(PathBuf),
    /// `POST /config.json` with `fwurl`
    SetFirmwareUrl(String),
}

/// Notification for whoever renders the update dialog
#[derive(Debug, Clone, PartialEq)]
pub enum OtaEvent {
    StateChanged { from: OtaState, to: OtaState },
    /// `None` once the machine is reset
    Progress(Option<u8>),
    StatusText(String),
    /// The update dialog should be visible
    ShowDialog,
}
