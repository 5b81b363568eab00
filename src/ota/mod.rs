//! Firmware update (OTA) state machine
//!
//! The device can only flash itself from its recovery image, so an update
//! is a short sequence: ask the device to reboot into recovery, wait for a
//! status poll to confirm it, hand it the firmware (upload or download URL),
//! then follow the percentage it reports until 100%.
//!
//! [`FlashState`] holds the whole sequence. Its transitions never perform
//! I/O; they return [`OtaAction`]s for the caller to execute and notify
//! subscribers with [`OtaEvent`]s so a UI can render without polling it.

pub mod machine;
pub mod types;

pub use machine::{status_carries_progress, FlashState};
pub use types::{OtaAction, OtaEvent, OtaState, OtaTarget};

/// Status texts shown while the sequence runs
pub mod text {
    pub const STARTING_RECOVERY: &str = "Starting recovery mode.";
    pub const WAITING_FOR_BOOT: &str = "Waiting for system to boot.";
    pub const SENDING_URL: &str = "Sending firmware download location.";
    pub const SENDING_FILE: &str = "Sending file to device.";
    pub const UPLOADING: &str = "Uploading file to device";
    pub const UPLOAD_UNSUPPORTED: &str =
        "Upload Failed. Recovery version might not support uploading. Please use web update instead.";
    pub const NO_TARGET: &str = "Invalid URL or file name while trying to start the OTA process";
    pub const UPDATE_FAILED: &str = "Firmware update failed.";
    pub const LEFT_RECOVERY: &str = "The device left recovery before the update completed.";
}
