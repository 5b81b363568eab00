use std::{path::Path, time::Duration};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

/// Default settings file, looked up in the working directory
pub const SETTINGS_FILE: &str = "squeezectl.ron";

pub const DEFAULT_RELEASE_URL: &str =
    "https://api.github.com/repos/sle118/squeezelite-esp32/releases";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the device, e.g. `http://192.168.4.1`
    pub device_url: String,
    pub status_interval_ms: u64,
    pub message_interval_ms: u64,
    /// Timeout for `commands.json` and `config.json`
    pub command_timeout_ms: u64,
    /// Timeout for `scan.json` and `ap.json`
    pub scan_timeout_ms: u64,
    /// Pause before a reboot request is sent
    pub reboot_delay_ms: u64,
    /// Commands and config are fetched again this long after a reboot
    pub refresh_after_reboot_ms: u64,
    /// Upper bound for the status poll delay while the device is unreachable
    pub max_backoff_ms: u64,
    pub release_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_url: "http://192.168.4.1".to_string(),
            status_interval_ms: 2000,
            message_interval_ms: 2500,
            command_timeout_ms: 7000,
            scan_timeout_ms: 3000,
            reboot_delay_ms: 500,
            refresh_after_reboot_ms: 6000,
            max_backoff_ms: 30_000,
            release_url: DEFAULT_RELEASE_URL.to_string(),
        }
    }
}

impl Settings {
    /// Load [`SETTINGS_FILE`] if it exists, defaults otherwise
    pub fn load() -> Result<Settings, Error> {
        if Path::new(SETTINGS_FILE).exists() {
            Self::load_from(SETTINGS_FILE)
        } else {
            Ok(Settings::default())
        }
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Settings, Error> {
        let path = path.as_ref();
        let settings = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings: Settings =
            ron::from_str(&settings).with_context(|| format!("parsing {}", path.display()))?;
        Ok(settings)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn message_interval(&self) -> Duration {
        Duration::from_millis(self.message_interval_ms)
    }

    pub fn reboot_delay(&self) -> Duration {
        Duration::from_millis(self.reboot_delay_ms)
    }

    pub fn refresh_after_reboot(&self) -> Duration {
        Duration::from_millis(self.refresh_after_reboot_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
