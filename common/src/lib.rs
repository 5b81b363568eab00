//! JSON payloads exchanged with a Squeezelite-ESP32 device over its local
//! HTTP API.
//!
//! Every type here mirrors what the device firmware puts on the wire, so
//! field names follow the firmware (including its inconsistent casing).

pub mod commands;
pub mod config;
pub mod messages;
pub mod request;
pub mod status;
pub mod wifi;

pub use commands::{ArgSpec, CommandSpec, CommandsDocument};
pub use config::{ConfigDocument, ConfigEntry, ConfigMap, GpioEntry, NvsType};
pub use messages::{BtSink, DeviceMessage, MessageClass, MessageType, OtaProgress, TaskInfo, TaskStats};
pub use request::{
    now_ms, CommandRequest, ConfigUpdate, ConnectRequest, ResultReply, StatusUpdate, TimestampOnly,
};
pub use status::{ConnectReturnCode, Status};
pub use wifi::AccessPoint;

/// Device endpoints, relative to the device base URL.
pub mod endpoints {
    pub const STATUS: &str = "/status.json";
    pub const CONFIG: &str = "/config.json";
    pub const COMMANDS: &str = "/commands.json";
    pub const CONNECT: &str = "/connect.json";
    pub const REBOOT: &str = "/reboot.json";
    pub const REBOOT_OTA: &str = "/reboot_ota.json";
    pub const RECOVERY: &str = "/recovery.json";
    pub const FLASH: &str = "/flash.json";
    pub const SCAN: &str = "/scan.json";
    pub const AP: &str = "/ap.json";
    pub const MESSAGES: &str = "/messages.json";
}
