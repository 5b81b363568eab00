use serde::{Deserialize, Serialize};

/// Severity attached to every device message
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "MESSAGING_INFO")]
    Info,
    #[serde(rename = "MESSAGING_WARNING")]
    Warning,
    #[serde(rename = "MESSAGING_ERROR")]
    Error,
}

/// What a message is about, which decides how its payload is decoded
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageClass {
    /// Payload is an [`OtaProgress`] JSON document
    #[serde(rename = "MESSAGING_CLASS_OTA")]
    Ota,
    #[serde(rename = "MESSAGING_CLASS_SYSTEM")]
    System,
    /// Payload is a [`TaskStats`] JSON document
    #[serde(rename = "MESSAGING_CLASS_STATS")]
    Stats,
    /// Payload is `"<command name>\n<text>"`
    #[serde(rename = "MESSAGING_CLASS_CFGCMD")]
    CfgCmd,
    /// Payload is a JSON list of [`BtSink`]
    #[serde(rename = "MESSAGING_CLASS_BT")]
    Bt,
    #[serde(other)]
    Unknown,
}

/// One entry from `GET /messages.json`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceMessage {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub class: MessageClass,
    #[serde(default)]
    pub sent_time: u64,
    #[serde(default)]
    pub current_time: u64,
}

impl DeviceMessage {
    /// How long ago, in device milliseconds, the message was queued
    pub fn age_ms(&self) -> u64 {
        self.current_time.saturating_sub(self.sent_time)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ota_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ota_dsc: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    #[serde(default)]
    pub ntasks: u32,
    #[serde(default)]
    pub tasks: Option<Vec<TaskInfo>>,
}

/// FreeRTOS task snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task name
    pub nme: String,
    /// CPU percentage
    pub cpu: u32,
    /// FreeRTOS `eTaskState`
    pub st: u8,
    /// Minimum free stack seen
    pub minstk: u32,
    /// Base priority
    pub bprio: u32,
    /// Current priority
    pub cprio: u32,
    pub num: u32,
}

impl TaskInfo {
    pub fn state_name(&self) -> &'static str {
        match self.st {
            0 => "eRunning",
            1 => "eReady",
            2 => "eBlocked",
            3 => "eSuspended",
            4 => "eDeleted",
            _ => "eInvalid",
        }
    }
}

/// Bluetooth sink discovered by the device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtSink {
    pub name: String,
    pub rssi: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_decoding() {
        let raw = r#"[
            {"message": "{\"ota_pct\": 10, \"ota_dsc\": \"Downloading\"}", "type": "MESSAGING_INFO", "class": "MESSAGING_CLASS_OTA", "sent_time": 100, "current_time": 350},
            {"message": "hello", "type": "MESSAGING_WARNING", "class": "MESSAGING_CLASS_SOMETHING_NEW"}
        ]"#;
        let messages: Vec<DeviceMessage> = serde_json::from_str(raw).unwrap();

        assert_eq!(messages[0].class, MessageClass::Ota);
        assert_eq!(messages[0].age_ms(), 250);
        let progress: OtaProgress = serde_json::from_str(&messages[0].message).unwrap();
        assert_eq!(progress.ota_pct, Some(10.0));

        assert_eq!(messages[1].class, MessageClass::Unknown);
        assert_eq!(messages[1].kind, MessageType::Warning);
        assert_eq!(messages[1].age_ms(), 0);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(MessageType::Info < MessageType::Warning);
        assert!(MessageType::Warning < MessageType::Error);
    }
}
