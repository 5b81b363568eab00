use serde::{Deserialize, Serialize};

/// Snapshot returned by `GET /status.json`.
///
/// The device omits whatever it does not know yet, so everything is
/// optional. The `mock_*` switches are only understood by the mock device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    /// Update result code of the last connection attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urc: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    /// 1 while the device runs its recovery firmware
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ota_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ota_dsc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_name: Option<String>,
    #[serde(rename = "Voltage", skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[serde(rename = "Jack", skip_serializing_if = "Option::is_none")]
    pub jack: Option<serde_json::Value>,
    /// Output sample depth, 16 or 32
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u8>,
    /// Legacy message channel used by older recovery firmwares
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_i2c_locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lms_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lms_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bt_status: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bt_sub_status: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mock_old_recovery: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mock_fail_recovery: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mock_fail_fw_update: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mock_plugin_has_proxy: Option<String>,
}

impl Status {
    /// Whether the device reported that it runs the recovery firmware
    pub fn in_recovery(&self) -> bool {
        self.recovery == Some(1)
    }

    pub fn connect_code(&self) -> Option<ConnectReturnCode> {
        self.urc.and_then(ConnectReturnCode::from_code)
    }

    /// The jack detection field comes as either a number or a numeric string
    pub fn jack_inserted(&self) -> bool {
        match &self.jack {
            Some(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().is_ok_and(|v| v != 0.0),
            Some(serde_json::Value::Bool(b)) => *b,
            _ => false,
        }
    }
}

/// Result of the last connection attempt, as reported in `urc`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Ok,
    Fail,
    Disconnected,
    Lost,
    Restore,
    Ethernet,
}

impl ConnectReturnCode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::Fail),
            2 => Some(Self::Disconnected),
            3 => Some(Self::Lost),
            4 => Some(Self::Restore),
            5 => Some(Self::Ethernet),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Fail => 1,
            Self::Disconnected => 2,
            Self::Lost => 3,
            Self::Restore => 4,
            Self::Ethernet => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parses_partial_document() {
        let status: Status = serde_json::from_str(
            r#"{"recovery": 1, "ota_pct": 45, "ota_dsc": "Writing partition", "Voltage": 7.6}"#,
        )
        .unwrap();

        assert!(status.in_recovery());
        assert_eq!(status.ota_pct, Some(45.0));
        assert_eq!(status.ota_dsc.as_deref(), Some("Writing partition"));
        assert_eq!(status.voltage, Some(7.6));
        assert_eq!(status.ssid, None);
    }

    #[test]
    fn test_status_skips_unknown_fields_on_output() {
        let status = Status {
            urc: Some(0),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&status).unwrap(), r#"{"urc":0}"#);
    }

    #[test]
    fn test_jack_accepts_numbers_and_strings() {
        let mut status = Status::default();
        assert!(!status.jack_inserted());

        status.jack = Some(serde_json::json!("1"));
        assert!(status.jack_inserted());

        status.jack = Some(serde_json::json!(0));
        assert!(!status.jack_inserted());
    }

    #[test]
    fn test_connect_codes() {
        for code in 0..=5 {
            assert_eq!(ConnectReturnCode::from_code(code).unwrap().code(), code);
        }
        assert_eq!(ConnectReturnCode::from_code(9), None);
    }
}
