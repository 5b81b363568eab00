use serde::{Deserialize, Serialize};

/// One row of `GET /ap.json`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPoint {
    pub ssid: String,
    #[serde(default)]
    pub chan: u8,
    pub rssi: i32,
    /// 0 means open
    #[serde(default)]
    pub auth: u8,
}

impl AccessPoint {
    pub fn is_open(&self) -> bool {
        self.auth == 0
    }
}
