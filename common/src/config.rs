use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration keys, sorted by name
pub type ConfigMap = BTreeMap<String, ConfigEntry>;

/// A single NVS entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub value: serde_json::Value,
    /// Raw NVS type code, see [`NvsType`]
    #[serde(rename = "type", default = "default_nvs_type")]
    pub nvs_type: u8,
}

fn default_nvs_type() -> u8 {
    NvsType::Str.code()
}

impl ConfigEntry {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            value: serde_json::Value::String(value.into()),
            nvs_type: NvsType::Str.code(),
        }
    }

    /// The value rendered the way the device stores it, without JSON quotes
    pub fn value_string(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// NVS storage types, with the codes used by ESP-IDF
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NvsType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    Str,
    Blob,
    Any,
}

impl NvsType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::U8,
            0x11 => Self::I8,
            0x02 => Self::U16,
            0x12 => Self::I16,
            0x04 => Self::U32,
            0x14 => Self::I32,
            0x08 => Self::U64,
            0x18 => Self::I64,
            0x21 => Self::Str,
            0x42 => Self::Blob,
            0xff => Self::Any,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        match self {
            Self::U8 => 0x01,
            Self::I8 => 0x11,
            Self::U16 => 0x02,
            Self::I16 => 0x12,
            Self::U32 => 0x04,
            Self::I32 => 0x14,
            Self::U64 => 0x08,
            Self::I64 => 0x18,
            Self::Str => 0x21,
            Self::Blob => 0x42,
            Self::Any => 0xff,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::U8 | Self::I8 | Self::U16 | Self::I16 | Self::U32 | Self::I32 | Self::U64 | Self::I64
        )
    }
}

/// Pin assignment reported next to the configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpioEntry {
    pub group: String,
    pub name: String,
    pub gpio: i32,
    #[serde(default)]
    pub fixed: bool,
}

/// Body of `GET /config.json`
///
/// Current firmwares wrap the map and add the GPIO table; older recovery
/// images return the bare map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigDocument {
    Full {
        config: ConfigMap,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gpio: Option<Vec<GpioEntry>>,
    },
    Legacy(ConfigMap),
}

impl ConfigDocument {
    pub fn entries(&self) -> &ConfigMap {
        match self {
            Self::Full { config, .. } => config,
            Self::Legacy(config) => config,
        }
    }

    pub fn gpio(&self) -> &[GpioEntry] {
        match self {
            Self::Full { gpio: Some(gpio), .. } => gpio,
            _ => &[],
        }
    }

    pub fn get(&self, key: &str) -> Option<&ConfigEntry> {
        self.entries().get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_and_legacy_documents() {
        let full: ConfigDocument = serde_json::from_str(
            r#"{"config": {"host_name": {"value": "squeezelite", "type": 33}},
                "gpio": [{"group": "i2c", "name": "scl", "gpio": 22, "fixed": false}]}"#,
        )
        .unwrap();
        assert!(matches!(full, ConfigDocument::Full { .. }));
        assert_eq!(full.gpio().len(), 1);
        assert_eq!(full.get("host_name").unwrap().value_string(), "squeezelite");

        let legacy: ConfigDocument =
            serde_json::from_str(r#"{"autoexec": {"value": "1", "type": 33}}"#).unwrap();
        assert!(matches!(legacy, ConfigDocument::Legacy(_)));
        assert!(legacy.gpio().is_empty());
        assert_eq!(legacy.entries().len(), 1);
    }

    #[test]
    fn test_missing_type_defaults_to_string() {
        let entry: ConfigEntry = serde_json::from_str(r#"{"value": 3}"#).unwrap();
        assert_eq!(NvsType::from_code(entry.nvs_type), Some(NvsType::Str));
        assert_eq!(entry.value_string(), "3");
    }

    #[test]
    fn test_nvs_type_codes() {
        assert_eq!(NvsType::from_code(33), Some(NvsType::Str));
        assert!(NvsType::I32.is_integer());
        assert!(!NvsType::Blob.is_integer());
        assert_eq!(NvsType::from_code(0x99), None);
    }
}
