//! Editing the device's NVS configuration
//!
//! Values go back to the device typed the way NVS stores them: integer NVS
//! types are sent as JSON numbers, everything else as strings. Keys the
//! device does not know yet are created as strings.

use std::collections::BTreeMap;

use common::{now_ms, ConfigDocument, ConfigEntry, ConfigMap, ConfigUpdate, NvsType};
use serde_json::Value;
use thiserror::Error;

use crate::cmdline::SqueezeliteCommand;

pub const FWURL_KEY: &str = "fwurl";
pub const AUTOEXEC1_KEY: &str = "autoexec1";
pub const HOST_NAME_KEY: &str = "host_name";
pub const RELEASE_API_KEY: &str = "rel_api";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NvsError {
    #[error("{key} holds an integer, {value:?} is not one")]
    InvalidInteger { key: String, value: String },
}

/// Convert user input to the JSON value for an NVS type code
pub fn typed_value(key: &str, nvs_type: u8, raw: &str) -> Result<Value, NvsError> {
    let integer = NvsType::from_code(nvs_type).is_some_and(NvsType::is_integer);
    if !integer {
        return Ok(Value::String(raw.to_string()));
    }

    let raw = raw.trim();
    let invalid = || NvsError::InvalidInteger {
        key: key.to_string(),
        value: raw.to_string(),
    };
    if raw.starts_with('-') {
        raw.parse::<i64>().map(Value::from).map_err(|_| invalid())
    } else {
        raw.parse::<u64>().map(Value::from).map_err(|_| invalid())
    }
}

/// Wrap entries in the `{timestamp, config}` envelope
pub fn update(config: ConfigMap) -> ConfigUpdate {
    ConfigUpdate {
        timestamp: now_ms(),
        config,
    }
}

/// Point the recovery image at a firmware download
pub fn fwurl_update(url: &str) -> ConfigUpdate {
    update(ConfigMap::from([(
        FWURL_KEY.to_string(),
        ConfigEntry::string(url),
    )]))
}

/// Store a new squeezelite command line
pub fn autoexec1_update(command: &SqueezeliteCommand) -> ConfigUpdate {
    update(ConfigMap::from([(
        AUTOEXEC1_KEY.to_string(),
        ConfigEntry::string(command.to_string()),
    )]))
}

/// Outcome of importing a flat `key: value` backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Changed { key: String, from: String, to: String },
    Unchanged(String),
}

/// Pending edits on top of the configuration read from the device
#[derive(Debug, Clone, Default)]
pub struct ConfigEditor {
    current: ConfigMap,
    pending: ConfigMap,
}

impl ConfigEditor {
    pub fn new(document: &ConfigDocument) -> Self {
        Self {
            current: document.entries().clone(),
            pending: ConfigMap::new(),
        }
    }

    pub fn current(&self) -> &ConfigMap {
        &self.current
    }

    pub fn pending(&self) -> &ConfigMap {
        &self.pending
    }

    /// Value as it would be after committing
    pub fn value(&self, key: &str) -> Option<String> {
        self.pending
            .get(key)
            .or_else(|| self.current.get(key))
            .map(ConfigEntry::value_string)
    }

    /// Stage a value. Known keys keep their NVS type, new keys are strings.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<(), NvsError> {
        let nvs_type = self
            .current
            .get(key)
            .map(|e| e.nvs_type)
            .unwrap_or(NvsType::Str.code());
        let value = typed_value(key, nvs_type, raw)?;
        self.pending
            .insert(key.to_string(), ConfigEntry { value, nvs_type });
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The whole configuration with pending edits applied, ready to POST
    pub fn payload(&self) -> ConfigUpdate {
        let mut config = self.current.clone();
        config.extend(self.pending.clone());
        update(config)
    }

    /// Only the staged edits, ready to POST
    pub fn changes(&self) -> ConfigUpdate {
        update(self.pending.clone())
    }

    /// Flat `key: value` export, as saved to a backup file
    pub fn export(&self) -> BTreeMap<String, String> {
        let mut flat: BTreeMap<String, String> = self
            .current
            .iter()
            .map(|(k, v)| (k.clone(), v.value_string()))
            .collect();
        flat.extend(self.pending.iter().map(|(k, v)| (k.clone(), v.value_string())));
        flat
    }

    /// Stage values from a flat backup. Keys the device does not have are
    /// skipped.
    pub fn import(
        &mut self,
        backup: &BTreeMap<String, String>,
    ) -> Result<Vec<ImportOutcome>, NvsError> {
        let mut outcomes = Vec::new();
        for (key, value) in backup {
            let Some(existing) = self.value(key) else {
                continue;
            };
            if &existing == value {
                outcomes.push(ImportOutcome::Unchanged(key.clone()));
            } else {
                self.set(key, value)?;
                outcomes.push(ImportOutcome::Changed {
                    key: key.clone(),
                    from: existing,
                    to: value.clone(),
                });
            }
        }
        Ok(outcomes)
    }

    /// Pending edits were accepted by the device
    pub fn commit(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.current.extend(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn editor() -> ConfigEditor {
        let document: ConfigDocument = serde_json::from_value(json!({
            "config": {
                "host_name": {"value": "squeezelite", "type": 33},
                "bt_sink_volume": {"value": 100, "type": 1},
                "autoexec": {"value": "1", "type": 33}
            }
        }))
        .unwrap();
        ConfigEditor::new(&document)
    }

    #[test]
    fn test_typed_values() {
        assert_eq!(typed_value("v", 0x01, "42").unwrap(), json!(42));
        assert_eq!(typed_value("v", 0x14, "-7").unwrap(), json!(-7));
        assert_eq!(typed_value("v", 0x21, "42").unwrap(), json!("42"));
        assert!(typed_value("v", 0x02, "loud").is_err());
    }

    #[test]
    fn test_set_keeps_type_and_new_keys_are_strings() {
        let mut editor = editor();
        editor.set("bt_sink_volume", "80").unwrap();
        editor.set("new_key", "abc").unwrap();

        let payload = editor.changes();
        assert_eq!(
            serde_json::to_value(&payload.config).unwrap(),
            json!({
                "bt_sink_volume": {"value": 80, "type": 1},
                "new_key": {"value": "abc", "type": 33}
            })
        );
        assert_eq!(editor.payload().config.len(), 4);
    }

    #[test]
    fn test_fwurl_update() {
        let update = fwurl_update("http://host/fw.bin");
        assert_eq!(
            serde_json::to_value(&update.config).unwrap(),
            json!({"fwurl": {"value": "http://host/fw.bin", "type": 33}})
        );
        assert!(update.timestamp > 0);
    }

    #[test]
    fn test_import_backup() {
        let mut editor = editor();
        let backup = BTreeMap::from([
            ("host_name".to_string(), "squeezelite".to_string()),
            ("bt_sink_volume".to_string(), "50".to_string()),
            ("unknown".to_string(), "x".to_string()),
        ]);

        let outcomes = editor.import(&backup).unwrap();
        assert_eq!(
            outcomes,
            vec![
                ImportOutcome::Changed {
                    key: "bt_sink_volume".into(),
                    from: "100".into(),
                    to: "50".into()
                },
                ImportOutcome::Unchanged("host_name".into()),
            ]
        );

        editor.commit();
        assert!(!editor.is_dirty());
        assert_eq!(editor.export()["bt_sink_volume"], "50");
    }
}
