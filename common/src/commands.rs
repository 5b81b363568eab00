use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `GET /commands.json`: the console commands the firmware exposes,
/// with the values currently in effect.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandsDocument {
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    /// command name -> long option -> current value
    #[serde(default)]
    pub values: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl CommandsDocument {
    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn current_value(&self, command: &str, longopts: &str) -> Option<&serde_json::Value> {
        self.values.get(command).and_then(|v| v.get(longopts))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub hascb: bool,
    #[serde(default)]
    pub argtable: Vec<ArgSpec>,
}

/// One argtable3 entry
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgSpec {
    pub longopts: Option<String>,
    pub shortopts: Option<String>,
    pub checkbox: bool,
    pub hasvalue: bool,
    pub mincount: u32,
    pub maxcount: u32,
    pub glossary: String,
    pub datatype: Option<String>,
    pub remark: bool,
}
