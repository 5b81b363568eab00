//! Forms for the console commands published in `commands.json`, and the
//! command strings they submit.

use std::collections::HashMap;

use common::{ArgSpec, CommandSpec, CommandsDocument};
use serde_json::Value;

/// Prefix of commands that edit stored configuration
pub const CONFIG_PREFIX: &str = "cfg-";

/// Placeholder choice meaning "leave this option out"
pub const NO_CHOICE: &str = "--";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Checkbox,
    Select { choices: Vec<String>, multiple: bool },
    Text { placeholder: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormField {
    pub longopts: Option<String>,
    pub shortopts: Option<String>,
    pub label: String,
    pub kind: FieldKind,
    pub has_value: bool,
    pub required: bool,
    pub hidden: bool,
    /// Value currently in effect on the device
    pub previous: Option<Value>,
}

impl FormField {
    fn from_arg(arg: &ArgSpec, previous: Option<&Value>) -> Self {
        let datatype = arg.datatype.clone().unwrap_or_default();
        let kind = if arg.checkbox {
            FieldKind::Checkbox
        } else if datatype.contains('|') {
            let multiple = datatype.starts_with('+');
            let cleaned: String = datatype
                .trim_start_matches('+')
                .chars()
                .filter(|c| !matches!(c, '<' | '=' | '>'))
                .collect();
            let choices = std::iter::once(NO_CHOICE.to_string())
                .chain(cleaned.split('|').map(str::to_string))
                .collect();
            FieldKind::Select { choices, multiple }
        } else {
            FieldKind::Text {
                placeholder: datatype,
            }
        };

        Self {
            longopts: arg.longopts.clone(),
            shortopts: arg.shortopts.clone(),
            label: arg.glossary.clone(),
            kind,
            has_value: arg.hasvalue,
            required: arg.mincount > 0,
            hidden: arg.glossary == "hidden",
            previous: previous.cloned(),
        }
    }

    /// Name the inputs are keyed by
    pub fn key(&self) -> Option<&str> {
        self.longopts.as_deref().or(self.shortopts.as_deref())
    }

    /// `--long` when there is a long name, `-s` otherwise
    pub fn option_flag(&self) -> Option<String> {
        match (&self.longopts, &self.shortopts) {
            (Some(long), _) => Some(format!("--{}", long)),
            (None, Some(short)) => Some(format!("-{}", short)),
            (None, None) => None,
        }
    }

    pub fn previous_display(&self) -> String {
        match (&self.kind, &self.previous) {
            (FieldKind::Checkbox, prev) => {
                if prev.as_ref().is_some_and(is_truthy) {
                    "Checked".to_string()
                } else {
                    "Unchecked".to_string()
                }
            }
            (_, Some(Value::String(s))) => s.clone(),
            (_, Some(Value::Null)) | (_, None) => String::new(),
            (_, Some(other)) => other.to_string(),
        }
    }

    /// The input a freshly rendered form starts with
    fn initial_input(&self) -> FieldInput {
        match &self.kind {
            FieldKind::Checkbox => FieldInput::Checked(self.previous.as_ref().is_some_and(is_truthy)),
            FieldKind::Select { .. } => {
                let value = self.previous_display();
                if value.is_empty() {
                    FieldInput::Text(NO_CHOICE.to_string())
                } else {
                    FieldInput::Text(value)
                }
            }
            FieldKind::Text { .. } => FieldInput::Text(self.previous_display()),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldInput {
    Checked(bool),
    Text(String),
}

/// What the user entered, keyed by [`FormField::key`]
pub type FormInputs = HashMap<String, FieldInput>;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandForm {
    pub name: String,
    pub help: String,
    pub fields: Vec<FormField>,
}

impl CommandForm {
    pub fn from_spec(spec: &CommandSpec, document: &CommandsDocument) -> Self {
        let fields = spec
            .argtable
            .iter()
            .map(|arg| {
                let previous = arg
                    .longopts
                    .as_deref()
                    .and_then(|long| document.current_value(&spec.name, long));
                FormField::from_arg(arg, previous)
            })
            .collect();

        Self {
            name: spec.name.clone(),
            help: spec.help.clone(),
            fields,
        }
    }

    /// Every form of a commands document, in published order
    pub fn all(document: &CommandsDocument) -> Vec<CommandForm> {
        document
            .commands
            .iter()
            .map(|spec| Self::from_spec(spec, document))
            .collect()
    }

    /// Config commands are saved (and optionally applied with a reboot)
    /// rather than executed.
    pub fn is_config(&self) -> bool {
        self.name.starts_with(CONFIG_PREFIX)
    }

    /// Tab a config command belongs to, e.g. `cfg-audio` for
    /// `cfg-audio-general`
    pub fn section(&self) -> Option<String> {
        let mut parts = self.name.split('-');
        match (parts.next(), parts.next()) {
            (Some(first), Some(second)) => Some(format!("{}-{}", first, second)),
            _ => None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.key() == Some(key))
    }

    /// Inputs prefilled from the values currently on the device
    pub fn initial_inputs(&self) -> FormInputs {
        self.fields
            .iter()
            .filter_map(|f| f.key().map(|k| (k.to_string(), f.initial_input())))
            .collect()
    }

    /// Assemble `name --opt value --flag …` from the entered values.
    /// Valued options are left out when empty or set to [`NO_CHOICE`];
    /// checkboxes are emitted when checked.
    pub fn build_command(&self, inputs: &FormInputs) -> String {
        let mut parts = vec![self.name.clone()];

        for field in &self.fields {
            let (Some(key), Some(flag)) = (field.key(), field.option_flag()) else {
                continue;
            };
            match inputs.get(key) {
                Some(FieldInput::Text(value)) if field.has_value => {
                    if value.is_empty() || value == NO_CHOICE {
                        continue;
                    }
                    parts.push(flag);
                    if value.chars().any(char::is_whitespace) {
                        parts.push(format!("\"{}\"", value));
                    } else {
                        parts.push(value.clone());
                    }
                }
                Some(FieldInput::Checked(true)) if !field.has_value => parts.push(flag),
                _ => {}
            }
        }

        parts.join(" ")
    }
}
