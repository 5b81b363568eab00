//! The `squeezelite` command line stored in the `autoexec1` config key.
//!
//! Grammar, one token at a time:
//!
//! * a token is `"…"`, `'…'` or a run of non-whitespace characters
//! * a token starting with `-` is an option; the following token is its
//!   value unless that one starts with `-` too, in which case the option is
//!   a flag
//! * a bare `-` ends option parsing, it and everything after it is kept
//!   verbatim
//! * any other token is collected into the "other values"
//!
//! `-o` (output) and `-n` (player name) are pulled out of the option map.

use std::{fmt, sync::OnceLock};

use indexmap::IndexMap;
use regex::Regex;
use thiserror::Error;

pub const COMMAND_HEADER: &str = "squeezelite";

pub const KNOWN_CODECS: [&str; 10] = [
    "flac", "pcm", "mp3", "ogg", "aac", "wma", "alac", "dsd", "mad", "mpg",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Flag,
    Value(String),
}

impl OptionValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Flag => None,
            Self::Value(v) => Some(v),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqueezeliteCommand {
    /// Raw `-o` value, e.g. `I2S` or `BT -n 'Kitchen'`
    pub output: Option<String>,
    /// `-n`
    pub name: Option<String>,
    /// All other options, in command line order
    pub options: IndexMap<String, OptionValue>,
    pub other_values: String,
}

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r#""[^"]+"|'[^']+'|\S+"#).expect("static regex"))
}

fn unquote(token: &str) -> &str {
    for quote in ['"', '\''] {
        if token.len() >= 2 && token.starts_with(quote) && token.ends_with(quote) {
            return &token[1..token.len() - 1];
        }
    }
    token
}

fn quote(value: &str) -> String {
    if !value.chars().any(char::is_whitespace) {
        value.to_string()
    } else if value.contains('"') {
        format!("'{}'", value)
    } else {
        format!("\"{}\"", value)
    }
}

pub fn tokenize(line: &str) -> Vec<&str> {
    token_regex().find_iter(line).map(|m| m.as_str()).collect()
}

impl SqueezeliteCommand {
    pub fn parse(line: &str) -> Self {
        let mut tokens = tokenize(line);
        if tokens.first() == Some(&COMMAND_HEADER) {
            tokens.remove(0);
        }

        let mut options = IndexMap::new();
        let mut other = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let token = tokens[i];
            if let Some(option) = token.strip_prefix('-') {
                if option.is_empty() {
                    other.extend_from_slice(&tokens[i..]);
                    break;
                }
                let mut value = OptionValue::Flag;
                if let Some(next) = tokens.get(i + 1).filter(|t| !t.starts_with('-')) {
                    value = OptionValue::Value(unquote(next).to_string());
                    i += 1;
                }
                options.insert(option.to_string(), value);
            } else {
                other.push(token);
            }
            i += 1;
        }

        let output = options
            .shift_remove("o")
            .and_then(|v| v.as_str().map(str::to_string));
        let name = options
            .shift_remove("n")
            .and_then(|v| v.as_str().map(str::to_string));

        Self {
            output,
            name,
            options,
            other_values: other.join(" "),
        }
    }

    /// First word of the output, e.g. `I2S`, `SPDIF` or `BT`
    pub fn output_kind(&self) -> Option<&str> {
        self.output.as_deref().and_then(|o| o.split_whitespace().next())
    }

    /// Name of the Bluetooth speaker, given as `-o "BT -n <sink>"`
    pub fn bt_sink_name(&self) -> Option<String> {
        let output = self.output.as_deref()?;
        if !self.output_kind()?.eq_ignore_ascii_case("BT") {
            return None;
        }
        Self::parse(output).name
    }

    pub fn option(&self, key: &str) -> Option<&OptionValue> {
        self.options.get(key)
    }

    pub fn set_option(&mut self, key: &str, value: Option<&str>) {
        let value = match value {
            Some(v) => OptionValue::Value(v.to_string()),
            None => OptionValue::Flag,
        };
        self.options.insert(key.to_string(), value);
    }

    pub fn remove_option(&mut self, key: &str) -> Option<OptionValue> {
        self.options.shift_remove(key)
    }

    pub fn resample(&self) -> Option<Resample> {
        self.options
            .get("u")
            .and_then(OptionValue::as_str)
            .map(Resample::parse)
    }

    pub fn set_resample(&mut self, resample: Option<&Resample>) {
        match resample {
            Some(r) => self.set_option("u", Some(&r.to_string())),
            None => {
                self.remove_option("u");
            }
        }
    }

    /// Check every option that has a known syntax
    pub fn validate(&self) -> Result<(), OptionError> {
        for (key, value) in &self.options {
            if let Some(value) = value.as_str() {
                validate_option(key, value)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for SqueezeliteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(COMMAND_HEADER)?;
        if let Some(output) = &self.output {
            write!(f, " -o {}", quote(output))?;
        }
        if let Some(name) = &self.name {
            write!(f, " -n {}", quote(name))?;
        }
        // Bare words go before the first option so none is read as a flag's value
        let other = tokenize(&self.other_values);
        let tail = other.iter().position(|t| *t == "-").unwrap_or(other.len());
        for word in &other[..tail] {
            write!(f, " {}", word)?;
        }
        for (key, value) in &self.options {
            write!(f, " -{}", key)?;
            if let OptionValue::Value(v) = value {
                write!(f, " {}", quote(v))?;
            }
        }
        if tail < other.len() {
            write!(f, " {}", other[tail..].join(" "))?;
        }
        Ok(())
    }
}

/// `-u <quality>[:i]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resample {
    pub quality: String,
    pub interpolate: bool,
}

impl Resample {
    pub fn parse(value: &str) -> Self {
        let mut parts = value.splitn(2, ':');
        let quality = parts.next().unwrap_or_default().to_string();
        let interpolate = parts.next().is_some_and(|i| !i.is_empty());
        Self {
            quality,
            interpolate,
        }
    }
}

impl fmt::Display for Resample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.quality)?;
        if self.interpolate {
            f.write_str(":i")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("Invalid codec(s) {}", .0.join(", "))]
    InvalidCodecs(Vec<String>),

    #[error("Invalid MAC address")]
    InvalidMac(String),

    #[error("Invalid rate(s) {0}. Acceptable format: <maxrate>|<minrate>-<maxrate>|<rate1>,<rate2>,<rate3>")]
    InvalidRate(String),
}

pub fn validate_codecs(value: &str) -> Result<(), OptionError> {
    let invalid: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|c| !KNOWN_CODECS.contains(c))
        .map(str::to_string)
        .collect();
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(OptionError::InvalidCodecs(invalid))
    }
}

pub fn validate_mac(value: &str) -> Result<(), OptionError> {
    static MAC: OnceLock<Regex> = OnceLock::new();
    let mac = MAC.get_or_init(|| {
        Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})$").expect("static regex")
    });
    if mac.is_match(value) {
        Ok(())
    } else {
        Err(OptionError::InvalidMac(value.to_string()))
    }
}

pub fn validate_rates(value: &str) -> Result<(), OptionError> {
    static RATES: OnceLock<Regex> = OnceLock::new();
    let rates = RATES.get_or_init(|| {
        Regex::new(r"^(\d+\.?\d*|\.\d+)-(\d+\.?\d*|\.\d+)$|^(\d+\.?\d*)$|^(\d+\.?\d*,)+\d+\.?\d*$")
            .expect("static regex")
    });
    if rates.is_match(value) {
        Ok(())
    } else {
        Err(OptionError::InvalidRate(value.to_string()))
    }
}

/// Validate one option value. Options without a known syntax always pass.
pub fn validate_option(key: &str, value: &str) -> Result<(), OptionError> {
    match key {
        "c" | "e" => validate_codecs(value),
        "m" => validate_mac(value),
        "r" => validate_rates(value),
        _ => Ok(()),
    }
}

/// Preset option sets for each output type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTemplate {
    I2s,
    Spdif,
    Bt,
}

impl OutputTemplate {
    /// Match on the output's first word, case-insensitively
    pub fn from_output(output: &str) -> Option<Self> {
        let output = output.to_ascii_uppercase();
        if output.starts_with("I2S") {
            Some(Self::I2s)
        } else if output.starts_with("SPDIF") {
            Some(Self::Spdif)
        } else if output.starts_with("BT") {
            Some(Self::Bt)
        } else {
            None
        }
    }

    pub fn output(self) -> &'static str {
        match self {
            Self::I2s => "I2S",
            Self::Spdif => "SPDIF",
            Self::Bt => "BT",
        }
    }

    /// Default options; an empty value means the option is left out
    pub fn defaults(self) -> [(&'static str, &'static str); 4] {
        let rate = match self {
            Self::I2s => "96000",
            Self::Spdif => "48000",
            Self::Bt => "44100",
        };
        [("b", "500:2000"), ("C", "30"), ("W", ""), ("Z", rate)]
    }

    /// Switch `command` to this output. The defaults are only applied when
    /// the output type actually changes.
    pub fn apply(self, command: &mut SqueezeliteCommand) {
        let current = command.output_kind().and_then(Self::from_output);
        if current == Some(self) {
            return;
        }
        command.output = Some(self.output().to_string());
        for (key, value) in self.defaults() {
            if value.is_empty() {
                command.remove_option(key);
            } else {
                command.set_option(key, Some(value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typical_line() {
        let cmd = SqueezeliteCommand::parse(
            r#"squeezelite -o I2S -b 500:2000 -d all=info -C 30 -W -n "Living Room" -Z 96000"#,
        );

        assert_eq!(cmd.output.as_deref(), Some("I2S"));
        assert_eq!(cmd.name.as_deref(), Some("Living Room"));
        assert_eq!(
            cmd.options.keys().collect::<Vec<_>>(),
            vec!["b", "d", "C", "W", "Z"]
        );
        assert_eq!(cmd.option("W"), Some(&OptionValue::Flag));
        assert_eq!(
            cmd.option("d"),
            Some(&OptionValue::Value("all=info".to_string()))
        );
        assert_eq!(cmd.other_values, "");
    }

    #[test]
    fn test_bare_dash_ends_options() {
        let cmd = SqueezeliteCommand::parse("squeezelite -o SPDIF - -x raw tail");
        assert_eq!(cmd.output_kind(), Some("SPDIF"));
        assert!(cmd.options.is_empty());
        assert_eq!(cmd.other_values, "- -x raw tail");
    }

    #[test]
    fn test_bt_sink_name() {
        let cmd = SqueezeliteCommand::parse(r#"squeezelite -o "BT -n 'Kitchen Speaker'" -n Player"#);
        assert_eq!(cmd.output_kind(), Some("BT"));
        assert_eq!(cmd.bt_sink_name().as_deref(), Some("Kitchen Speaker"));
        assert_eq!(cmd.name.as_deref(), Some("Player"));

        let i2s = SqueezeliteCommand::parse("squeezelite -o I2S -n Player");
        assert_eq!(i2s.bt_sink_name(), None);
    }

    #[test]
    fn test_format_parse_round_trip() {
        let mut cmd = SqueezeliteCommand {
            output: Some("I2S".to_string()),
            name: Some("Den Player".to_string()),
            ..Default::default()
        };
        cmd.set_option("b", Some("500:2000"));
        cmd.set_option("W", None);
        cmd.set_option("e", Some("dsd,alac"));
        cmd.set_option("Z", Some("96000"));

        let line = cmd.to_string();
        assert_eq!(
            line,
            r#"squeezelite -o I2S -n "Den Player" -b 500:2000 -W -e dsd,alac -Z 96000"#
        );
        assert_eq!(SqueezeliteCommand::parse(&line), cmd);

        let bt = SqueezeliteCommand::parse(r#"squeezelite -o "BT -n 'Office'" -C 30"#);
        assert_eq!(SqueezeliteCommand::parse(&bt.to_string()), bt);

        let trailing = SqueezeliteCommand::parse("squeezelite -o I2S extra -W");
        assert_eq!(trailing.option("W"), Some(&OptionValue::Flag));
        assert_eq!(trailing.to_string(), "squeezelite -o I2S extra -W");
        assert_eq!(SqueezeliteCommand::parse(&trailing.to_string()), trailing);

        let raw = SqueezeliteCommand::parse("squeezelite -o I2S word -W - -x raw tail");
        assert_eq!(raw.to_string(), "squeezelite -o I2S word -W - -x raw tail");
        assert_eq!(SqueezeliteCommand::parse(&raw.to_string()), raw);
    }

    #[test]
    fn test_resample() {
        let cmd = SqueezeliteCommand::parse("squeezelite -o I2S -u m:i");
        assert_eq!(
            cmd.resample(),
            Some(Resample {
                quality: "m".to_string(),
                interpolate: true
            })
        );
        assert_eq!(Resample::parse("v").to_string(), "v");
    }

    #[test]
    fn test_validators() {
        assert!(validate_option("c", "flac, mp3").is_ok());
        assert_eq!(
            validate_option("e", "flac,opus,xyz").unwrap_err().to_string(),
            "Invalid codec(s) opus, xyz"
        );
        assert!(validate_option("m", "aa:bb:cc:dd:ee:ff").is_ok());
        assert!(validate_option("m", "aa:bb:cc").is_err());
        assert!(validate_option("r", "44100").is_ok());
        assert!(validate_option("r", "44100-96000").is_ok());
        assert!(validate_option("r", "44100,48000,96000").is_ok());
        assert!(validate_option("r", "fast").is_err());
        assert!(validate_option("x", "anything").is_ok());
    }

    #[test]
    fn test_template_only_applies_on_change() {
        let mut cmd = SqueezeliteCommand::parse("squeezelite -o I2S -Z 192000 -W");
        OutputTemplate::I2s.apply(&mut cmd);
        assert_eq!(cmd.option("Z"), Some(&OptionValue::Value("192000".into())));

        OutputTemplate::Bt.apply(&mut cmd);
        assert_eq!(cmd.output.as_deref(), Some("BT"));
        assert_eq!(cmd.option("Z"), Some(&OptionValue::Value("44100".into())));
        assert_eq!(cmd.option("C"), Some(&OptionValue::Value("30".into())));
        assert_eq!(cmd.option("W"), None);
    }
}
