//! Device message log and per-class dispatch of `messages.json` entries

use std::time::{Duration, SystemTime};

use common::{BtSink, DeviceMessage, MessageClass, MessageType, OtaProgress, TaskInfo, TaskStats};
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Device,
    /// Raised by this client, e.g. a failed request
    Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub kind: MessageType,
    pub text: String,
    /// When the message was raised, adjusted by its age on the device
    pub time: SystemTime,
    pub source: LogSource,
}

/// System log with a running count and the worst severity seen since the
/// last clear.
#[derive(Debug, Clone)]
pub struct MessageLog {
    count: usize,
    severity: MessageType,
    /// Last legacy `status.json` message, to skip repeats
    previous_status_message: Option<String>,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    pub fn new() -> Self {
        Self {
            count: 0,
            severity: MessageType::Info,
            previous_status_message: None,
        }
    }

    pub fn push(&mut self, kind: MessageType, text: &str, time: SystemTime, source: LogSource) -> LogEntry {
        match kind {
            MessageType::Info => info!("device: {}", text.trim_end()),
            MessageType::Warning => warn!("device: {}", text.trim_end()),
            MessageType::Error => log::error!("device: {}", text.trim_end()),
        }

        self.count += 1;
        self.severity = self.severity.max(kind);
        LogEntry {
            kind,
            text: text.to_string(),
            time,
            source,
        }
    }

    /// Log a message raised on this side of the connection
    pub fn local(&mut self, kind: MessageType, text: &str) -> LogEntry {
        self.push(kind, text, SystemTime::now(), LogSource::Local)
    }

    pub fn device(&mut self, message: &DeviceMessage) -> LogEntry {
        self.push(
            message.kind,
            &message.message,
            message_time(message),
            LogSource::Device,
        )
    }

    /// Older recovery firmwares report messages through `status.json`.
    /// Returns the new entry unless the message repeats the previous one.
    pub fn status_message(&mut self, message: Option<&str>) -> Option<LogEntry> {
        let message = message.filter(|m| !m.is_empty())?;
        if self.previous_status_message.as_deref() == Some(message) {
            return None;
        }
        self.previous_status_message = Some(message.to_string());
        Some(self.local(MessageType::Info, message))
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Highest severity since the last [`MessageLog::clear`]
    pub fn severity(&self) -> MessageType {
        self.severity
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.severity = MessageType::Info;
    }
}

fn message_time(message: &DeviceMessage) -> SystemTime {
    let age = Duration::from_millis(message.age_ms());
    SystemTime::now()
        .checked_sub(age)
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// A `messages.json` entry decoded according to its class
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Ota(OtaProgress),
    /// Tasks sorted by CPU usage, busiest first. Empty when the device sent
    /// no task list.
    Stats { ntasks: u32, tasks: Vec<TaskInfo> },
    System(DeviceMessage),
    /// Output of a console command, `<command name>\n<text>` on the wire
    CommandResult {
        command: String,
        kind: MessageType,
        text: String,
    },
    /// Bluetooth speakers in range
    BtSinks(Vec<BtSink>),
    Unknown(DeviceMessage),
}

impl Dispatch {
    pub fn decode(message: &DeviceMessage) -> Result<Self, serde_json::Error> {
        Ok(match message.class {
            MessageClass::Ota => Self::Ota(serde_json::from_str(&message.message)?),
            MessageClass::Stats => {
                let stats: TaskStats = serde_json::from_str(&message.message)?;
                let mut tasks = stats.tasks.unwrap_or_default();
                tasks.sort_by(|a, b| b.cpu.cmp(&a.cpu));
                Self::Stats {
                    ntasks: stats.ntasks,
                    tasks,
                }
            }
            MessageClass::System => Self::System(message.clone()),
            MessageClass::CfgCmd => {
                let (command, text) = split_command_message(&message.message);
                Self::CommandResult {
                    command: command.to_string(),
                    kind: message.kind,
                    text: text.to_string(),
                }
            }
            MessageClass::Bt => Self::BtSinks(serde_json::from_str(&message.message)?),
            MessageClass::Unknown => {
                debug!("messages: unknown class for {:?}", message.message);
                Self::Unknown(message.clone())
            }
        })
    }
}

fn split_command_message(message: &str) -> (&str, &str) {
    match message.split_once('\n') {
        Some((command, text)) => (command, text),
        None => (message, ""),
    }
}

/// Bluetooth speakers seen so far, strongest signal first
#[derive(Debug, Clone, Default)]
pub struct SinkList {
    sinks: Vec<BtSink>,
}

impl SinkList {
    /// Merge a scan result; returns the sinks that were not known before
    pub fn merge(&mut self, found: &[BtSink]) -> Vec<BtSink> {
        let mut new = Vec::new();
        for sink in found {
            match self.sinks.iter_mut().find(|s| s.name == sink.name) {
                Some(known) => known.rssi = sink.rssi,
                None => {
                    self.sinks.push(sink.clone());
                    new.push(sink.clone());
                }
            }
        }
        self.sinks.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        new
    }

    pub fn sinks(&self) -> &[BtSink] {
        &self.sinks
    }

    pub fn clear(&mut self) {
        self.sinks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(class: MessageClass, kind: MessageType, text: &str) -> DeviceMessage {
        DeviceMessage {
            message: text.to_string(),
            kind,
            class,
            sent_time: 0,
            current_time: 0,
        }
    }

    #[test]
    fn test_severity_never_lowers() {
        let mut log = MessageLog::new();
        log.local(MessageType::Info, "booted");
        assert_eq!(log.severity(), MessageType::Info);
        log.local(MessageType::Error, "boom");
        log.local(MessageType::Warning, "meh");
        log.local(MessageType::Info, "fine");

        assert_eq!(log.severity(), MessageType::Error);
        assert_eq!(log.count(), 4);

        log.clear();
        assert_eq!(log.severity(), MessageType::Info);
        assert_eq!(log.count(), 0);
    }

    #[test]
    fn test_status_message_skips_repeats() {
        let mut log = MessageLog::new();
        assert!(log.status_message(Some("Flashing")).is_some());
        assert!(log.status_message(Some("Flashing")).is_none());
        assert!(log.status_message(Some("")).is_none());
        assert!(log.status_message(None).is_none());
        assert!(log.status_message(Some("Done")).is_some());
        assert_eq!(log.count(), 2);
    }

    #[test]
    fn test_dispatch_by_class() {
        let stats = message(
            MessageClass::Stats,
            MessageType::Info,
            r#"{"ntasks": 2, "tasks": [
                {"nme": "idle", "cpu": 5, "st": 1, "minstk": 500, "bprio": 0, "cprio": 0, "num": 1},
                {"nme": "audio", "cpu": 60, "st": 0, "minstk": 800, "bprio": 5, "cprio": 5, "num": 2}
            ]}"#,
        );
        match Dispatch::decode(&stats).unwrap() {
            Dispatch::Stats { ntasks, tasks } => {
                assert_eq!(ntasks, 2);
                assert_eq!(tasks[0].nme, "audio");
            }
            other => panic!("unexpected {:?}", other),
        }

        let cmd = message(
            MessageClass::CfgCmd,
            MessageType::Warning,
            "cfg-audio-general\nSaved.\nReboot required.",
        );
        assert_eq!(
            Dispatch::decode(&cmd).unwrap(),
            Dispatch::CommandResult {
                command: "cfg-audio-general".into(),
                kind: MessageType::Warning,
                text: "Saved.\nReboot required.".into(),
            }
        );

        let broken = message(MessageClass::Ota, MessageType::Info, "{not json");
        assert!(Dispatch::decode(&broken).is_err());
    }

    #[test]
    fn test_sink_list() {
        let mut sinks = SinkList::default();
        let sink = |name: &str, rssi| BtSink {
            name: name.into(),
            rssi,
        };

        let new = sinks.merge(&[sink("Kitchen", -70), sink("Office", -50)]);
        assert_eq!(new.len(), 2);
        assert_eq!(sinks.sinks()[0].name, "Office");

        let new = sinks.merge(&[sink("Kitchen", -40)]);
        assert!(new.is_empty());
        assert_eq!(sinks.sinks()[0].name, "Kitchen");
    }
}
