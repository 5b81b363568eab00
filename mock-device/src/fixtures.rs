//! Documents the mock device starts with, and the message sequences it
//! plays back during a firmware update.

use common::{
    AccessPoint, CommandsDocument, ConfigDocument, DeviceMessage, MessageClass, MessageType,
    OtaProgress, Status,
};
use serde_json::json;

pub fn status() -> Status {
    Status {
        urc: Some(0),
        ssid: Some("zodmgbbq".into()),
        ip: Some("192.168.10.225".into()),
        gw: Some("192.168.10.1".into()),
        netmask: Some("255.255.255.0".into()),
        rssi: Some(-58),
        recovery: Some(0),
        version: Some("1191-master-v4.3#v4.3.1#I2S-4MFlash#master-v4.3".into()),
        project_name: Some("squeezelite".into()),
        platform_name: Some("I2S-4MFlash".into()),
        voltage: Some(7.6),
        jack: Some(json!("1")),
        depth: Some(16),
        is_i2c_locked: Some(false),
        lms_ip: Some("192.168.10.2".into()),
        lms_port: Some(9000),
        bt_status: Some(0),
        bt_sub_status: Some(0),
        ..Default::default()
    }
}

pub fn config() -> ConfigDocument {
    serde_json::from_value(json!({
        "config": {
            "host_name": {"value": "squeezelite-mock", "type": 33},
            "autoexec": {"value": "1", "type": 33},
            "autoexec1": {
                "value": "squeezelite -o I2S -b 500:2000 -d all=info -C 30 -W -n squeezelite-mock",
                "type": 33
            },
            "bt_sink_name": {"value": "squeezelite", "type": 33},
            "disable_ps": {"value": "n", "type": 33},
            "enable_airplay": {"value": "y", "type": 33},
            "release_url": {
                "value": "https://github.com/sle118/squeezelite-esp32/releases",
                "type": 33
            },
            "stats": {"value": "n", "type": 33},
            "telnet_block": {"value": "500", "type": 33},
            "wifi_ps": {"value": 1, "type": 1}
        },
        "gpio": [
            {"group": "i2c", "name": "scl", "gpio": 22, "fixed": false},
            {"group": "i2c", "name": "sda", "gpio": 21, "fixed": false},
            {"group": "spdif", "name": "data", "gpio": 12, "fixed": true}
        ]
    }))
    .unwrap_or_else(|_| ConfigDocument::Legacy(Default::default()))
}

pub fn commands() -> CommandsDocument {
    serde_json::from_value(json!({
        "commands": [
            {
                "name": "cfg-audio-general",
                "help": "General audio options",
                "hascb": true,
                "argtable": [
                    {"longopts": "jack_behavior", "shortopts": "j", "checkbox": false,
                     "hasvalue": true, "mincount": 0, "maxcount": 1,
                     "glossary": "On supported DAC, determines the audio jack behavior.",
                     "datatype": "Headphones|Subwoofer", "remark": false},
                    {"longopts": "loudness", "shortopts": "l", "checkbox": false,
                     "hasvalue": true, "mincount": 0, "maxcount": 1,
                     "glossary": "Sets a loudness level, from 0 to 10.",
                     "datatype": "<n>", "remark": false}
                ]
            },
            {
                "name": "cfg-syst-name",
                "help": "Device name",
                "hascb": true,
                "argtable": [
                    {"longopts": "name", "shortopts": "n", "checkbox": false,
                     "hasvalue": true, "mincount": 1, "maxcount": 1,
                     "glossary": "New name", "datatype": "<str>", "remark": false}
                ]
            },
            {
                "name": "cfg-hw-spdif",
                "help": "SPDIF Output",
                "hascb": true,
                "argtable": [
                    {"longopts": "clear", "shortopts": null, "checkbox": true,
                     "hasvalue": false, "mincount": 0, "maxcount": 1,
                     "glossary": "Clear configuration", "datatype": null, "remark": false},
                    {"longopts": "data", "shortopts": "d", "checkbox": false,
                     "hasvalue": true, "mincount": 0, "maxcount": 1,
                     "glossary": "Data GPIO", "datatype": "<n>", "remark": false}
                ]
            },
            {
                "name": "restart",
                "help": "Reboot system",
                "hascb": false,
                "argtable": []
            }
        ],
        "values": {
            "cfg-audio-general": {"jack_behavior": "Headphones", "loudness": 3},
            "cfg-syst-name": {"name": "squeezelite-mock"},
            "cfg-hw-spdif": {"data": 12}
        }
    }))
    .unwrap_or_default()
}

pub fn access_points() -> Vec<AccessPoint> {
    let ap = |ssid: &str, chan, rssi, auth| AccessPoint {
        ssid: ssid.to_string(),
        chan,
        rssi,
        auth,
    };
    vec![
        ap("zodmgbbq", 1, -58, 3),
        ap("Neighbour's Wi-Fi", 6, -74, 3),
        ap("Guests", 11, -66, 0),
        ap("Garage", 1, -81, 4),
    ]
}

fn message(class: MessageClass, kind: MessageType, text: String) -> DeviceMessage {
    DeviceMessage {
        message: text,
        kind,
        class,
        sent_time: 0,
        current_time: 0,
    }
}

/// Messages queued again after every reboot
pub fn boot_messages() -> Vec<DeviceMessage> {
    let stats = json!({
        "ntasks": 3,
        "tasks": [
            {"nme": "IDLE0", "cpu": 81, "st": 1, "minstk": 1012, "bprio": 0, "cprio": 0, "num": 4},
            {"nme": "squeezelite", "cpu": 12, "st": 2, "minstk": 3340, "bprio": 14, "cprio": 14, "num": 21},
            {"nme": "http_server", "cpu": 2, "st": 2, "minstk": 2312, "bprio": 5, "cprio": 5, "num": 17}
        ]
    });
    let sinks = json!([
        {"name": "Living Room Speaker", "rssi": -61},
        {"name": "JBL Flip 4", "rssi": -48}
    ]);
    vec![
        message(
            MessageClass::System,
            MessageType::Info,
            "Booted firmware 1191-master-v4.3".to_string(),
        ),
        message(
            MessageClass::System,
            MessageType::Warning,
            "Wi-Fi power save is enabled".to_string(),
        ),
        message(MessageClass::Stats, MessageType::Info, stats.to_string()),
        message(MessageClass::Bt, MessageType::Info, sinks.to_string()),
    ]
}

fn progress(pct: Option<f64>, dsc: &str) -> OtaProgress {
    OtaProgress {
        ota_pct: pct,
        ota_dsc: Some(dsc.to_string()),
    }
}

/// Download and flash after a `fwurl` was set
pub fn ota_download() -> Vec<OtaProgress> {
    vec![
        progress(None, "Initializing update"),
        progress(Some(5.0), "Downloading firmware"),
        progress(Some(25.0), "Downloading firmware"),
        progress(Some(50.0), "Writing partition"),
        progress(Some(75.0), "Writing partition"),
        progress(Some(100.0), "Firmware update complete. Restarting"),
    ]
}

/// Download that breaks half way
pub fn ota_download_fail() -> Vec<OtaProgress> {
    vec![
        progress(None, "Initializing update"),
        progress(Some(5.0), "Downloading firmware"),
        progress(Some(30.0), "Downloading firmware"),
        progress(None, "Error: connection lost while downloading firmware"),
    ]
}

/// Flash of an uploaded image
pub fn ota_flash() -> Vec<OtaProgress> {
    vec![
        progress(Some(10.0), "Writing partition"),
        progress(Some(40.0), "Writing partition"),
        progress(Some(80.0), "Writing partition"),
        progress(Some(100.0), "Firmware update complete. Restarting"),
    ]
}

/// Wrap a step of an OTA sequence for `messages.json`. The last step of a
/// failing sequence is reported as an error.
pub fn ota_message(step: &OtaProgress, failed: bool) -> DeviceMessage {
    let kind = if failed {
        MessageType::Error
    } else {
        MessageType::Info
    };
    let text = serde_json::to_string(step).unwrap_or_default();
    message(MessageClass::Ota, kind, text)
}

/// `<command name>\n<text>`, the way the firmware answers console commands
pub fn command_message(name: &str, text: &str) -> DeviceMessage {
    message(
        MessageClass::CfgCmd,
        MessageType::Info,
        format!("{}\n{}", name, text),
    )
}
