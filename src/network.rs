//! Network and power indicators derived from `status.json`

use common::{AccessPoint, ConnectReturnCode, Status};

/// Wi-Fi signal strength in bars, 0 to 4
pub fn signal_bars(rssi: i32) -> u8 {
    match rssi {
        r if r >= -55 => 4,
        r if r >= -60 => 3,
        r if r >= -65 => 2,
        r if r >= -70 => 1,
        _ => 0,
    }
}

pub fn signal_label(rssi: i32) -> &'static str {
    match signal_bars(rssi) {
        4 => "****",
        3 => "***",
        2 => "**",
        1 => "*",
        _ => ".",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatteryLevel {
    Empty,
    Low,
    Medium,
    High,
    Full,
}

/// Voltage ranges per level, for 2S and 3S Li-ion packs. Bounds are
/// inclusive and the first matching level wins.
const BATTERY_RANGES: [(BatteryLevel, [(f32, f32); 2]); 4] = [
    (BatteryLevel::Empty, [(5.8, 6.8), (8.8, 10.2)]),
    (BatteryLevel::Low, [(6.8, 7.4), (10.2, 11.1)]),
    (BatteryLevel::Medium, [(7.4, 7.5), (11.1, 11.25)]),
    (BatteryLevel::High, [(7.5, 7.8), (11.25, 11.7)]),
];

impl BatteryLevel {
    /// Anything outside the known ranges reads as full
    pub fn from_voltage(voltage: f32) -> Self {
        BATTERY_RANGES
            .iter()
            .find(|(_, ranges)| ranges.iter().any(|(from, to)| (*from..=*to).contains(&voltage)))
            .map(|(level, _)| *level)
            .unwrap_or(BatteryLevel::Full)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Empty => "▪",
            Self::Low => "▪▪",
            Self::Medium => "▪▪▪",
            Self::High | Self::Full => "▪▪▪▪",
        }
    }
}

/// A usable IP address is assigned
pub fn is_connected(status: &Status) -> bool {
    status
        .ip
        .as_deref()
        .is_some_and(|ip| !ip.is_empty() && ip != "0.0.0.0")
}

pub fn is_ethernet(status: &Status) -> bool {
    status.connect_code() == Some(ConnectReturnCode::Ethernet)
}

/// Any of the connection fields differ from the last status seen
pub fn has_connection_changed(previous: Option<&Status>, next: &Status) -> bool {
    let Some(prev) = previous else {
        return true;
    };
    prev.urc != next.urc
        || prev.ssid != next.ssid
        || prev.gw != next.gw
        || prev.netmask != next.netmask
        || prev.ip != next.ip
        || prev.rssi != next.rssi
}

/// Strongest signal first
pub fn sort_access_points(access_points: &mut [AccessPoint]) {
    access_points.sort_by(|a, b| b.rssi.cmp(&a.rssi));
}

/// Scanning is pointless on a wired connection
pub fn should_scan(status: Option<&Status>) -> bool {
    !status.is_some_and(is_ethernet)
}

/// Result of a `connect.json` request, as seen in later status polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Failed,
    /// The device fell back to the network it was on before
    Restored,
}

impl ConnectOutcome {
    /// Check a status against the SSID we asked the device to join.
    /// `None` while the attempt is still running.
    pub fn from_status(target_ssid: &str, status: &Status) -> Option<Self> {
        let ssid = status.ssid.as_deref().unwrap_or_default();
        match status.connect_code()? {
            ConnectReturnCode::Ok if ssid == target_ssid => Some(Self::Connected),
            ConnectReturnCode::Fail if ssid == target_ssid => Some(Self::Failed),
            ConnectReturnCode::Restore if ssid != target_ssid => Some(Self::Restored),
            _ => None,
        }
    }
}

/// Bluetooth output state, from `bt_status`
pub fn bt_state_description(bt_status: u8) -> Option<&'static str> {
    const STATES: [&str; 7] = [
        "Idle",
        "Discovering",
        "Discovered",
        "Unconnected",
        "Connecting",
        "Connected",
        "Disconnecting",
    ];
    STATES.get(bt_status as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_bars() {
        assert_eq!(signal_bars(-40), 4);
        assert_eq!(signal_bars(-55), 4);
        assert_eq!(signal_bars(-58), 3);
        assert_eq!(signal_bars(-65), 2);
        assert_eq!(signal_bars(-70), 1);
        assert_eq!(signal_bars(-71), 0);
        assert_eq!(signal_label(-90), ".");
    }

    #[test]
    fn test_battery_levels() {
        assert_eq!(BatteryLevel::from_voltage(6.0), BatteryLevel::Empty);
        assert_eq!(BatteryLevel::from_voltage(7.0), BatteryLevel::Low);
        assert_eq!(BatteryLevel::from_voltage(11.2), BatteryLevel::Medium);
        assert_eq!(BatteryLevel::from_voltage(7.6), BatteryLevel::High);
        assert_eq!(BatteryLevel::from_voltage(12.4), BatteryLevel::Full);
    }

    #[test]
    fn test_connection_change() {
        let a = Status {
            urc: Some(0),
            ssid: Some("home".into()),
            ip: Some("192.168.1.20".into()),
            rssi: Some(-60),
            ..Default::default()
        };
        assert!(has_connection_changed(None, &a));
        assert!(!has_connection_changed(Some(&a), &a.clone()));

        let weaker = Status {
            rssi: Some(-61),
            ..a.clone()
        };
        assert!(has_connection_changed(Some(&a), &weaker));

        // Status fields that are not about the connection are ignored
        let other = Status {
            version: Some("v2".into()),
            ..a.clone()
        };
        assert!(!has_connection_changed(Some(&a), &other));
    }

    #[test]
    fn test_is_connected() {
        let mut status = Status::default();
        assert!(!is_connected(&status));
        status.ip = Some("0.0.0.0".into());
        assert!(!is_connected(&status));
        status.ip = Some("10.0.0.3".into());
        assert!(is_connected(&status));
    }

    #[test]
    fn test_sort_access_points() {
        let ap = |ssid: &str, rssi| AccessPoint {
            ssid: ssid.into(),
            chan: 1,
            rssi,
            auth: 3,
        };
        let mut aps = vec![ap("far", -80), ap("near", -40), ap("mid", -60)];
        sort_access_points(&mut aps);
        let order: Vec<_> = aps.iter().map(|a| a.ssid.as_str()).collect();
        assert_eq!(order, vec!["near", "mid", "far"]);
    }

    #[test]
    fn test_connect_outcome() {
        let status = |urc, ssid: &str| Status {
            urc: Some(urc),
            ssid: Some(ssid.into()),
            ..Default::default()
        };
        assert_eq!(
            ConnectOutcome::from_status("home", &status(0, "home")),
            Some(ConnectOutcome::Connected)
        );
        assert_eq!(
            ConnectOutcome::from_status("home", &status(1, "home")),
            Some(ConnectOutcome::Failed)
        );
        assert_eq!(
            ConnectOutcome::from_status("home", &status(4, "office")),
            Some(ConnectOutcome::Restored)
        );
        assert_eq!(ConnectOutcome::from_status("home", &status(0, "office")), None);
        assert!(!should_scan(Some(&status(5, ""))));
        assert!(should_scan(None));
    }
}
