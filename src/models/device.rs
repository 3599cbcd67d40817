use std::fmt;

/// Availability of the bridge tool (adb).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BridgeState {
    #[default]
    Unknown,
    Checking,
    Available,
    Unavailable,
}

/// Device connectivity as last reported by the bridge tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceState {
    #[default]
    Unknown,
    Checking,
    Connected(Vec<String>),
    Disconnected,
    Error(String),
}

/// Snapshot of bridge tool and device status.
///
/// Replaced wholesale on every check. Built only through the constructors below so that
/// `Connected` never appears without `BridgeState::Available`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    bridge_state: BridgeState,
    device_state: DeviceState,
    bridge_version: Option<String>,
}

impl DeviceStatus {
    /// Nothing checked yet
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn checking() -> Self {
        Self {
            bridge_state: BridgeState::Checking,
            device_state: DeviceState::Checking,
            bridge_version: None,
        }
    }

    /// Bridge tool works; `devices` may be empty.
    pub fn available(version: Option<String>, devices: Vec<String>) -> Self {
        let device_state = if devices.is_empty() {
            DeviceState::Disconnected
        } else {
            DeviceState::Connected(devices)
        };
        Self {
            bridge_state: BridgeState::Available,
            device_state,
            bridge_version: version,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            bridge_state: BridgeState::Unavailable,
            device_state: DeviceState::Error(reason.into()),
            bridge_version: None,
        }
    }

    pub fn bridge_state(&self) -> &BridgeState {
        &self.bridge_state
    }

    pub fn device_state(&self) -> &DeviceState {
        &self.device_state
    }

    pub fn bridge_version(&self) -> Option<&str> {
        self.bridge_version.as_deref()
    }

    pub fn is_checking(&self) -> bool {
        self.bridge_state == BridgeState::Checking || self.device_state == DeviceState::Checking
    }

    /// True once a check has settled into a final state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.bridge_state,
            BridgeState::Available | BridgeState::Unavailable
        ) && matches!(
            self.device_state,
            DeviceState::Connected(_) | DeviceState::Disconnected | DeviceState::Error(_)
        )
    }

    pub fn connected_devices(&self) -> &[String] {
        match &self.device_state {
            DeviceState::Connected(ids) => ids,
            _ => &[],
        }
    }

    pub fn has_connected_device(&self) -> bool {
        !self.connected_devices().is_empty()
    }

    /// One-line description suitable for a status label.
    pub fn summary(&self) -> String {
        let bridge = match &self.bridge_state {
            BridgeState::Unknown => "adb: unknown".to_string(),
            BridgeState::Checking => "adb: checking...".to_string(),
            BridgeState::Available => match &self.bridge_version {
                Some(version) => format!("adb: installed ({})", version),
                None => "adb: installed".to_string(),
            },
            BridgeState::Unavailable => "adb: unavailable".to_string(),
        };
        format!("{}; devices: {}", bridge, self.device_state)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Unknown => write!(f, "unknown"),
            DeviceState::Checking => write!(f, "checking..."),
            DeviceState::Connected(ids) => {
                let noun = if ids.len() == 1 { "device" } else { "devices" };
                write!(f, "connected ({} {}: {})", ids.len(), noun, ids.join(", "))
            }
            DeviceState::Disconnected => write!(f, "no device connected"),
            DeviceState::Error(reason) => write!(f, "check failed: {}", reason),
        }
    }
}
