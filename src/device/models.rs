use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The RS-232 instruments owned by the device manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Stm100,
    Acs2000,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 2] = [DeviceKind::Stm100, DeviceKind::Acs2000];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Stm100 => "stm100",
            DeviceKind::Acs2000 => "acs2000",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Snapshot of one instrument as last observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub kind: DeviceKind,
    pub port: String,
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl DeviceStatus {
    pub fn new(kind: DeviceKind, port: impl Into<String>) -> Self {
        Self {
            kind,
            port: port.into(),
            connection_state: ConnectionState::Disconnected,
            last_error: None,
            last_seen: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Connected)
    }

    pub fn update_connection_state(&mut self, state: ConnectionState) {
        if let ConnectionState::Error(msg) = &state {
            self.last_error = Some(msg.clone());
        }
        self.connection_state = state;
        self.last_seen = Utc::now();
    }

    /// Records a successful exchange.
    pub fn mark_ok(&mut self) {
        self.connection_state = ConnectionState::Connected;
        self.last_error = None;
        self.last_seen = Utc::now();
    }

    /// Records a failed exchange; the link stays up unless `connected` is false.
    pub fn mark_failed(&mut self, error: String, connected: bool) {
        self.connection_state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Error(error.clone())
        };
        self.last_error = Some(error);
        self.last_seen = Utc::now();
    }
}
