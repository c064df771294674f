pub mod address;
pub mod controller;
pub mod scheduler;
pub mod transport;

pub use address::{AddressResolver, PlcAddress, COIL_MAP, REGISTER_MAP};
pub use controller::{Plc, Switch};
pub use scheduler::{HeartbeatOutcome, HeartbeatPause, IoScheduler};
pub use transport::{ModbusTransport, PlcTransport};

#[derive(Debug, thiserror::Error)]
pub enum PlcError {
    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("PLC not connected")]
    NotConnected,

    #[error("Modbus timeout during {op}")]
    Timeout { op: String },

    #[error("Modbus protocol error: {0}")]
    Protocol(String),

    #[error("Modbus exception response to {op}: {code}")]
    Exception { op: String, code: String },

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Unknown PLC address or name: {0:?}")]
    UnknownAddress(String),

    #[error("{name:?} is not a {expected} address")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("DAC channel must be 1 or 2 (got {0})")]
    InvalidChannel(u8),

    #[error("Invalid PLC configuration: {0}")]
    InvalidConfig(String),
}

impl PlcError {
    /// True when the peer dropped the link in a way a fresh connection can fix.
    pub fn is_connection_reset(&self) -> bool {
        if let PlcError::Transport(e) = self {
            if e.kind() == std::io::ErrorKind::ConnectionReset {
                return true;
            }
        }
        let text = self.to_string().to_lowercase();
        text.contains("10054") || text.contains("reset by peer") || text.contains("connectionreseterror")
    }
}

pub type Result<T> = std::result::Result<T, PlcError>;
