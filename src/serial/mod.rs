pub mod interface;
pub mod stm100;
pub mod acs2000;

pub use interface::{PortOpener, SerialInterface, SerialPortIO};
pub use stm100::{Stm100, StmReply};
pub use acs2000::{Acs2000, ReplyStatus};

use std::fmt;

/// Which part of an exchange ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    Stx,
    Len,
    Data,
    Chk,
    Response,
    Stream,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutStage::Stx => "STX",
            TimeoutStage::Len => "LEN",
            TimeoutStage::Data => "DATA",
            TimeoutStage::Chk => "CHK",
            TimeoutStage::Response => "response",
            TimeoutStage::Stream => "stream data",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("Device not connected")]
    NotConnected,

    #[error("Communication timeout waiting for {0}")]
    Timeout(TimeoutStage),

    #[error("Invalid frame length {0} (expected 1..=10)")]
    InvalidLength(usize),

    #[error("Checksum mismatch (rx={payload:?})")]
    ChecksumMismatch { payload: String },

    #[error("Command failed: {meaning} | sent={sent:?} | body={body:?}")]
    CommandRejected {
        code: char,
        meaning: String,
        sent: String,
        body: String,
    },

    #[error("No response for {0:?}")]
    NoResponse(String),

    #[error("Instrument reported error: {0}")]
    InstrumentError(String),

    #[error("Cannot parse reply: {0}")]
    ParseError(String),

    #[error("Channel must be 1 or 2 (got {0})")]
    InvalidChannel(u8),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
