use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, Result};

/// Serial parity as written in the station configuration ("N", "E", "O").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Parity {
    #[default]
    #[serde(rename = "N", alias = "n", alias = "none")]
    None,
    #[serde(rename = "E", alias = "e", alias = "even")]
    Even,
    #[serde(rename = "O", alias = "o", alias = "odd")]
    Odd,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

/// End-of-message sequence for the ACS2000 ASCII protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Eom {
    #[default]
    Cr,
    #[serde(rename = "CRLF")]
    CrLf,
}

impl Eom {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Eom::Cr => b"\r",
            Eom::CrLf => b"\r\n",
        }
    }
}

/// How a coil is driven when a switch is toggled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SwitchMode {
    #[default]
    Latch,
    Momentary,
}

/// RS-232 link parameters for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub timeout_s: f64,
    pub write_timeout_s: f64,
    pub rts_cts: bool,
    pub dsr_dtr: bool,
    /// Only used by the ACS2000 gauge controller.
    pub eom: Eom,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            timeout_s: 0.5,
            write_timeout_s: 0.5,
            rts_cts: false,
            dsr_dtr: false,
            eom: Eom::Cr,
        }
    }
}

impl SerialSettings {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout_s)
    }

    pub fn write_timeout(&self) -> Duration {
        secs(self.write_timeout_s)
    }

    /// Human readable endpoint used in connect errors and logs.
    pub fn endpoint(&self) -> String {
        format!(
            "{} @ {} {}{}{}",
            self.port,
            self.baud_rate,
            self.data_bits,
            parity_letter(self.parity),
            self.stop_bits
        )
    }

    pub fn validate(&self, section: &str) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::invalid(section, "port is empty"));
        }
        // reads poll in timeout-sized chunks
        if self.timeout_s <= 0.0 || self.timeout_s.is_nan() {
            return Err(ConfigError::invalid(section, "timeout_s must be > 0"));
        }
        if self.write_timeout_s <= 0.0 || self.write_timeout_s.is_nan() {
            return Err(ConfigError::invalid(section, "write_timeout_s must be > 0"));
        }
        validate_line(section, self.baud_rate, self.data_bits, self.stop_bits)
    }
}

/// Physical link used to reach the PLC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum PlcEndpoint {
    Rtu {
        port: String,
        #[serde(default = "default_baud")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
    Tcp {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
}

impl Default for PlcEndpoint {
    fn default() -> Self {
        PlcEndpoint::Rtu {
            port: "COM5".to_string(),
            baud_rate: default_baud(),
            data_bits: default_data_bits(),
            parity: Parity::None,
            stop_bits: default_stop_bits(),
        }
    }
}

impl PlcEndpoint {
    pub fn describe(&self) -> String {
        match self {
            PlcEndpoint::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => format!(
                "rtu:{} @ {} {}{}{}",
                port,
                baud_rate,
                data_bits,
                parity_letter(*parity),
                stop_bits
            ),
            PlcEndpoint::Tcp { host, port } => format!("tcp:{}:{}", host, port),
        }
    }
}

/// DAC output scaling for the two analog power channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DacSettings {
    /// Code span covering the whole engineering range (e.g. 4000 or 4095).
    pub full_scale_code: i32,
    /// Code that corresponds to the bottom of the range.
    pub offset_code: i32,
    pub current_min_ma: f64,
    pub current_max_ma: f64,
    pub voltage_min_v: f64,
    pub voltage_max_v: f64,
}

impl Default for DacSettings {
    fn default() -> Self {
        Self {
            full_scale_code: 4000,
            offset_code: 0,
            current_min_ma: 4.0,
            current_max_ma: 20.0,
            voltage_min_v: 0.0,
            voltage_max_v: 10.0,
        }
    }
}

impl DacSettings {
    pub fn validate(&self) -> Result<()> {
        if self.full_scale_code <= 0 {
            return Err(ConfigError::invalid(
                "dac.full_scale_code",
                format!("must be > 0 (now={})", self.full_scale_code),
            ));
        }
        if i64::from(self.offset_code) + i64::from(self.full_scale_code) > i64::from(u16::MAX)
            || self.offset_code < 0
        {
            return Err(ConfigError::invalid(
                "dac.offset_code",
                "offset..offset+full_scale must fit a 16-bit register",
            ));
        }
        if self.current_max_ma <= self.current_min_ma {
            return Err(ConfigError::invalid(
                "dac.current",
                format!("invalid range {}..{}", self.current_min_ma, self.current_max_ma),
            ));
        }
        if self.voltage_max_v <= self.voltage_min_v {
            return Err(ConfigError::invalid(
                "dac.voltage",
                format!("invalid range {}..{}", self.voltage_min_v, self.voltage_max_v),
            ));
        }
        Ok(())
    }
}

/// PLC connection and scheduling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcSettings {
    pub endpoint: PlcEndpoint,
    pub unit_id: u8,
    pub timeout_s: f64,
    pub inter_cmd_gap_s: f64,
    pub heartbeat_s: f64,
    pub pulse_ms: u64,
    pub lock_warn_ms: u64,
    pub io_warn_ms: u64,
    pub door_mode: SwitchMode,
    pub dac: DacSettings,
}

impl Default for PlcSettings {
    fn default() -> Self {
        Self {
            endpoint: PlcEndpoint::default(),
            unit_id: 1,
            timeout_s: 2.0,
            inter_cmd_gap_s: 0.12,
            heartbeat_s: 15.0,
            pulse_ms: 180,
            lock_warn_ms: 800,
            io_warn_ms: 1500,
            door_mode: SwitchMode::Latch,
            dac: DacSettings::default(),
        }
    }
}

impl PlcSettings {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_s)
    }

    pub fn inter_cmd_gap(&self) -> Duration {
        secs(self.inter_cmd_gap_s)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        secs(self.heartbeat_s)
    }

    pub fn pulse_width(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }

    pub fn lock_warn(&self) -> Duration {
        Duration::from_millis(self.lock_warn_ms)
    }

    pub fn io_warn(&self) -> Duration {
        Duration::from_millis(self.io_warn_ms)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.endpoint {
            PlcEndpoint::Rtu {
                port,
                baud_rate,
                data_bits,
                stop_bits,
                ..
            } => {
                if port.trim().is_empty() {
                    return Err(ConfigError::invalid("plc.port", "port is empty"));
                }
                validate_line("plc", *baud_rate, *data_bits, *stop_bits)?;
            }
            PlcEndpoint::Tcp { host, .. } => {
                if host.trim().is_empty() {
                    return Err(ConfigError::invalid("plc.host", "host is empty"));
                }
            }
        }
        if self.timeout_s <= 0.0 {
            return Err(ConfigError::invalid("plc.timeout_s", "must be > 0"));
        }
        if self.heartbeat_s <= 0.0 {
            return Err(ConfigError::invalid("plc.heartbeat_s", "must be > 0"));
        }
        self.dac.validate()
    }
}

/// Settings for every device the station talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(default)]
    pub plc: PlcSettings,
    pub stm100: SerialSettings,
    pub acs2000: SerialSettings,
}

impl StationConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: StationConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.plc.validate()?;
        self.stm100.validate("stm100")?;
        self.acs2000.validate("acs2000")
    }
}

fn validate_line(section: &str, baud_rate: u32, data_bits: u8, stop_bits: u8) -> Result<()> {
    if baud_rate == 0 {
        return Err(ConfigError::invalid(section, "baud rate must be > 0"));
    }
    if !(5..=8).contains(&data_bits) {
        return Err(ConfigError::invalid(section, format!("unsupported byte size {}", data_bits)));
    }
    if !(1..=2).contains(&stop_bits) {
        return Err(ConfigError::invalid(section, format!("unsupported stop bits {}", stop_bits)));
    }
    Ok(())
}

fn parity_letter(parity: Parity) -> char {
    match parity {
        Parity::None => 'N',
        Parity::Even => 'E',
        Parity::Odd => 'O',
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn default_baud() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_modbus_port() -> u16 {
    502
}
