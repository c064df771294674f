//! ACS2000 vacuum gauge controller, `$`-prefixed ASCII protocol.
//!
//! TX: `$VER<EOM>`, `$PRD,1<EOM>`. RX: one line terminated by CR with an
//! optional LF.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{PortOpener, Result, SerialError, SerialInterface, TimeoutStage};
use crate::config::{Eom, SerialSettings};

pub const REPLY_TIMEOUT: Duration = Duration::from_millis(800);
const LF_GRACE: Duration = Duration::from_millis(50);

/// Coarse classification of a reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Err,
    Ok,
    Data,
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyStatus::Err => write!(f, "ERR"),
            ReplyStatus::Ok => write!(f, "OK"),
            ReplyStatus::Data => write!(f, "DATA"),
        }
    }
}

/// `ERR_` anywhere marks an error, a leading `OK` an acknowledgement.
pub fn split_status(reply: &str) -> ReplyStatus {
    if reply.contains("ERR_") {
        ReplyStatus::Err
    } else if reply.starts_with("OK") {
        ReplyStatus::Ok
    } else {
        ReplyStatus::Data
    }
}

/// Builds `$COMMAND[,p1,p2,...]`.
pub fn format_command<S: AsRef<str>>(command: &str, params: &[S]) -> String {
    let command = command.trim().trim_start_matches('$');
    let mut out = format!("${}", command);
    for p in params {
        out.push(',');
        out.push_str(p.as_ref().trim());
    }
    out
}

/// Extracts the pressure value from any of the reply shapes the controller
/// produces: `$OK,1,0.00123`, `OK,1.2E-3`, `$PRD,1,5.0E-06` or a bare number.
pub fn parse_pressure(reply: &str) -> Result<f64> {
    let cleaned = reply.replace('$', "").replace("OK", "");
    let from_commas = cleaned
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .rev()
        .find_map(parse_finite);
    if let Some(value) = from_commas {
        return Ok(value);
    }

    reply
        .replace('$', "")
        .split_whitespace()
        .rev()
        .find_map(parse_finite)
        .ok_or_else(|| SerialError::ParseError(format!("cannot parse pressure reply: {}", reply)))
}

fn parse_finite(token: &str) -> Option<f64> {
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn check_channel(channel: u8) -> Result<()> {
    if channel == 1 || channel == 2 {
        Ok(())
    } else {
        Err(SerialError::InvalidChannel(channel))
    }
}

/// Port plus a byte read past the end of the previous line.
struct AcsLink {
    io: SerialInterface,
    carry: Option<u8>,
}

/// Reads one line up to CR, dropping a single LF that follows within 50 ms.
/// Any other byte seen in that window starts the next line.
fn read_line(link: &mut AcsLink, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut buf = Vec::new();
    let mut pending = link.carry.take();

    loop {
        let b = match pending.take() {
            Some(b) => b,
            None => match link.io.read_byte(deadline)? {
                Some(b) => b,
                None => break,
            },
        };
        buf.push(b);
        if b == b'\r' {
            if let Some(next) = link.io.read_byte(Instant::now() + LF_GRACE)? {
                if next != b'\n' {
                    link.carry = Some(next);
                }
            }
            break;
        }
    }
    Ok(buf)
}

fn decode_line(raw: &[u8]) -> String {
    raw.iter()
        .map(|b| if b.is_ascii() { *b as char } else { '\u{FFFD}' })
        .collect::<String>()
        .trim()
        .to_string()
}

pub struct Acs2000 {
    link: Mutex<AcsLink>,
    eom: Eom,
}

impl Acs2000 {
    pub fn new(settings: SerialSettings) -> Self {
        Self::from_interface(SerialInterface::new(settings))
    }

    pub fn with_opener(settings: SerialSettings, opener: PortOpener) -> Self {
        Self::from_interface(SerialInterface::with_opener(settings, opener))
    }

    pub fn from_interface(interface: SerialInterface) -> Self {
        let eom = interface.settings().eom;
        Self {
            link: Mutex::new(AcsLink {
                io: interface,
                carry: None,
            }),
            eom,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AcsLink> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn eom(&self) -> Eom {
        self.eom
    }

    pub fn connect(&self) -> Result<()> {
        self.lock().io.connect()
    }

    pub fn close(&self) {
        let mut link = self.lock();
        link.carry = None;
        link.io.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().io.is_connected()
    }

    pub fn port_name(&self) -> String {
        self.lock().io.settings().port.clone()
    }

    /// Writes `payload + EOM` on a cleared link and returns the trimmed reply line.
    pub fn txrx(&self, payload: &str, timeout: Duration) -> Result<String> {
        let mut payload = payload.trim().to_string();
        if !payload.starts_with('$') {
            payload.insert(0, '$');
        }
        let mut tx: Vec<u8> = payload
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect();
        tx.extend_from_slice(self.eom.as_bytes());

        let mut link = self.lock();
        link.carry = None;
        link.io.clear_buffers()?;
        link.io.send_data(&tx)?;
        let rx = read_line(&mut link, timeout)?;
        drop(link);

        if rx.is_empty() {
            return Err(SerialError::NoResponse(payload));
        }
        let reply = decode_line(&rx);
        log::debug!("ACS2000 {:?} -> {:?}", payload, reply);
        Ok(reply)
    }

    /// Sends any documented mnemonic with comma separated parameters.
    pub fn raw<S: AsRef<str>>(&self, command: &str, params: &[S]) -> Result<String> {
        if command.trim().trim_start_matches('$').is_empty() {
            return Err(SerialError::InvalidArgument("command is empty".into()));
        }
        self.txrx(&format_command(command, params), REPLY_TIMEOUT)
    }

    pub fn query_version(&self) -> Result<String> {
        self.raw::<&str>("VER", &[])
    }

    pub fn query_pressure(&self, channel: u8) -> Result<f64> {
        check_channel(channel)?;
        let reply = self.raw("PRD", &[channel.to_string()])?;
        if split_status(&reply) == ReplyStatus::Err {
            return Err(SerialError::InstrumentError(reply));
        }
        parse_pressure(&reply)
    }

    /// Puts the controller into continuous transmission (`$CON,<interval>`).
    pub fn start_pressure_stream(&self, interval: u32) -> Result<String> {
        self.raw("CON", &[interval.to_string()])
    }

    /// Reads one unsolicited line pushed while streaming.
    pub fn read_stream_line(&self, timeout: Duration) -> Result<String> {
        let rx = read_line(&mut self.lock(), timeout)?;
        if rx.is_empty() {
            return Err(SerialError::Timeout(TimeoutStage::Stream));
        }
        Ok(decode_line(&rx))
    }

    /// The controller has no reliable stop command; closing the port ends the stream.
    pub fn stop_stream(&self) {
        log::info!("Stopping ACS2000 stream by closing {}", self.port_name());
        self.close();
    }
}
