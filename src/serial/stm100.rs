//! Sycon STM-100/MF thickness monitor protocol.
//!
//! Frames are `STX | LEN | DATA | CHK` where DATA is 1..=10 ASCII bytes and
//! CHK is the low byte of the sum of the DATA bytes. A reply's first data byte
//! is a status letter, the rest is the body.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{PortOpener, Result, SerialError, SerialInterface, TimeoutStage};
use crate::config::SerialSettings;

pub const STX: u8 = 0x02;
pub const MAX_DATA_LEN: usize = 10;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Status letters with a documented meaning, and whether they acknowledge the command.
const CODE_TABLE: &[(char, &str, bool)] = &[
    ('A', "OK (No reset)", true),
    ('B', "OK (Power lost flag set)", true),
    ('F', "Illegal Command (No reset)", false),
    ('G', "Illegal Command (Power lost flag set)", false),
    ('H', "Illegal Data Value (No reset)", false),
    ('I', "Illegal Data Value (Power lost flag set)", false),
    ('J', "Illegal Command Modifier (No reset)", false),
    ('K', "Illegal Command Modifier (Power lost flag set)", false),
];

/// Looks up the documented meaning of a status letter.
pub fn code_meaning(code: char) -> Option<&'static str> {
    CODE_TABLE
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, meaning, _)| *meaning)
}

/// Only letters the table names as rejections fail a command.
pub fn is_rejection(code: char) -> bool {
    CODE_TABLE.iter().any(|(c, _, ok)| *c == code && !ok)
}

pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Builds `STX | LEN | DATA | CHK` for 1..=10 ASCII bytes of data.
pub fn build_frame(data: &str) -> Result<Vec<u8>> {
    let bytes: Vec<u8> = data
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect();
    if bytes.is_empty() || bytes.len() > MAX_DATA_LEN {
        return Err(SerialError::InvalidLength(bytes.len()));
    }

    let mut frame = Vec::with_capacity(bytes.len() + 3);
    frame.push(STX);
    frame.push(bytes.len() as u8);
    frame.extend_from_slice(&bytes);
    frame.push(checksum(&bytes));
    Ok(frame)
}

/// Parses a complete frame held in memory. Leading noise before STX is skipped.
///
/// Returns the payload and whether its checksum matched.
pub fn parse_frame(frame: &[u8]) -> Result<(String, bool)> {
    let start = frame
        .iter()
        .position(|b| *b == STX)
        .ok_or(SerialError::Timeout(TimeoutStage::Stx))?;
    let rest = &frame[start + 1..];

    let len = *rest.first().ok_or(SerialError::Timeout(TimeoutStage::Len))? as usize;
    if !(1..=MAX_DATA_LEN).contains(&len) {
        return Err(SerialError::InvalidLength(len));
    }
    let data = rest
        .get(1..1 + len)
        .ok_or(SerialError::Timeout(TimeoutStage::Data))?;
    let chk = *rest.get(1 + len).ok_or(SerialError::Timeout(TimeoutStage::Chk))?;

    Ok((decode_ascii(data), checksum(data) == chk))
}

/// Reads one frame from the link. All reads share one `timeout` budget.
pub fn read_frame(link: &mut SerialInterface, timeout: Duration) -> Result<(String, bool)> {
    let deadline = Instant::now() + timeout;

    loop {
        match link.read_byte(deadline)? {
            Some(STX) => break,
            Some(_) => continue,
            None => return Err(SerialError::Timeout(TimeoutStage::Stx)),
        }
    }

    let len = link
        .read_byte(deadline)?
        .ok_or(SerialError::Timeout(TimeoutStage::Len))? as usize;
    if !(1..=MAX_DATA_LEN).contains(&len) {
        return Err(SerialError::InvalidLength(len));
    }

    let data = link.read_until_deadline(len, deadline)?;
    if data.len() != len {
        return Err(SerialError::Timeout(TimeoutStage::Data));
    }

    let chk = link
        .read_byte(deadline)?
        .ok_or(SerialError::Timeout(TimeoutStage::Chk))?;

    Ok((decode_ascii(&data), checksum(&data) == chk))
}

fn decode_ascii(data: &[u8]) -> String {
    data.iter()
        .map(|b| if b.is_ascii() { *b as char } else { '\u{FFFD}' })
        .collect()
}

/// One reply frame, split into status letter and body.
#[derive(Debug, Clone, PartialEq)]
pub struct StmReply {
    pub code: char,
    pub body: String,
    pub raw: String,
    pub checksum_ok: bool,
}

impl StmReply {
    pub fn from_payload(payload: String, checksum_ok: bool) -> Self {
        let mut chars = payload.chars();
        let code = chars.next().unwrap_or('\0');
        let body = chars.as_str().to_string();
        Self {
            code,
            body,
            raw: payload,
            checksum_ok,
        }
    }

    pub fn is_rejected(&self) -> bool {
        is_rejection(self.code)
    }

    pub fn meaning(&self) -> &'static str {
        code_meaning(self.code).unwrap_or("Unknown code")
    }
}

/// STM-100 driver. One lock guards the link for the whole exchange.
pub struct Stm100 {
    link: Mutex<SerialInterface>,
}

impl Stm100 {
    pub fn new(settings: SerialSettings) -> Self {
        Self::from_interface(SerialInterface::new(settings))
    }

    pub fn with_opener(settings: SerialSettings, opener: PortOpener) -> Self {
        Self::from_interface(SerialInterface::with_opener(settings, opener))
    }

    pub fn from_interface(interface: SerialInterface) -> Self {
        Self {
            link: Mutex::new(interface),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SerialInterface> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connect(&self) -> Result<()> {
        self.lock().connect()
    }

    pub fn close(&self) {
        self.lock().disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_connected()
    }

    pub fn port_name(&self) -> String {
        self.lock().settings().port.clone()
    }

    /// Sends one command frame and reads the reply, checksum flag included.
    pub fn transact(&self, cmd: &str, timeout: Duration) -> Result<StmReply> {
        let cmd = cmd.trim();
        if cmd.is_empty() {
            return Err(SerialError::InvalidArgument("command is empty".into()));
        }
        let frame = build_frame(cmd)?;

        let mut link = self.lock();
        link.clear_buffers()?;
        link.send_data(&frame)?;
        let (payload, checksum_ok) = read_frame(&mut link, timeout)?;
        drop(link);

        log::debug!("STM-100 {:?} -> {:?} (checksum ok: {})", cmd, payload, checksum_ok);
        Ok(StmReply::from_payload(payload, checksum_ok))
    }

    /// Like [`transact`](Self::transact) but a bad checksum is an error.
    pub fn exchange(&self, cmd: &str, timeout: Duration) -> Result<StmReply> {
        let reply = self.transact(cmd, timeout)?;
        if !reply.checksum_ok {
            return Err(SerialError::ChecksumMismatch { payload: reply.raw });
        }
        Ok(reply)
    }

    /// Generic command: one token letter, optional modifier, optional data.
    pub fn command(&self, token: char, modifier: Option<char>, data: &str) -> Result<String> {
        let mut cmd = String::new();
        cmd.push(token);
        if let Some(m) = modifier {
            cmd.push(m);
        }
        cmd.push_str(data);
        self.query_text(&cmd)
    }

    /// Sends `cmd` and returns the trimmed body of an accepted reply.
    pub fn query_text(&self, cmd: &str) -> Result<String> {
        let reply = self.exchange(cmd, DEFAULT_TIMEOUT)?;
        if reply.is_rejected() {
            return Err(SerialError::CommandRejected {
                code: reply.code,
                meaning: reply.meaning().to_string(),
                sent: cmd.to_string(),
                body: reply.body,
            });
        }
        if code_meaning(reply.code).is_none() {
            log::warn!("STM-100 replied with undocumented status {:?} to {:?}", reply.code, cmd);
        }
        Ok(reply.body.trim().to_string())
    }

    pub fn get_version(&self) -> Result<String> {
        self.command('@', None, "")
    }

    /// Thickness in angstrom (body looks like `-0001595`).
    pub fn get_thickness(&self) -> Result<f64> {
        parse_number(&self.command('S', None, "")?)
    }

    /// Deposition rate in angstrom per second.
    pub fn get_rate(&self) -> Result<f64> {
        parse_number(&self.command('T', None, "")?)
    }

    pub fn shutter(&self, on: bool) -> Result<()> {
        self.command('A', Some(if on { '!' } else { '@' }), "")?;
        Ok(())
    }

    pub fn shutter_state(&self) -> Result<String> {
        self.command('A', Some('?'), "")
    }

    pub fn acknowledge_reset_flag(&self) -> Result<()> {
        self.command('L', None, "")?;
        Ok(())
    }
}

fn parse_number(body: &str) -> Result<f64> {
    body.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| SerialError::ParseError(format!("non-numeric body {:?}", body)))
}
