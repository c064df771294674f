#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use evap_link_lib::config::{PlcSettings, SerialSettings};
use evap_link_lib::plc::{PlcError, PlcTransport};
use evap_link_lib::serial::{PortOpener, Result as SerialResult, SerialError, SerialPortIO};

/// One dispatched Modbus request.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ReadCoils(u16, u16),
    WriteCoil(u16, bool),
    ReadRegisters(u16, u16),
    WriteRegister(u16, u16),
}

#[derive(Debug, Default)]
pub struct MockState {
    pub connected: bool,
    pub refuse_connect: bool,
    pub connects: u32,
    pub disconnects: u32,
    /// Requests that will fail with a connection reset before succeeding again.
    pub resets_pending: u32,
    /// Errors handed out one per request. Each one drops the link, as
    /// `ModbusTransport` does after a timeout or a transport failure.
    pub failures: VecDeque<PlcError>,
    /// Truncates coil replies to this many bits.
    pub short_coils: Option<usize>,
    pub coils: HashMap<u16, bool>,
    pub registers: HashMap<u16, u16>,
    pub calls: Vec<(Instant, Call)>,
}

impl MockState {
    pub fn dispatch_times(&self) -> Vec<Instant> {
        self.calls.iter().map(|(t, _)| *t).collect()
    }

    pub fn ops(&self) -> Vec<Call> {
        self.calls.iter().map(|(_, c)| c.clone()).collect()
    }
}

/// In-memory PLC that records every request.
pub struct MockTransport {
    pub state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }

    fn begin(&self, call: Call) -> Result<std::sync::MutexGuard<'_, MockState>, PlcError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(PlcError::NotConnected);
        }
        state.calls.push((Instant::now(), call));
        if state.resets_pending > 0 {
            state.resets_pending -= 1;
            return Err(PlcError::Transport(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        if let Some(error) = state.failures.pop_front() {
            state.connected = false;
            return Err(error);
        }
        Ok(state)
    }
}

#[async_trait]
impl PlcTransport for MockTransport {
    async fn connect(&mut self) -> Result<(), PlcError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_connect {
            return Err(PlcError::ConnectFailed {
                endpoint: "mock".into(),
                reason: "refused".into(),
            });
        }
        if !state.connected {
            state.connected = true;
            state.connects += 1;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.connected {
            state.connected = false;
            state.disconnects += 1;
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn read_coils(&mut self, addr: u16, count: u16) -> Result<Vec<bool>, PlcError> {
        let state = self.begin(Call::ReadCoils(addr, count))?;
        let mut bits: Vec<bool> = (addr..addr + count)
            .map(|a| state.coils.get(&a).copied().unwrap_or(false))
            .collect();
        if let Some(n) = state.short_coils {
            bits.truncate(n);
        }
        Ok(bits)
    }

    async fn write_single_coil(&mut self, addr: u16, value: bool) -> Result<(), PlcError> {
        let mut state = self.begin(Call::WriteCoil(addr, value))?;
        state.coils.insert(addr, value);
        Ok(())
    }

    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, PlcError> {
        let state = self.begin(Call::ReadRegisters(addr, count))?;
        Ok((addr..addr + count)
            .map(|a| state.registers.get(&a).copied().unwrap_or(0))
            .collect())
    }

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<(), PlcError> {
        let mut state = self.begin(Call::WriteRegister(addr, value))?;
        state.registers.insert(addr, value);
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

pub fn fast_plc_settings() -> PlcSettings {
    PlcSettings {
        inter_cmd_gap_s: 0.12,
        heartbeat_s: 15.0,
        ..PlcSettings::default()
    }
}

/// Scripted serial port: every write releases the next canned reply.
pub struct ScriptedPort {
    replies: VecDeque<Vec<u8>>,
    rx: VecDeque<u8>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl SerialPortIO for ScriptedPort {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.written.lock().unwrap().push(data.to_vec());
        if let Some(reply) = self.replies.pop_front() {
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.rx.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(2)));
            return Ok(0);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }
}

/// Opener serving a scripted port per port name; unknown names fail to open.
#[derive(Clone, Default)]
pub struct ScriptBook {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Vec<u8>>>>>,
    pub written: Arc<Mutex<HashMap<String, Arc<Mutex<Vec<Vec<u8>>>>>>>,
}

impl ScriptBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, port: &str, replies: Vec<Vec<u8>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(port.to_string(), replies.into_iter().collect());
    }

    pub fn written(&self, port: &str) -> Vec<Vec<u8>> {
        self.written
            .lock()
            .unwrap()
            .get(port)
            .map(|w| w.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn opener(&self) -> PortOpener {
        let book = self.clone();
        Arc::new(move |settings: &SerialSettings| -> SerialResult<Box<dyn SerialPortIO>> {
            let replies = book
                .scripts
                .lock()
                .unwrap()
                .remove(&settings.port)
                .ok_or_else(|| {
                    SerialError::IoError(io::Error::new(io::ErrorKind::NotFound, "no such port"))
                })?;
            let written = Arc::new(Mutex::new(Vec::new()));
            book.written
                .lock()
                .unwrap()
                .insert(settings.port.clone(), written.clone());
            Ok(Box::new(ScriptedPort {
                replies,
                rx: VecDeque::new(),
                written,
            }) as Box<dyn SerialPortIO>)
        })
    }
}

pub fn serial_settings(port: &str) -> SerialSettings {
    let mut settings = SerialSettings::new(port);
    settings.timeout_s = 0.05;
    settings
}
