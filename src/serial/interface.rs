use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort, StopBits};

use super::{Result, SerialError};
use crate::config::SerialSettings;

/// Shortest wait handed to a single port read.
const MIN_READ_CHUNK: Duration = Duration::from_millis(1);

/// Minimal byte-level port used by the instrument codecs.
///
/// Implemented for real serial ports; tests provide scripted loopbacks.
pub trait SerialPortIO: Send {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()>;

    fn flush(&mut self) -> std::io::Result<()>;

    /// Reads up to `buf.len()` bytes, waiting at most `timeout`.
    /// `Ok(0)` means nothing arrived in time.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    /// Drops any pending input and output bytes.
    fn clear_buffers(&mut self) -> std::io::Result<()>;
}

/// Opens a port for the given settings.
pub type PortOpener = Arc<dyn Fn(&SerialSettings) -> Result<Box<dyn SerialPortIO>> + Send + Sync>;

struct NativePort {
    port: Box<dyn SerialPort>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl SerialPortIO for NativePort {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.port.set_timeout(self.write_timeout)?;
        let result = self.port.write_all(data);
        self.port.set_timeout(self.read_timeout)?;
        result
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        if timeout.is_zero() {
            return Ok(0);
        }
        if timeout != self.read_timeout {
            self.port.set_timeout(timeout)?;
            self.read_timeout = timeout;
        }
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_buffers(&mut self) -> std::io::Result<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }
}

/// Opens a real RS-232 port with the settings' line parameters.
pub fn open_native(settings: &SerialSettings) -> Result<Box<dyn SerialPortIO>> {
    let data_bits = match settings.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        other => {
            return Err(SerialError::InvalidArgument(format!("unsupported byte size {}", other)))
        }
    };
    let stop_bits = match settings.stop_bits {
        1 => StopBits::One,
        2 => StopBits::Two,
        other => {
            return Err(SerialError::InvalidArgument(format!("unsupported stop bits {}", other)))
        }
    };
    let flow_control = if settings.rts_cts {
        FlowControl::Hardware
    } else {
        FlowControl::None
    };

    let mut port = serialport::new(&settings.port, settings.baud_rate)
        .data_bits(data_bits)
        .parity(settings.parity.into())
        .stop_bits(stop_bits)
        .flow_control(flow_control)
        .timeout(settings.timeout())
        .open()?;

    if settings.dsr_dtr {
        port.write_data_terminal_ready(true)?;
    }

    Ok(Box::new(NativePort {
        port,
        read_timeout: settings.timeout(),
        write_timeout: settings.write_timeout(),
    }))
}

/// One RS-232 link to one instrument.
pub struct SerialInterface {
    settings: SerialSettings,
    opener: PortOpener,
    port: Option<Box<dyn SerialPortIO>>,
}

impl SerialInterface {
    pub fn new(settings: SerialSettings) -> Self {
        Self::with_opener(settings, Arc::new(open_native))
    }

    pub fn with_opener(settings: SerialSettings, opener: PortOpener) -> Self {
        Self {
            settings,
            opener,
            port: None,
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Open the port. Does nothing if it is already open.
    pub fn connect(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let endpoint = self.settings.endpoint();
        let mut port = (self.opener)(&self.settings).map_err(|e| SerialError::ConnectFailed {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;

        // Start clean so a previously aborted exchange cannot leak into the next one
        port.clear_buffers().map_err(|e| SerialError::ConnectFailed {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;

        self.port = Some(port);
        log::info!("Opened serial port {}", endpoint);
        Ok(())
    }

    /// Close the port. Safe to call any number of times.
    pub fn disconnect(&mut self) {
        if self.port.take().is_some() {
            log::info!("Closed serial port {}", self.settings.port);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPortIO>> {
        self.port.as_mut().ok_or(SerialError::NotConnected)
    }

    pub fn clear_buffers(&mut self) -> Result<()> {
        self.port_mut()?.clear_buffers()?;
        Ok(())
    }

    /// Send data to the connected device
    pub fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    /// Read a single byte, giving up at `deadline`.
    pub fn read_byte(&mut self, deadline: Instant) -> Result<Option<u8>> {
        let chunk = self.settings.timeout().max(MIN_READ_CHUNK);
        let port = self.port_mut()?;
        let mut buf = [0u8; 1];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(chunk);
            if port.read_timeout(&mut buf, wait)? == 1 {
                return Ok(Some(buf[0]));
            }
        }
    }

    /// Read up to `n` bytes before `deadline`. May return fewer on timeout.
    pub fn read_until_deadline(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>> {
        let chunk = self.settings.timeout().max(MIN_READ_CHUNK);
        let port = self.port_mut()?;
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(chunk);
            filled += port.read_timeout(&mut out[filled..], wait)?;
        }
        out.truncate(filled);
        Ok(out)
    }
}

impl std::fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialInterface")
            .field("port", &self.settings.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}
