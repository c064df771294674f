use std::time::Duration;

use async_trait::async_trait;
use tokio::time::error::Elapsed;
use tokio_modbus::client::{rtu, tcp, Context, Reader, Writer};
use tokio_modbus::Slave;
use tokio_serial::{SerialPort, SerialPortBuilderExt};

use super::{PlcError, Result};
use crate::config::{PlcEndpoint, PlcSettings};

/// Raw Modbus access to one PLC. Callers serialize access; implementations
/// may assume at most one call in flight.
///
/// After a timeout or a transport failure `is_connected` must report false,
/// so the caller re-opens the link before the next request.
#[async_trait]
pub trait PlcTransport: Send {
    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    async fn read_coils(&mut self, addr: u16, count: u16) -> Result<Vec<bool>>;

    async fn write_single_coil(&mut self, addr: u16, value: bool) -> Result<()>;

    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>>;

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<()>;

    fn describe(&self) -> String;
}

/// Modbus RTU or TCP client backed by `tokio-modbus`.
pub struct ModbusTransport {
    endpoint: PlcEndpoint,
    unit_id: u8,
    timeout: Duration,
    ctx: Option<Context>,
}

impl ModbusTransport {
    pub fn new(settings: &PlcSettings) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            unit_id: settings.unit_id,
            timeout: settings.timeout(),
            ctx: None,
        }
    }

    fn connect_failed(&self, reason: impl ToString) -> PlcError {
        PlcError::ConnectFailed {
            endpoint: self.endpoint.describe(),
            reason: reason.to_string(),
        }
    }

    async fn open_context(&mut self) -> Result<Context> {
        let slave = Slave(self.unit_id);
        match &self.endpoint {
            PlcEndpoint::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let data_bits = match *data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };
                let stop_bits = match *stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };
                let serial = tokio_serial::new(port, *baud_rate)
                    .data_bits(data_bits)
                    .parity((*parity).into())
                    .stop_bits(stop_bits)
                    .timeout(self.timeout)
                    .open_native_async()
                    .map_err(|e| self.connect_failed(e))?;
                serial
                    .clear(tokio_serial::ClearBuffer::All)
                    .map_err(|e| self.connect_failed(e))?;
                Ok(rtu::attach_slave(serial, slave))
            }
            PlcEndpoint::Tcp { host, port } => {
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| self.connect_failed(e))?
                    .next()
                    .ok_or_else(|| self.connect_failed("host did not resolve"))?;
                let ctx = tokio::time::timeout(self.timeout, tcp::connect_slave(addr, slave))
                    .await
                    .map_err(|_| self.connect_failed("connect timed out"))?
                    .map_err(|e| self.connect_failed(e))?;
                Ok(ctx)
            }
        }
    }

    fn context(&mut self) -> Result<&mut Context> {
        self.ctx.as_mut().ok_or(PlcError::NotConnected)
    }

    /// Maps a timed request to its result. A timeout or a transport-level
    /// failure leaves the context out of step with the device, so it is
    /// dropped and the next request starts on a fresh link.
    fn settle<T>(
        &mut self,
        op: &str,
        outcome: std::result::Result<tokio_modbus::Result<T>, Elapsed>,
    ) -> Result<T> {
        let result = match outcome {
            Ok(result) => flatten(op, result),
            Err(_) => Err(PlcError::Timeout { op: op.to_string() }),
        };
        if let Err(e) = &result {
            if drops_link(e) && self.ctx.take().is_some() {
                log::warn!(
                    "Dropping PLC link {} after {}: {}",
                    self.endpoint.describe(),
                    op,
                    e
                );
            }
        }
        result
    }
}

#[async_trait]
impl PlcTransport for ModbusTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let ctx = self.open_context().await?;
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn disconnect(&mut self) {
        // dropping the context closes the port or socket
        self.ctx = None;
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn read_coils(&mut self, addr: u16, count: u16) -> Result<Vec<bool>> {
        let timeout = self.timeout;
        let ctx = self.context()?;
        let outcome = tokio::time::timeout(timeout, ctx.read_coils(addr, count)).await;
        self.settle("read_coils", outcome)
    }

    async fn write_single_coil(&mut self, addr: u16, value: bool) -> Result<()> {
        let timeout = self.timeout;
        let ctx = self.context()?;
        let outcome = tokio::time::timeout(timeout, ctx.write_single_coil(addr, value)).await;
        self.settle("write_coil", outcome)
    }

    async fn read_holding_registers(&mut self, addr: u16, count: u16) -> Result<Vec<u16>> {
        let timeout = self.timeout;
        let ctx = self.context()?;
        let outcome = tokio::time::timeout(timeout, ctx.read_holding_registers(addr, count)).await;
        self.settle("read_holding_registers", outcome)
    }

    async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<()> {
        let timeout = self.timeout;
        let ctx = self.context()?;
        let outcome = tokio::time::timeout(timeout, ctx.write_single_register(addr, value)).await;
        self.settle("write_register", outcome)
    }

    fn describe(&self) -> String {
        format!("{} (unit {})", self.endpoint.describe(), self.unit_id)
    }
}

/// Errors after which the link can no longer be trusted. Exception
/// responses are complete frames and leave it in step.
fn drops_link(error: &PlcError) -> bool {
    matches!(
        error,
        PlcError::Timeout { .. } | PlcError::Transport(_) | PlcError::Protocol(_)
    )
}

/// Collapses the transport and exception layers of a tokio-modbus result.
fn flatten<T>(op: &str, result: tokio_modbus::Result<T>) -> Result<T> {
    match result {
        Err(tokio_modbus::Error::Transport(e)) => Err(PlcError::Transport(e)),
        Err(e) => Err(PlcError::Protocol(e.to_string())),
        Ok(Err(code)) => Err(PlcError::Exception {
            op: op.to_string(),
            code: format!("{:?}", code),
        }),
        Ok(Ok(value)) => Ok(value),
    }
}
