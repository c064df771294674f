use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::address::{AddressResolver, PlcAddress, COIL_MAP};
use super::scheduler::{HeartbeatPause, HeartbeatTask, IoMeta, IoScheduler};
use super::transport::{ModbusTransport, PlcTransport};
use super::{PlcError, Result};
use crate::config::{DacSettings, PlcSettings, SwitchMode};

const MIN_PULSE: Duration = Duration::from_millis(10);

/// Coil blocks polled for the status snapshot: rough pump through door, then utilities.
const STATUS_BLOCKS: [(u16, u16); 2] = [(0, 13), (32, 4)];

/// The station's switchable outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Switch {
    RoughPump,
    RoughValve,
    ForeValve,
    MainValve,
    VentValve,
    TurboPump,
    Shutter1,
    Shutter2,
    MainShutter,
    Power1,
    Power2,
    Ftm,
    Door,
    Air,
    Water,
    Gas1,
    Gas2,
}

impl Switch {
    pub const ALL: [Switch; 17] = [
        Switch::RoughPump,
        Switch::RoughValve,
        Switch::ForeValve,
        Switch::MainValve,
        Switch::VentValve,
        Switch::TurboPump,
        Switch::Shutter1,
        Switch::Shutter2,
        Switch::MainShutter,
        Switch::Power1,
        Switch::Power2,
        Switch::Ftm,
        Switch::Door,
        Switch::Air,
        Switch::Water,
        Switch::Gas1,
        Switch::Gas2,
    ];

    /// Canonical coil name.
    pub fn name(self) -> &'static str {
        match self {
            Switch::RoughPump => "R_P_SW",
            Switch::RoughValve => "R_V_SW",
            Switch::ForeValve => "F_V_SW",
            Switch::MainValve => "M_V_SW",
            Switch::VentValve => "V_V_SW",
            Switch::TurboPump => "TMP_SW",
            Switch::Shutter1 => "SHUTTER_1_SW",
            Switch::Shutter2 => "SHUTTER_2_SW",
            Switch::MainShutter => "MAIN_SHUTTER_SW",
            Switch::Power1 => "POWER_1_SW",
            Switch::Power2 => "POWER_2_SW",
            Switch::Ftm => "FTM_SW",
            Switch::Door => "DOOR_SW",
            Switch::Air => "AIR_SW",
            Switch::Water => "WATER_SW",
            Switch::Gas1 => "GAS_1_SW",
            Switch::Gas2 => "GAS_2_SW",
        }
    }
}

/// Forces a raw code into `[offset, offset + full_scale]`.
pub fn clamp_code(dac: &DacSettings, code: i64) -> Result<u16> {
    if dac.full_scale_code <= 0 {
        return Err(PlcError::InvalidConfig(format!(
            "dac full_scale_code must be > 0 (now={})",
            dac.full_scale_code
        )));
    }
    let lo = i64::from(dac.offset_code).max(0);
    let hi = (i64::from(dac.offset_code) + i64::from(dac.full_scale_code)).min(i64::from(u16::MAX));
    if lo > hi {
        return Err(PlcError::InvalidConfig(format!(
            "dac range {}..{} does not fit a register",
            dac.offset_code,
            i64::from(dac.offset_code) + i64::from(dac.full_scale_code)
        )));
    }
    Ok(code.clamp(lo, hi) as u16)
}

/// Maps an engineering value linearly onto the DAC code range.
/// Values outside `[min, max]` are clamped first.
pub fn scale_to_code(dac: &DacSettings, value: f64, min: f64, max: f64) -> Result<u16> {
    if !(max > min) {
        return Err(PlcError::InvalidConfig(format!("invalid range {}..{}", min, max)));
    }
    if value.is_nan() {
        return Err(PlcError::InvalidConfig("DAC setpoint is NaN".into()));
    }
    let x = (value.clamp(min, max) - min) / (max - min);
    let code = (x * f64::from(dac.full_scale_code)).round() as i64 + i64::from(dac.offset_code);
    clamp_code(dac, code)
}

fn dac_register(channel: u8) -> Result<&'static str> {
    match channel {
        1 => Ok("DAC_POWER_1"),
        2 => Ok("DAC_POWER_2"),
        other => Err(PlcError::InvalidChannel(other)),
    }
}

/// High level PLC access. All I/O goes through one [`IoScheduler`].
pub struct Plc {
    settings: PlcSettings,
    scheduler: Arc<IoScheduler>,
    heartbeat: Mutex<Option<HeartbeatTask>>,
    resolver: &'static AddressResolver,
}

impl Plc {
    pub fn new(settings: PlcSettings) -> Self {
        let transport = ModbusTransport::new(&settings);
        Self::with_transport(settings, Box::new(transport))
    }

    pub fn with_transport(settings: PlcSettings, transport: Box<dyn PlcTransport>) -> Self {
        let scheduler = Arc::new(IoScheduler::new(&settings, transport));
        Self {
            settings,
            scheduler,
            heartbeat: Mutex::new(None),
            resolver: AddressResolver::global(),
        }
    }

    pub fn settings(&self) -> &PlcSettings {
        &self.settings
    }

    pub fn endpoint(&self) -> &str {
        self.scheduler.endpoint()
    }

    // lifecycle

    pub async fn connect(&self) -> Result<()> {
        self.scheduler.open().await?;
        log::info!("PLC connected: {}", self.endpoint());

        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.is_none() {
            *heartbeat = Some(HeartbeatTask::spawn(self.scheduler.clone()));
        }
        Ok(())
    }

    /// Stops the heartbeat, then closes the link. Safe to call repeatedly.
    pub async fn close(&self) {
        let task = self.heartbeat.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
        }
        let was_active = self.scheduler.is_active();
        self.scheduler.shutdown().await;
        if was_active {
            log::info!("PLC disconnected: {}", self.endpoint());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.scheduler.is_connected()
    }

    /// Suspends heartbeat reads until the returned guard is dropped.
    pub fn pause_heartbeat(&self) -> HeartbeatPause {
        self.scheduler.pause()
    }

    // primitives

    pub async fn read_coil(&self, addr: u16) -> Result<bool> {
        let bits = self
            .scheduler
            .run("read_coil", IoMeta::addr(addr), move |t| t.read_coils(addr, 1))
            .await?;
        bits.first()
            .copied()
            .ok_or_else(|| PlcError::Protocol(format!("empty coil response for {}", addr)))
    }

    /// Reads `count` contiguous coils in one request; short replies are padded with `false`.
    pub async fn read_coils_block(&self, start: u16, count: u16) -> Result<Vec<bool>> {
        let count = count.max(1);
        let mut bits = self
            .scheduler
            .run("read_coils_block", IoMeta::block(start, count), move |t| {
                t.read_coils(start, count)
            })
            .await?;
        bits.resize(usize::from(count), false);
        Ok(bits)
    }

    pub async fn write_coil(&self, addr: u16, value: bool) -> Result<()> {
        self.scheduler
            .run("write_coil", IoMeta::addr(addr), move |t| t.write_single_coil(addr, value))
            .await
    }

    pub async fn read_register(&self, addr: u16) -> Result<u16> {
        let words = self
            .scheduler
            .run("read_register", IoMeta::addr(addr), move |t| {
                t.read_holding_registers(addr, 1)
            })
            .await?;
        words
            .first()
            .copied()
            .ok_or_else(|| PlcError::Protocol(format!("empty register response for {}", addr)))
    }

    pub async fn write_register(&self, addr: u16, value: u16) -> Result<()> {
        self.scheduler
            .run("write_register", IoMeta::addr(addr), move |t| {
                t.write_single_register(addr, value)
            })
            .await
    }

    // named access

    pub fn resolve<'a>(&self, target: impl Into<PlcAddress<'a>>) -> Result<u16> {
        self.resolver.resolve(target)
    }

    fn resolve_coil<'a>(&self, target: PlcAddress<'a>) -> Result<u16> {
        let addr = self.resolver.resolve(target)?;
        if self.resolver.is_register(target) {
            return Err(PlcError::TypeMismatch {
                name: target.to_string(),
                expected: "coil",
            });
        }
        Ok(addr)
    }

    /// Writes true, waits `max(10 ms, width)`, writes false.
    pub async fn pulse(&self, addr: u16, width_ms: Option<u64>) -> Result<()> {
        let width = width_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.settings.pulse_width())
            .max(MIN_PULSE);
        self.write_coil(addr, true).await?;
        tokio::time::sleep(width).await;
        self.write_coil(addr, false).await
    }

    /// Latches `on`, or pulses the coil when `momentary` is set.
    pub async fn write_switch<'a>(
        &self,
        target: impl Into<PlcAddress<'a>>,
        on: bool,
        momentary: bool,
        pulse_ms: Option<u64>,
    ) -> Result<()> {
        let addr = self.resolve_coil(target.into())?;
        if momentary {
            self.pulse(addr, pulse_ms).await
        } else {
            self.write_coil(addr, on).await
        }
    }

    pub async fn read_bit<'a>(&self, target: impl Into<PlcAddress<'a>>) -> Result<bool> {
        let addr = self.resolve_coil(target.into())?;
        self.read_coil(addr).await
    }

    pub async fn read_register_named<'a>(&self, target: impl Into<PlcAddress<'a>>) -> Result<u16> {
        let addr = self.resolver.resolve(target)?;
        self.read_register(addr).await
    }

    pub async fn write_register_named<'a>(
        &self,
        target: impl Into<PlcAddress<'a>>,
        value: u16,
    ) -> Result<()> {
        let addr = self.resolver.resolve(target)?;
        self.write_register(addr, value).await
    }

    pub async fn switch(&self, switch: Switch, on: bool) -> Result<()> {
        self.write_switch(switch.name(), on, false, None).await
    }

    /// Door output, latched or pulsed per `door_mode`.
    pub async fn door(&self, on: bool) -> Result<()> {
        let momentary = self.settings.door_mode == SwitchMode::Momentary;
        self.write_switch(Switch::Door.name(), on, momentary, None).await
    }

    /// Reads every mapped coil in two block requests, keyed by canonical name.
    pub async fn read_status(&self) -> Result<HashMap<&'static str, bool>> {
        let mut status = HashMap::with_capacity(COIL_MAP.len());
        for (start, count) in STATUS_BLOCKS {
            let bits = self.read_coils_block(start, count).await?;
            for (name, addr) in COIL_MAP {
                if (start..start + count).contains(addr) {
                    status.insert(*name, bits[usize::from(*addr - start)]);
                }
            }
        }
        Ok(status)
    }

    // DAC

    pub fn clamp_code(&self, code: i64) -> Result<u16> {
        clamp_code(&self.settings.dac, code)
    }

    /// Writes a clamped raw code to the channel's register and returns it.
    pub async fn set_dac_code(&self, channel: u8, code: i64) -> Result<u16> {
        let register = dac_register(channel)?;
        let code = self.clamp_code(code)?;
        self.write_register_named(register, code).await?;
        Ok(code)
    }

    pub async fn set_dac_current(&self, channel: u8, milliamps: f64) -> Result<u16> {
        let dac = &self.settings.dac;
        dac_register(channel)?;
        let code = scale_to_code(dac, milliamps, dac.current_min_ma, dac.current_max_ma)?;
        self.set_dac_code(channel, i64::from(code)).await
    }

    pub async fn set_dac_voltage(&self, channel: u8, volts: f64) -> Result<u16> {
        let dac = &self.settings.dac;
        dac_register(channel)?;
        let code = scale_to_code(dac, volts, dac.voltage_min_v, dac.voltage_max_v)?;
        self.set_dac_code(channel, i64::from(code)).await
    }
}
