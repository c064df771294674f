//! Operations exposed to the HMI layer.
//!
//! Every operation returns `Result<T, String>` with a readable message and
//! records it as the station's last error, so the caller can show connection
//! state and the most recent failure after each call.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::StationConfig;
use crate::device::{DeviceManager, DeviceStatus};
use crate::plc::{Plc, Switch};

/// Everything the HMI needs to refresh its indicators.
#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    pub plc_connected: bool,
    pub plc_endpoint: String,
    pub devices: Vec<DeviceStatus>,
    pub last_error: Option<String>,
}

pub struct Station {
    plc: RwLock<Arc<Plc>>,
    devices: Arc<DeviceManager>,
    last_error: Mutex<Option<String>>,
}

impl Station {
    pub fn new(config: &StationConfig) -> Result<Self, String> {
        config
            .validate()
            .map_err(|e| format!("Invalid configuration: {}", e))?;
        let devices = DeviceManager::from_config(config)
            .map_err(|e| format!("Invalid configuration: {}", e))?;
        Ok(Self::from_parts(Plc::new(config.plc.clone()), devices))
    }

    pub fn from_parts(plc: Plc, devices: DeviceManager) -> Self {
        Self {
            plc: RwLock::new(Arc::new(plc)),
            devices: Arc::new(devices),
            last_error: Mutex::new(None),
        }
    }

    pub async fn plc(&self) -> Arc<Plc> {
        self.plc.read().await.clone()
    }

    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Clears the last error on success, records it on failure.
    fn track<T, E: Display>(&self, action: &str, result: Result<T, E>) -> Result<T, String> {
        match result {
            Ok(value) => {
                self.set_last_error(None);
                Ok(value)
            }
            Err(e) => {
                let msg = format!("Failed to {}: {}", action, e);
                log::error!("{}", msg);
                self.set_last_error(Some(msg.clone()));
                Err(msg)
            }
        }
    }

    fn track_failures(&self, failures: HashMap<String, String>) -> HashMap<String, String> {
        if failures.is_empty() {
            self.set_last_error(None);
        } else {
            let mut parts: Vec<String> = failures
                .iter()
                .map(|(device, err)| format!("{}: {}", device, err))
                .collect();
            parts.sort();
            let msg = format!("Failed to connect {}", parts.join("; "));
            log::warn!("{}", msg);
            self.set_last_error(Some(msg));
        }
        failures
    }

    pub async fn status(&self) -> StationStatus {
        let plc = self.plc().await;
        StationStatus {
            plc_connected: plc.is_connected(),
            plc_endpoint: plc.endpoint().to_string(),
            devices: self.devices.status().await,
            last_error: self.last_error(),
        }
    }

    // connection lifecycle

    pub async fn connect_plc(&self) -> Result<(), String> {
        let result = self.plc().await.connect().await;
        self.track("connect PLC", result)
    }

    pub async fn close_plc(&self) {
        self.plc().await.close().await;
    }

    /// Connects the PLC and both instruments; returns only the failures,
    /// keyed `plc`, `stm100`, `acs2000`.
    pub async fn connect_all(&self) -> HashMap<String, String> {
        let mut failures: HashMap<String, String> = self
            .devices
            .connect_all()
            .await
            .into_iter()
            .map(|(kind, err)| (kind.to_string(), err))
            .collect();
        if let Err(e) = self.plc().await.connect().await {
            failures.insert("plc".to_string(), e.to_string());
        }
        self.track_failures(failures)
    }

    pub async fn close_all(&self) {
        self.close_plc().await;
        self.devices.close_all().await;
    }

    pub async fn reconnect_instruments(&self) -> HashMap<String, String> {
        let failures = self
            .devices
            .reconnect_all()
            .await
            .into_iter()
            .map(|(kind, err)| (kind.to_string(), err))
            .collect();
        self.track_failures(failures)
    }

    /// Validates `config`, rebuilds the PLC link and reloads the instruments.
    /// Connection failures are reported per device; only an invalid
    /// configuration is an error.
    pub async fn apply_config(&self, config: StationConfig) -> Result<HashMap<String, String>, String> {
        let validated = config.validate();
        self.track("apply configuration", validated)?;

        let old = {
            let mut plc = self.plc.write().await;
            std::mem::replace(&mut *plc, Arc::new(Plc::new(config.plc.clone())))
        };
        old.close().await;
        log::info!("PLC rebuilt for {}", config.plc.endpoint.describe());

        let mut failures: HashMap<String, String> = self
            .devices
            .reload_from_config(config.stm100, config.acs2000, true)
            .await
            .into_iter()
            .map(|(kind, err)| (kind.to_string(), err))
            .collect();
        if let Err(e) = self.plc().await.connect().await {
            failures.insert("plc".to_string(), e.to_string());
        }
        Ok(self.track_failures(failures))
    }

    // PLC

    pub async fn write_switch(
        &self,
        name: &str,
        on: bool,
        momentary: bool,
        pulse_ms: Option<u64>,
    ) -> Result<(), String> {
        let result = self
            .plc()
            .await
            .write_switch(name, on, momentary, pulse_ms)
            .await;
        self.track(&format!("write {}", name), result)
    }

    pub async fn switch(&self, switch: Switch, on: bool) -> Result<(), String> {
        let result = self.plc().await.switch(switch, on).await;
        self.track(&format!("switch {}", switch.name()), result)
    }

    pub async fn door(&self, on: bool) -> Result<(), String> {
        let result = self.plc().await.door(on).await;
        self.track("operate door", result)
    }

    pub async fn read_bit(&self, name: &str) -> Result<bool, String> {
        let result = self.plc().await.read_bit(name).await;
        self.track(&format!("read {}", name), result)
    }

    pub async fn read_coils_block(&self, start: u16, count: u16) -> Result<Vec<bool>, String> {
        let result = self.plc().await.read_coils_block(start, count).await;
        self.track("read coil block", result)
    }

    pub async fn read_status(&self) -> Result<HashMap<String, bool>, String> {
        let result = self.plc().await.read_status().await.map(|status| {
            status
                .into_iter()
                .map(|(name, on)| (name.to_string(), on))
                .collect()
        });
        self.track("read PLC status", result)
    }

    pub async fn read_register(&self, name: &str) -> Result<u16, String> {
        let result = self.plc().await.read_register_named(name).await;
        self.track(&format!("read {}", name), result)
    }

    pub async fn write_register(&self, name: &str, value: u16) -> Result<(), String> {
        let result = self.plc().await.write_register_named(name, value).await;
        self.track(&format!("write {}", name), result)
    }

    pub async fn set_dac_code(&self, channel: u8, code: i64) -> Result<u16, String> {
        let result = self.plc().await.set_dac_code(channel, code).await;
        self.track("set DAC code", result)
    }

    pub async fn set_dac_current(&self, channel: u8, milliamps: f64) -> Result<u16, String> {
        let result = self.plc().await.set_dac_current(channel, milliamps).await;
        self.track("set DAC current", result)
    }

    pub async fn set_dac_voltage(&self, channel: u8, volts: f64) -> Result<u16, String> {
        let result = self.plc().await.set_dac_voltage(channel, volts).await;
        self.track("set DAC voltage", result)
    }

    // STM-100

    pub async fn stm_version(&self) -> Result<String, String> {
        let result = self.devices.stm_version().await;
        self.track("read STM-100 version", result)
    }

    pub async fn thickness(&self) -> Result<f64, String> {
        let result = self.devices.thickness().await;
        self.track("read thickness", result)
    }

    pub async fn rate(&self) -> Result<f64, String> {
        let result = self.devices.rate().await;
        self.track("read rate", result)
    }

    pub async fn stm_shutter(&self, on: bool) -> Result<(), String> {
        let result = self.devices.stm_shutter(on).await;
        self.track("operate STM-100 shutter", result)
    }

    // ACS2000

    pub async fn acs_version(&self) -> Result<String, String> {
        let result = self.devices.acs_version().await;
        self.track("read ACS2000 version", result)
    }

    pub async fn pressure(&self, channel: u8) -> Result<f64, String> {
        let result = self.devices.pressure(channel).await;
        self.track(&format!("read pressure on channel {}", channel), result)
    }

    pub async fn start_pressure_stream(&self, interval: u32) -> Result<String, String> {
        let result = self.devices.start_pressure_stream(interval).await;
        self.track("start pressure stream", result)
    }

    pub async fn read_stream_line(&self, timeout_ms: u64) -> Result<String, String> {
        let result = self
            .devices
            .read_stream_line(Duration::from_millis(timeout_ms))
            .await;
        self.track("read pressure stream", result)
    }

    pub async fn stop_stream(&self) -> Result<(), String> {
        let result = self.devices.stop_stream().await;
        self.track("stop pressure stream", result)
    }
}
