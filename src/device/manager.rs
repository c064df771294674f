use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use super::{ConnectionState, DeviceError, DeviceKind, DeviceStatus, Result};
use crate::config::{SerialSettings, StationConfig};
use crate::serial::{self, Acs2000, PortOpener, SerialError, Stm100};

/// Owns the STM-100 and ACS2000 drivers and rebuilds them when settings change.
///
/// Driver calls block on the serial port, so they run on tokio's blocking pool.
pub struct DeviceManager {
    opener: Option<PortOpener>,
    stm: RwLock<Arc<Stm100>>,
    acs: RwLock<Arc<Acs2000>>,
    statuses: RwLock<HashMap<DeviceKind, DeviceStatus>>,
}

impl DeviceManager {
    pub fn new(stm: SerialSettings, acs: SerialSettings) -> Self {
        Self::build(stm, acs, None)
    }

    /// Same as [`new`](Self::new) but opens ports through `opener`.
    pub fn with_opener(stm: SerialSettings, acs: SerialSettings, opener: PortOpener) -> Self {
        Self::build(stm, acs, Some(opener))
    }

    pub fn from_config(config: &StationConfig) -> Result<Self> {
        config
            .stm100
            .validate("stm100")
            .and_then(|_| config.acs2000.validate("acs2000"))
            .map_err(|e| DeviceError::InvalidConfiguration(e.to_string()))?;
        Ok(Self::new(config.stm100.clone(), config.acs2000.clone()))
    }

    fn build(stm: SerialSettings, acs: SerialSettings, opener: Option<PortOpener>) -> Self {
        let statuses = Self::fresh_statuses(&stm, &acs);
        let (stm, acs) = Self::make_drivers(stm, acs, opener.as_ref());
        Self {
            opener,
            stm: RwLock::new(stm),
            acs: RwLock::new(acs),
            statuses: RwLock::new(statuses),
        }
    }

    fn make_drivers(
        stm: SerialSettings,
        acs: SerialSettings,
        opener: Option<&PortOpener>,
    ) -> (Arc<Stm100>, Arc<Acs2000>) {
        match opener {
            Some(opener) => (
                Arc::new(Stm100::with_opener(stm, opener.clone())),
                Arc::new(Acs2000::with_opener(acs, opener.clone())),
            ),
            None => (Arc::new(Stm100::new(stm)), Arc::new(Acs2000::new(acs))),
        }
    }

    fn fresh_statuses(stm: &SerialSettings, acs: &SerialSettings) -> HashMap<DeviceKind, DeviceStatus> {
        let mut statuses = HashMap::new();
        statuses.insert(DeviceKind::Stm100, DeviceStatus::new(DeviceKind::Stm100, stm.port.clone()));
        statuses.insert(DeviceKind::Acs2000, DeviceStatus::new(DeviceKind::Acs2000, acs.port.clone()));
        statuses
    }

    pub async fn stm100(&self) -> Arc<Stm100> {
        self.stm.read().await.clone()
    }

    pub async fn acs2000(&self) -> Arc<Acs2000> {
        self.acs.read().await.clone()
    }

    /// Per-device status snapshots, STM-100 first.
    pub async fn status(&self) -> Vec<DeviceStatus> {
        let statuses = self.statuses.read().await;
        DeviceKind::ALL
            .iter()
            .filter_map(|kind| statuses.get(kind).cloned())
            .collect()
    }

    async fn update_status<F>(&self, kind: DeviceKind, f: F)
    where
        F: FnOnce(&mut DeviceStatus),
    {
        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(&kind) {
            f(status);
        }
    }

    async fn connect_one(&self, kind: DeviceKind) -> std::result::Result<(), String> {
        self.update_status(kind, |s| s.update_connection_state(ConnectionState::Connecting))
            .await;

        let result = match kind {
            DeviceKind::Stm100 => {
                let stm = self.stm100().await;
                blocking(move || stm.connect()).await
            }
            DeviceKind::Acs2000 => {
                let acs = self.acs2000().await;
                blocking(move || acs.connect()).await
            }
        };

        match result {
            Ok(()) => {
                log::info!("{} connected", kind);
                self.update_status(kind, |s| s.mark_ok()).await;
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                log::error!("Failed to connect {}: {}", kind, msg);
                let state_msg = msg.clone();
                self.update_status(kind, move |s| {
                    s.update_connection_state(ConnectionState::Error(state_msg))
                })
                .await;
                Err(msg)
            }
        }
    }

    /// Connects every instrument independently. Returns only the failures.
    pub async fn connect_all(&self) -> HashMap<DeviceKind, String> {
        let mut errors = HashMap::new();
        for kind in DeviceKind::ALL {
            if let Err(e) = self.connect_one(kind).await {
                errors.insert(kind, e);
            }
        }
        errors
    }

    /// Closes every instrument. Never fails.
    pub async fn close_all(&self) {
        let stm = self.stm100().await;
        let acs = self.acs2000().await;
        let closed = tokio::task::spawn_blocking(move || {
            stm.close();
            acs.close();
        })
        .await;
        if let Err(e) = closed {
            log::warn!("Closing instruments did not finish cleanly: {}", e);
        }

        let mut statuses = self.statuses.write().await;
        for status in statuses.values_mut() {
            status.update_connection_state(ConnectionState::Disconnected);
        }
    }

    pub async fn reconnect_all(&self) -> HashMap<DeviceKind, String> {
        self.close_all().await;
        self.connect_all().await
    }

    /// Closes the current drivers, rebuilds them from new settings and
    /// optionally connects them.
    pub async fn reload_from_config(
        &self,
        stm: SerialSettings,
        acs: SerialSettings,
        connect: bool,
    ) -> HashMap<DeviceKind, String> {
        self.close_all().await;

        let statuses = Self::fresh_statuses(&stm, &acs);
        let (new_stm, new_acs) = Self::make_drivers(stm, acs, self.opener.as_ref());
        *self.stm.write().await = new_stm;
        *self.acs.write().await = new_acs;
        *self.statuses.write().await = statuses;
        log::info!("Instrument drivers rebuilt from new settings");

        if connect {
            self.connect_all().await
        } else {
            HashMap::new()
        }
    }

    /// Runs a blocking STM-100 call and records the outcome.
    pub async fn execute_stm<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Stm100) -> serial::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let stm = self.stm100().await;
        let (result, connected) = blocking_with_state(move || {
            let result = f(&stm);
            (result, stm.is_connected())
        })
        .await;
        self.record(DeviceKind::Stm100, failure_of(&result), connected)
            .await;
        result.map_err(DeviceError::from)
    }

    /// Runs a blocking ACS2000 call and records the outcome.
    pub async fn execute_acs<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Acs2000) -> serial::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let acs = self.acs2000().await;
        let (result, connected) = blocking_with_state(move || {
            let result = f(&acs);
            (result, acs.is_connected())
        })
        .await;
        self.record(DeviceKind::Acs2000, failure_of(&result), connected)
            .await;
        result.map_err(DeviceError::from)
    }

    async fn record(&self, kind: DeviceKind, failure: Option<String>, connected: bool) {
        match failure {
            None => self.update_status(kind, |s| s.mark_ok()).await,
            Some(msg) => {
                self.update_status(kind, move |s| s.mark_failed(msg, connected))
                    .await
            }
        }
    }

    // STM-100

    pub async fn stm_version(&self) -> Result<String> {
        self.execute_stm(|stm| stm.get_version()).await
    }

    pub async fn thickness(&self) -> Result<f64> {
        self.execute_stm(|stm| stm.get_thickness()).await
    }

    pub async fn rate(&self) -> Result<f64> {
        self.execute_stm(|stm| stm.get_rate()).await
    }

    pub async fn stm_shutter(&self, on: bool) -> Result<()> {
        self.execute_stm(move |stm| stm.shutter(on)).await
    }

    // ACS2000

    pub async fn acs_version(&self) -> Result<String> {
        self.execute_acs(|acs| acs.query_version()).await
    }

    pub async fn pressure(&self, channel: u8) -> Result<f64> {
        self.execute_acs(move |acs| acs.query_pressure(channel)).await
    }

    pub async fn start_pressure_stream(&self, interval: u32) -> Result<String> {
        self.execute_acs(move |acs| acs.start_pressure_stream(interval))
            .await
    }

    pub async fn read_stream_line(&self, timeout: Duration) -> Result<String> {
        self.execute_acs(move |acs| acs.read_stream_line(timeout)).await
    }

    pub async fn stop_stream(&self) -> Result<()> {
        self.execute_acs(|acs| {
            acs.stop_stream();
            Ok(())
        })
        .await?;
        self.update_status(DeviceKind::Acs2000, |s| {
            s.update_connection_state(ConnectionState::Disconnected)
        })
        .await;
        Ok(())
    }
}

fn task_failed(e: tokio::task::JoinError) -> SerialError {
    SerialError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("instrument task failed: {}", e),
    ))
}

fn failure_of<R>(result: &serial::Result<R>) -> Option<String> {
    result.as_ref().err().map(|e| e.to_string())
}

async fn blocking<F, R>(f: F) -> serial::Result<R>
where
    F: FnOnce() -> serial::Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(task_failed(e)))
}

/// Like [`blocking`] but also hands back whether the port is still open.
async fn blocking_with_state<F, R>(f: F) -> (serial::Result<R>, bool)
where
    F: FnOnce() -> (serial::Result<R>, bool) + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| (Err(task_failed(e)), false))
}
