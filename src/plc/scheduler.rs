//! Serialized access to the PLC link.
//!
//! Every transport call runs inside one exclusive section. Before a request is
//! dispatched the scheduler re-opens a dropped link, waits out the minimum gap
//! since the previous request and, after a long idle period, reads coil 0
//! first. A reset link is re-opened and the request retried exactly once.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{PlcError, PlcTransport, Result};
use crate::config::PlcSettings;

/// Address and count attached to slow-section warnings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoMeta {
    pub addr: Option<u16>,
    pub count: Option<u16>,
}

impl IoMeta {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn addr(addr: u16) -> Self {
        Self {
            addr: Some(addr),
            count: None,
        }
    }

    pub fn block(addr: u16, count: u16) -> Self {
        Self {
            addr: Some(addr),
            count: Some(count),
        }
    }
}

impl fmt::Display for IoMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.addr, self.count) {
            (Some(a), Some(c)) => write!(f, " [addr={}, count={}]", a, c),
            (Some(a), None) => write!(f, " [addr={}]", a),
            (None, Some(c)) => write!(f, " [count={}]", c),
            (None, None) => Ok(()),
        }
    }
}

/// Result of one heartbeat wake-up. Never surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Alive,
    Skipped,
    Failed(String),
}

struct IoState {
    transport: Box<dyn PlcTransport>,
    last_io: Option<Instant>,
}

/// Holds the I/O lock for one operation and reports slow sections on drop.
struct Section<'a> {
    state: MutexGuard<'a, IoState>,
    op: &'static str,
    meta: IoMeta,
    entered: Instant,
    io_warn: Duration,
}

impl Deref for Section<'_> {
    type Target = IoState;

    fn deref(&self) -> &IoState {
        &self.state
    }
}

impl DerefMut for Section<'_> {
    fn deref_mut(&mut self) -> &mut IoState {
        &mut self.state
    }
}

impl Drop for Section<'_> {
    fn drop(&mut self) {
        let held = self.entered.elapsed();
        if held >= self.io_warn {
            log::warn!(
                "PLC in-lock I/O took {} ms (op={}){}",
                held.as_millis(),
                self.op,
                self.meta
            );
        }
    }
}

/// Restores the previous heartbeat pause state when dropped.
#[must_use = "the heartbeat resumes as soon as the guard is dropped"]
pub struct HeartbeatPause {
    flag: Arc<AtomicBool>,
    previous: bool,
}

impl Drop for HeartbeatPause {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::SeqCst);
    }
}

pub struct IoScheduler {
    io: Mutex<IoState>,
    /// Set by a successful open, cleared by shutdown.
    active: AtomicBool,
    link_up: AtomicBool,
    paused: Arc<AtomicBool>,
    gap: Duration,
    heartbeat: Duration,
    lock_warn: Duration,
    io_warn: Duration,
    endpoint: String,
}

impl IoScheduler {
    pub fn new(settings: &PlcSettings, transport: Box<dyn PlcTransport>) -> Self {
        let endpoint = transport.describe();
        Self {
            io: Mutex::new(IoState {
                transport,
                last_io: None,
            }),
            active: AtomicBool::new(false),
            link_up: AtomicBool::new(false),
            paused: Arc::new(AtomicBool::new(false)),
            gap: settings.inter_cmd_gap(),
            heartbeat: settings.heartbeat_interval(),
            lock_warn: settings.lock_warn(),
            io_warn: settings.io_warn(),
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Live link state as of the last transport call.
    pub fn is_connected(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
    }

    pub fn is_heartbeat_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) -> HeartbeatPause {
        let previous = self.paused.swap(true, Ordering::SeqCst);
        HeartbeatPause {
            flag: self.paused.clone(),
            previous,
        }
    }

    async fn enter(&self, op: &'static str, meta: IoMeta) -> Section<'_> {
        let started = Instant::now();
        let state = self.io.lock().await;
        let waited = started.elapsed();
        if waited >= self.lock_warn {
            log::warn!(
                "Waited {} ms for the PLC I/O lock (op={}){}",
                waited.as_millis(),
                op,
                meta
            );
        }
        Section {
            state,
            op,
            meta,
            entered: Instant::now(),
            io_warn: self.io_warn,
        }
    }

    /// Opens the link and marks the scheduler active.
    pub async fn open(&self) -> Result<()> {
        let mut section = self.enter("connect", IoMeta::none()).await;
        match section.transport.connect().await {
            Ok(()) => {
                section.last_io = Some(Instant::now());
                self.link_up.store(true, Ordering::SeqCst);
                self.active.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.link_up.store(section.transport.is_connected(), Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Marks the scheduler inactive and closes the link. Safe to repeat.
    pub async fn shutdown(&self) {
        self.active.store(false, Ordering::SeqCst);
        let mut section = self.enter("close", IoMeta::none()).await;
        section.transport.disconnect().await;
        self.link_up.store(false, Ordering::SeqCst);
    }

    async fn ensure_open(&self, state: &mut IoState) -> Result<()> {
        if !self.is_active() {
            return Err(PlcError::NotConnected);
        }
        if state.transport.is_connected() {
            return Ok(());
        }
        log::info!("Re-opening PLC link {}", self.endpoint);
        let result = state.transport.connect().await;
        self.link_up.store(state.transport.is_connected(), Ordering::SeqCst);
        result?;
        state.last_io = Some(Instant::now());
        Ok(())
    }

    /// Waits out the inter-command gap and reads coil 0 on a link that sat idle too long.
    async fn throttle(&self, state: &mut IoState) {
        if let Some(last) = state.last_io {
            let idle = last.elapsed();
            if idle < self.gap {
                tokio::time::sleep(self.gap - idle).await;
            }

            if idle > self.heartbeat
                && !self.is_heartbeat_paused()
                && state.transport.is_connected()
            {
                if let Err(e) = state.transport.read_coils(0, 1).await {
                    log::debug!("Idle read on {} failed: {}", self.endpoint, e);
                }
                tokio::time::sleep(self.gap).await;
            }
        }
        state.last_io = Some(Instant::now());
    }

    /// Runs `body` against the transport inside the exclusive section.
    ///
    /// `body` may be invoked a second time after a connection reset.
    pub async fn run<R, F>(&self, op: &'static str, meta: IoMeta, mut body: F) -> Result<R>
    where
        F: for<'a> FnMut(&'a mut dyn PlcTransport) -> BoxFuture<'a, Result<R>> + Send,
        R: Send,
    {
        let mut section = self.enter(op, meta).await;
        let state: &mut IoState = &mut section;

        self.ensure_open(state).await?;
        self.throttle(state).await;

        let first = body(state.transport.as_mut()).await;
        self.link_up.store(state.transport.is_connected(), Ordering::SeqCst);

        let err = match first {
            Err(e) if e.is_connection_reset() => e,
            other => return other,
        };

        log::warn!(
            "PLC link reset during {}{}: {}; reconnecting once",
            op,
            meta,
            err
        );
        state.transport.disconnect().await;
        self.link_up.store(false, Ordering::SeqCst);

        state.transport.connect().await?;
        self.link_up.store(true, Ordering::SeqCst);
        log::info!("Reconnected PLC link {}", self.endpoint);

        self.throttle(state).await;
        let retry = body(state.transport.as_mut()).await;
        self.link_up.store(state.transport.is_connected(), Ordering::SeqCst);
        retry
    }

    /// One heartbeat wake-up: read coil 0 if the link has been idle for a
    /// full heartbeat interval.
    pub async fn heartbeat_tick(&self) -> HeartbeatOutcome {
        if !self.is_active() || self.is_heartbeat_paused() {
            return HeartbeatOutcome::Skipped;
        }

        let mut section = self.enter("heartbeat", IoMeta::addr(0)).await;
        if !section.transport.is_connected() {
            return HeartbeatOutcome::Skipped;
        }
        if let Some(last) = section.last_io {
            if last.elapsed() < self.heartbeat {
                return HeartbeatOutcome::Skipped;
            }
        }

        let outcome = match section.transport.read_coils(0, 1).await {
            Ok(_) => HeartbeatOutcome::Alive,
            Err(e) => HeartbeatOutcome::Failed(e.to_string()),
        };
        section.last_io = Some(Instant::now());
        self.link_up.store(section.transport.is_connected(), Ordering::SeqCst);
        outcome
    }
}

/// Background task that calls [`IoScheduler::heartbeat_tick`] every third
/// of the heartbeat interval (at least once per second) until stopped.
pub(crate) struct HeartbeatTask {
    handle: JoinHandle<()>,
    stop_tx: mpsc::Sender<()>,
}

impl HeartbeatTask {
    pub(crate) fn spawn(scheduler: Arc<IoScheduler>) -> Self {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let period = (scheduler.heartbeat_interval() / 3).max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            log::debug!("PLC heartbeat started ({:?} period)", period);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(period) => {
                        match scheduler.heartbeat_tick().await {
                            HeartbeatOutcome::Alive => log::debug!("PLC heartbeat ok"),
                            HeartbeatOutcome::Skipped => {}
                            HeartbeatOutcome::Failed(e) => log::debug!("PLC heartbeat failed: {}", e),
                        }
                    }
                }
            }
            log::debug!("PLC heartbeat stopped");
        });

        Self { handle, stop_tx }
    }

    /// Signals the loop and waits for it to finish.
    pub(crate) async fn stop(mut self) {
        let _ = self.stop_tx.send(()).await;
        if let Err(e) = (&mut self.handle).await {
            log::warn!("PLC heartbeat task ended abnormally: {}", e);
        }
    }
}

impl Drop for HeartbeatTask {
    // Covers a facade dropped without close().
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_meta_display() {
        assert_eq!(IoMeta::none().to_string(), "");
        assert_eq!(IoMeta::addr(12).to_string(), " [addr=12]");
        assert_eq!(IoMeta::block(0, 13).to_string(), " [addr=0, count=13]");
    }
}
