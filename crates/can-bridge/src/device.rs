//! Device session: owns the lifecycle of one CAN adapter.
//!
//! All access to the adapter handle goes through one mutex. Reads poll the adapter in short
//! slices and hand the lock over between slices, so a concurrent send never waits for a
//! whole read timeout.

use crate::error::DeviceError;
use crate::state::ConnectionState;
use can_transport::{BusInfo, CanBus, CanDriver, CanFrame, TransportError};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest time a read holds the adapter lock.
pub const READ_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Scanning,
    Configuring,
    Running,
    Stopped,
}

struct DeviceInner {
    state: DeviceState,
    bus: Option<Box<dyn CanBus>>,
    adapter: Option<BusInfo>,
    failed: bool,
}

pub struct DeviceSession {
    driver: Arc<dyn CanDriver>,
    bitrate: u32,
    inner: Mutex<DeviceInner>,
}

impl DeviceSession {
    pub fn new(driver: Arc<dyn CanDriver>, bitrate: u32) -> Self {
        Self {
            driver,
            bitrate,
            inner: Mutex::new(DeviceInner {
                state: DeviceState::Idle,
                bus: None,
                adapter: None,
                failed: false,
            }),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    pub fn connection_state(&self) -> ConnectionState {
        let inner = self.inner.lock();
        match inner.state {
            DeviceState::Running => ConnectionState::Connected,
            DeviceState::Scanning | DeviceState::Configuring => ConnectionState::Connecting,
            DeviceState::Idle | DeviceState::Stopped if inner.failed => ConnectionState::Failed,
            DeviceState::Idle | DeviceState::Stopped => ConnectionState::Disconnected,
        }
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Enumerate adapters and pick the first one discovered.
    pub fn discover(&self) -> Result<BusInfo, DeviceError> {
        let mut inner = self.inner.lock();
        release(&mut inner);
        inner.state = DeviceState::Scanning;
        let found = self
            .driver
            .scan()
            .map_err(DeviceError::Scan)
            .and_then(|adapters| adapters.into_iter().next().ok_or(DeviceError::NotFound));
        match found {
            Ok(adapter) => {
                debug!(adapter = %adapter.name, driver = %adapter.driver, "adapter discovered");
                inner.adapter = Some(adapter.clone());
                Ok(adapter)
            }
            Err(e) => Err(fail(&mut inner, e)),
        }
    }

    /// Open the adapter and set the bus bitrate. A rejected bitrate is fatal.
    pub fn configure(&self, adapter: &BusInfo) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        release(&mut inner);
        inner.state = DeviceState::Configuring;
        inner.adapter = Some(adapter.clone());
        let mut bus = match self.driver.open(adapter) {
            Ok(bus) => bus,
            Err(source) => {
                let e = DeviceError::Open {
                    name: adapter.name.clone(),
                    source,
                };
                return Err(fail(&mut inner, e));
            }
        };
        if let Err(source) = bus.set_bitrate(self.bitrate) {
            let _ = bus.stop();
            // Only an explicit rejection is fatal; I/O trouble is retried
            let e = match source {
                TransportError::BitrateRejected(_) => DeviceError::BitrateRejected {
                    bitrate: self.bitrate,
                    source,
                },
                other => DeviceError::Configure(other),
            };
            return Err(fail(&mut inner, e));
        }
        inner.bus = Some(bus);
        Ok(())
    }

    /// Put the configured adapter into normal mode.
    pub fn start(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        if inner.state != DeviceState::Configuring {
            return Err(DeviceError::NotConfigured);
        }
        let Some(bus) = inner.bus.as_mut() else {
            return Err(DeviceError::NotConfigured);
        };
        match bus.start() {
            Ok(()) => {
                inner.state = DeviceState::Running;
                inner.failed = false;
                Ok(())
            }
            Err(e) => Err(fail(&mut inner, DeviceError::Start(e))),
        }
    }

    /// Discover, configure and start from scratch. Any handle held before is released first.
    pub fn acquire(&self) -> Result<BusInfo, DeviceError> {
        let adapter = self.discover()?;
        self.configure(&adapter)?;
        self.start()?;
        info!(
            adapter = %adapter.name,
            driver = self.driver.name(),
            bitrate = self.bitrate,
            "CAN adapter started in normal mode"
        );
        Ok(adapter)
    }

    /// Wait up to `timeout` for a frame. `Ok(None)` means nothing arrived in time.
    pub fn read_frame(&self, timeout: Duration) -> Result<Option<CanFrame>, DeviceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let slice = left.min(READ_SLICE).max(Duration::from_millis(1));
            let mut inner = self.inner.lock();
            let bus = running_bus(&mut inner)?;
            match bus.recv(Some(slice.as_millis() as u64)) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) if e.is_timeout() => {}
                Err(e) => return Err(DeviceError::Read(e)),
            }
            // Hand the adapter to a waiting sender before polling again
            MutexGuard::unlock_fair(inner);
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    pub fn send_frame(&self, frame: &CanFrame) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        running_bus(&mut inner)?
            .send(frame)
            .map_err(DeviceError::Send)
    }

    /// Release the adapter. Idempotent, and safe on a session that never started.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        release(&mut inner);
        inner.state = DeviceState::Stopped;
        inner.failed = false;
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        release(self.inner.get_mut());
    }
}

fn running_bus(inner: &mut DeviceInner) -> Result<&mut Box<dyn CanBus>, DeviceError> {
    match (inner.state, inner.bus.as_mut()) {
        (DeviceState::Running, Some(bus)) => Ok(bus),
        _ => Err(DeviceError::NotRunning),
    }
}

fn release(inner: &mut DeviceInner) {
    if let Some(mut bus) = inner.bus.take() {
        if let Err(e) = bus.stop() {
            warn!(error = %e, "adapter did not stop cleanly");
        }
        if let Some(adapter) = &inner.adapter {
            debug!(adapter = %adapter.name, "adapter released");
        }
    }
}

fn fail(inner: &mut DeviceInner, e: DeviceError) -> DeviceError {
    release(inner);
    inner.state = DeviceState::Idle;
    inner.failed = true;
    e
}
