use crate::{BusInfo, CanFrame, Result};

/// Adapter discovery for one backend.
pub trait CanDriver: Send + Sync {
    /// Backend name used in logs (e.g. "mock", "slcan").
    fn name(&self) -> &str;

    /// Enumerate attached adapters, in discovery order.
    fn scan(&self) -> Result<Vec<BusInfo>>;

    /// Open a previously discovered adapter. The returned bus is not yet started.
    fn open(&self, info: &BusInfo) -> Result<Box<dyn CanBus>>;
}

/// A minimal blocking CAN adapter handle.
pub trait CanBus: Send {
    /// Set the bus bitrate in bit/s. Must be called before [`CanBus::start`].
    fn set_bitrate(&mut self, bitrate: u32) -> Result<()>;

    /// Put the adapter into normal (active) mode.
    fn start(&mut self) -> Result<()>;

    /// Receive one frame (blocking with optional timeout in milliseconds).
    ///
    /// Returns [`crate::TransportError::Timeout`] when nothing arrived in time.
    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame>;

    /// Send one frame.
    fn send(&mut self, frame: &CanFrame) -> Result<()>;

    /// Leave the bus. Calling it on a stopped adapter is a no-op.
    fn stop(&mut self) -> Result<()>;
}
