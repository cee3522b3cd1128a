//! can-transport: device-level CAN adapter abstractions
//!
//! This crate describes what the bridge needs from a USB-CAN adapter: discovery, bitrate
//! configuration, start/stop and blocking frame I/O. Backends are feature-gated. The default
//! build enables a `mock` backend so that binaries and tests run on any host without hardware.

mod types;
pub use types::{BusInfo, CanFrame, CanId, Timestamp, MAX_DATA_LEN};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::{CanBus, CanDriver};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBus, MockDriver};

#[cfg(feature = "slcan")]
mod slcan;

#[cfg(feature = "slcan")]
pub use slcan::{SlcanBitrate, SlcanBus, SlcanDriver};
