//! can-bridge: relays frames between a USB-CAN adapter and an MQTT broker
//!
//! Frames read from the bus are published as JSON to a receive topic; JSON messages on a
//! transmit topic are sent on the bus. The [`DeviceSession`] owns the adapter, the
//! [`BrokerSession`] owns the broker connection, and the [`BridgeController`] runs both.

pub mod bridge;
pub mod broker;
pub mod clock;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod mqtt;
pub mod state;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use bridge::{BridgeController, StatsSnapshot};
pub use broker::{
    BrokerClient, BrokerConnector, BrokerEvent, BrokerEvents, BrokerLink, BrokerOptions,
    BrokerSession, InboundMessage,
};
pub use clock::{Backoff, Clock, ManualClock, SystemClock};
pub use codec::BridgeMessage;
pub use config::{BridgeConfig, ConfigSource};
pub use device::{DeviceSession, DeviceState};
pub use error::{BridgeError, BrokerError, ConfigError, DecodeError, DeviceError, Result};
pub use mqtt::RumqttConnector;
pub use state::ConnectionState;

#[cfg(any(test, feature = "mock"))]
pub use mock::MockBroker;
