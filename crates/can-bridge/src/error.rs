use can_transport::TransportError;
use thiserror::Error;

pub type Result<T, E = BridgeError> = core::result::Result<T, E>;

/// Malformed bridge message. Discarded per message, never affects session state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not a bridge message: {0}")]
    Payload(String),
    #[error("invalid frame id {0:?}")]
    Id(String),
    #[error("frame id {0:#x} out of range")]
    IdRange(u32),
    #[error("invalid data hex {0:?}")]
    Data(String),
    #[error("data is {0} bytes, at most 8 allowed")]
    DataTooLong(usize),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no CAN adapter found")]
    NotFound,
    #[error("adapter scan failed: {0}")]
    Scan(#[source] TransportError),
    #[error("cannot open adapter {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: TransportError,
    },
    #[error("adapter rejected bitrate {bitrate}: {source}")]
    BitrateRejected {
        bitrate: u32,
        #[source]
        source: TransportError,
    },
    #[error("cannot configure adapter: {0}")]
    Configure(#[source] TransportError),
    #[error("adapter must be configured before it is started")]
    NotConfigured,
    #[error("cannot start adapter: {0}")]
    Start(#[source] TransportError),
    #[error("read failed: {0}")]
    Read(#[source] TransportError),
    #[error("send failed: {0}")]
    Send(#[source] TransportError),
    #[error("device session is not running")]
    NotRunning,
}

impl DeviceError {
    /// Continuing with a misconfigured bus is unsafe; everything else is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::BitrateRejected { .. })
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("cannot connect to broker: {0}")]
    Connect(String),
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("not connected to broker")]
    NotConnected,
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("cannot read {path}: {reason}")]
    Source { path: String, reason: String },
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("fatal device error: {0}")]
    FatalDevice(#[source] DeviceError),
    #[error("worker task failed: {0}")]
    Worker(String),
    #[error("bridge already running")]
    AlreadyRunning,
}
