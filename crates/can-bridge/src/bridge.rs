//! Bridge controller: composes the device and broker sessions.
//!
//! Broker connect and device acquisition start independently, so neither delays the other.
//! Two loops then make progress concurrently:
//! - the CAN relay (blocking worker): read a frame, encode it, publish to the receive topic;
//! - the inbound dispatch (owned by the broker session): decode a message from the transmit
//!   topic and send it on the bus.
//!
//! Shutdown stops the relay, then the device, then the broker, each step best-effort.

use crate::broker::{BrokerConnector, BrokerSession, InboundMessage};
use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::config::BridgeConfig;
use crate::device::DeviceSession;
use crate::error::{BridgeError, BrokerError, DeviceError, Result};
use can_transport::{CanDriver, CanFrame};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on a single blocking read, and so on shutdown latency of the relay.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Wait before rediscovering the adapter after a failed or lost device session.
pub const DEVICE_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct BridgeStats {
    frames_received: AtomicU64,
    frames_published: AtomicU64,
    frames_dropped: AtomicU64,
    messages_rejected: AtomicU64,
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
}

/// Traffic counters since the controller was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames read from the bus.
    pub frames_received: u64,
    pub frames_published: u64,
    /// Frames read from the bus that could not be published.
    pub frames_dropped: u64,
    /// Inbound messages discarded as malformed.
    pub messages_rejected: u64,
    /// Frames transmitted on the bus.
    pub frames_sent: u64,
    pub send_failures: u64,
}

impl BridgeStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct BridgeController {
    device: Arc<DeviceSession>,
    broker: Arc<BrokerSession>,
    rx_topic: String,
    tx_topic: String,
    clock: Arc<dyn Clock>,
    read_timeout: Duration,
    device_retry: Duration,
    shutdown: CancellationToken,
    stats: Arc<BridgeStats>,
    running: AtomicBool,
}

impl BridgeController {
    pub fn new(
        config: &BridgeConfig,
        driver: Arc<dyn CanDriver>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        let device = Arc::new(DeviceSession::new(driver, config.bitrate));
        let broker = Arc::new(BrokerSession::new(
            connector,
            config.broker_options(),
            config.tx_topic.clone(),
        ));
        Self {
            device,
            broker,
            rx_topic: config.rx_topic.clone(),
            tx_topic: config.tx_topic.clone(),
            clock: Arc::new(SystemClock),
            read_timeout: READ_TIMEOUT,
            device_retry: DEVICE_RETRY,
            shutdown: CancellationToken::new(),
            stats: Arc::new(BridgeStats::default()),
            running: AtomicBool::new(false),
        }
    }

    /// Clock used for device retry delays.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn device(&self) -> &Arc<DeviceSession> {
        &self.device
    }

    pub fn broker(&self) -> &Arc<BrokerSession> {
        &self.broker
    }

    /// Cancelling this token shuts the bridge down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run until the shutdown token fires or the device reports a fatal error.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyRunning);
        }
        info!(
            rx_topic = %self.rx_topic,
            tx_topic = %self.tx_topic,
            "starting CAN/MQTT bridge"
        );

        let inbound = Inbound {
            device: Arc::clone(&self.device),
            stats: Arc::clone(&self.stats),
            tx_topic: self.tx_topic.clone(),
        };
        self.broker.on_message(move |msg| inbound.handle(msg));
        self.broker.start();

        let relay = Relay {
            device: Arc::clone(&self.device),
            broker: Arc::clone(&self.broker),
            clock: Arc::clone(&self.clock),
            rx_topic: self.rx_topic.clone(),
            read_timeout: self.read_timeout,
            device_retry: self.device_retry,
            cancel: self.shutdown.clone(),
            stats: Arc::clone(&self.stats),
        };
        let mut reader = tokio::task::spawn_blocking(move || relay.run());

        let finished = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            joined = &mut reader => Some(joined),
        };

        info!("shutting down bridge");
        self.shutdown.cancel();
        // The relay notices cancellation within one read timeout
        let joined = match finished {
            Some(joined) => joined,
            None => reader.await,
        };
        let result = match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::FatalDevice(e)),
            Err(e) => Err(BridgeError::Worker(e.to_string())),
        };
        self.device.stop();
        self.broker.disconnect().await;

        let stats = self.stats.snapshot();
        info!(?stats, "bridge stopped");
        self.running.store(false, Ordering::SeqCst);
        result
    }
}

/// MQTT to CAN path, run by the broker session's dispatch worker.
struct Inbound {
    device: Arc<DeviceSession>,
    stats: Arc<BridgeStats>,
    tx_topic: String,
}

impl Inbound {
    fn handle(&self, msg: InboundMessage) {
        if msg.topic != self.tx_topic {
            debug!(topic = %msg.topic, "ignoring message on unexpected topic");
            return;
        }
        let frame = match codec::from_payload(&msg.payload) {
            Ok(frame) => frame,
            Err(e) => {
                BridgeStats::bump(&self.stats.messages_rejected);
                warn!(error = %e, topic = %msg.topic, "discarding malformed bridge message");
                return;
            }
        };
        match self.device.send_frame(&frame) {
            Ok(()) => {
                BridgeStats::bump(&self.stats.frames_sent);
                debug!(frame = %frame, "sent CAN frame");
            }
            Err(e) => {
                BridgeStats::bump(&self.stats.send_failures);
                warn!(error = %e, frame = %frame, "failed to send CAN frame");
            }
        }
    }
}

/// CAN to MQTT path, run on a blocking worker.
struct Relay {
    device: Arc<DeviceSession>,
    broker: Arc<BrokerSession>,
    clock: Arc<dyn Clock>,
    rx_topic: String,
    read_timeout: Duration,
    device_retry: Duration,
    cancel: CancellationToken,
    stats: Arc<BridgeStats>,
}

impl Relay {
    /// Returns only on cancellation or a fatal device error.
    fn run(self) -> Result<(), DeviceError> {
        while !self.cancel.is_cancelled() {
            match self.device.acquire() {
                Ok(_) => self.relay_frames(),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "CAN adapter configuration failed");
                    return Err(e);
                }
                Err(DeviceError::NotFound) => warn!("no CAN adapter found, retrying"),
                Err(e) => warn!(error = %e, "CAN adapter unavailable, retrying"),
            }
            if !self.clock.sleep(self.device_retry, &self.cancel) {
                break;
            }
        }
        Ok(())
    }

    /// Relay until cancelled or the device session fails.
    fn relay_frames(&self) {
        while !self.cancel.is_cancelled() {
            match self.device.read_frame(self.read_timeout) {
                Ok(Some(frame)) => self.publish(frame),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "CAN read failed, releasing adapter");
                    self.device.stop();
                    return;
                }
            }
        }
    }

    fn publish(&self, frame: CanFrame) {
        BridgeStats::bump(&self.stats.frames_received);
        debug!(frame = %frame, "CAN frame received");
        match self.broker.publish(&self.rx_topic, codec::to_payload(&frame)) {
            Ok(()) => BridgeStats::bump(&self.stats.frames_published),
            Err(BrokerError::NotConnected) => {
                BridgeStats::bump(&self.stats.frames_dropped);
                debug!(frame = %frame, "broker not connected, frame dropped");
            }
            Err(e) => {
                BridgeStats::bump(&self.stats.frames_dropped);
                warn!(error = %e, frame = %frame, "failed to publish CAN frame");
            }
        }
    }
}
