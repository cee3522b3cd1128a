//! Broker session: owns one MQTT connection, its reconnect loop and inbound delivery.
//!
//! The session runs two workers once started. The network task connects with retry,
//! subscribes on every successful connect and pumps transport events. Inbound messages go
//! through a bounded queue to a blocking dispatch worker that runs the registered handler in
//! arrival order, so a slow handler never stalls keepalive traffic.
//!
//! Publishing fails fast with [`BrokerError::NotConnected`] while the session is not
//! connected; nothing is queued across a reconnect.

use crate::clock::Backoff;
use crate::error::BrokerError;
use crate::state::ConnectionState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between attempts until the first connection succeeds.
pub const CONNECT_RETRY: Duration = Duration::from_secs(1);
/// Bounds of the delay between attempts after an established connection dropped.
pub const RECONNECT_MIN: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX: Duration = Duration::from_secs(5);
/// Inbound messages buffered for the dispatch worker.
pub const INBOUND_QUEUE: usize = 256;
/// Time allowed for the transport to flush a disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Where and how to connect.
#[derive(Clone)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive: Duration,
}

impl fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Message(InboundMessage),
    /// Protocol traffic the bridge does not act on (acks, pings).
    Other,
}

/// Request side of a live broker connection. Calls enqueue and never wait on the network.
pub trait BrokerClient: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
    fn disconnect(&self) -> Result<(), BrokerError>;
}

/// Event side of a live broker connection.
#[async_trait]
pub trait BrokerEvents: Send {
    /// Next event. An error means the connection is gone.
    async fn poll(&mut self) -> Result<BrokerEvent, BrokerError>;
}

pub struct BrokerLink {
    pub client: Arc<dyn BrokerClient>,
    pub events: Box<dyn BrokerEvents>,
}

/// MQTT transport: establishes authenticated connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Resolves once the broker has accepted the session.
    async fn connect(&self, options: &BrokerOptions) -> Result<BrokerLink, BrokerError>;
}

pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

struct Link {
    state: ConnectionState,
    client: Option<Arc<dyn BrokerClient>>,
}

struct Workers {
    cancel: CancellationToken,
    network: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

pub struct BrokerSession {
    connector: Arc<dyn BrokerConnector>,
    options: BrokerOptions,
    subscribe_topic: String,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
    handler: Mutex<Option<MessageHandler>>,
    workers: Mutex<Option<Workers>>,
}

impl BrokerSession {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        options: BrokerOptions,
        subscribe_topic: impl Into<String>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            options,
            subscribe_topic: subscribe_topic.into(),
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                client: None,
            }),
            state_tx,
            handler: Mutex::new(None),
            workers: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Register the handler for inbound messages, replacing any previous one. It runs on the
    /// dispatch worker, once per message, in arrival order.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    /// Spawn the network task and the dispatch worker, then return immediately.
    /// Must be called inside a tokio runtime. Starting a started session is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            debug!("broker session already started");
            return;
        }
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let network = tokio::spawn(Arc::clone(self).run_network(tx, cancel.clone()));
        let session = Arc::clone(self);
        let dispatch = tokio::task::spawn_blocking(move || session.run_dispatch(rx));
        *workers = Some(Workers {
            cancel,
            network,
            dispatch,
        });
    }

    /// One connection attempt. On success the transmit topic is subscribed and the session
    /// is `Connected`; the returned events belong to the caller.
    pub async fn connect(&self) -> Result<Box<dyn BrokerEvents>, BrokerError> {
        self.set_link(ConnectionState::Connecting, None);
        info!(
            host = %self.options.host,
            port = self.options.port,
            user = %self.options.username,
            "connecting to MQTT broker"
        );
        let link = match self.connector.connect(&self.options).await {
            Ok(link) => link,
            Err(e) => {
                self.set_link(ConnectionState::Failed, None);
                return Err(e);
            }
        };
        if let Err(e) = link.client.subscribe(&self.subscribe_topic) {
            let _ = link.client.disconnect();
            self.set_link(ConnectionState::Failed, None);
            return Err(e);
        }
        info!(topic = %self.subscribe_topic, "connected to MQTT broker and subscribed");
        self.set_link(ConnectionState::Connected, Some(link.client));
        Ok(link.events)
    }

    /// Best-effort publish at the transport's default QoS.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        // Held across the enqueue so a reconnect cannot swap the client underneath
        let link = self.link.lock();
        match (&link.state, &link.client) {
            (ConnectionState::Connected, Some(client)) => client.publish(topic, payload),
            _ => Err(BrokerError::NotConnected),
        }
    }

    /// Stop both workers and release the connection. Idempotent.
    pub async fn disconnect(&self) {
        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            workers.cancel.cancel();
            if let Err(e) = workers.network.await {
                error!(error = %e, "MQTT network task ended abnormally");
            }
            // The queue sender lived in the network task, so the dispatcher drains and exits
            if let Err(e) = workers.dispatch.await {
                error!(error = %e, "MQTT dispatch worker ended abnormally");
            }
            info!("disconnected from MQTT broker");
        }
        self.set_link(ConnectionState::Disconnected, None);
    }

    fn set_link(&self, state: ConnectionState, client: Option<Arc<dyn BrokerClient>>) {
        let mut link = self.link.lock();
        link.state = state;
        link.client = client;
        self.state_tx.send_replace(state);
    }

    fn take_client(&self, state: ConnectionState) -> Option<Arc<dyn BrokerClient>> {
        let mut link = self.link.lock();
        link.state = state;
        self.state_tx.send_replace(state);
        link.client.take()
    }

    async fn run_network(self: Arc<Self>, tx: mpsc::Sender<InboundMessage>, cancel: CancellationToken) {
        let mut first_connect = Backoff::fixed(CONNECT_RETRY);
        let mut reconnect = Backoff::exponential(RECONNECT_MIN, RECONNECT_MAX);
        let mut was_connected = false;

        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.connect() => attempt,
            };
            let mut events = match attempt {
                Ok(events) => {
                    first_connect.reset();
                    reconnect.reset();
                    was_connected = true;
                    events
                }
                Err(e) => {
                    let backoff = if was_connected {
                        &mut reconnect
                    } else {
                        &mut first_connect
                    };
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "MQTT connect failed"
                    );
                    if !sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let lost = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break None,
                    event = events.poll() => match event {
                        Ok(BrokerEvent::Message(msg)) => forward(&tx, msg),
                        Ok(BrokerEvent::Other) => {}
                        Err(e) => break Some(e),
                    },
                }
            };

            match lost {
                None => {
                    self.close(events).await;
                    break;
                }
                Some(e) => {
                    self.take_client(ConnectionState::Failed);
                    let delay = reconnect.next_delay();
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "MQTT connection lost"
                    );
                    if !sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                }
            }
        }
        self.set_link(ConnectionState::Disconnected, None);
    }

    /// Send a disconnect and let the transport flush it.
    async fn close(&self, mut events: Box<dyn BrokerEvents>) {
        let Some(client) = self.take_client(ConnectionState::Disconnected) else {
            return;
        };
        if let Err(e) = client.disconnect() {
            warn!(error = %e, "MQTT disconnect request failed");
            return;
        }
        let drain = async { while events.poll().await.is_ok() {} };
        if tokio::time::timeout(DISCONNECT_GRACE, drain).await.is_err() {
            debug!("MQTT disconnect not acknowledged in time");
        }
    }

    fn run_dispatch(&self, mut rx: mpsc::Receiver<InboundMessage>) {
        while let Some(msg) = rx.blocking_recv() {
            let handler = self.handler.lock().clone();
            match handler {
                Some(handler) => handler(msg),
                None => debug!(topic = %msg.topic, "no handler registered, message dropped"),
            }
        }
    }
}

fn forward(tx: &mpsc::Sender<InboundMessage>, msg: InboundMessage) {
    match tx.try_send(msg) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(msg)) => {
            warn!(topic = %msg.topic, "inbound queue full, message dropped");
        }
        Err(mpsc::error::TrySendError::Closed(msg)) => {
            debug!(topic = %msg.topic, "dispatch worker gone, message dropped");
        }
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBroker;
    use std::sync::mpsc as std_mpsc;

    fn options() -> BrokerOptions {
        BrokerOptions {
            host: "localhost".to_string(),
            port: 1883,
            username: "mqtt".to_string(),
            password: "secret".to_string(),
            client_id: "test".to_string(),
            keep_alive: Duration::from_secs(60),
        }
    }

    fn session(broker: &MockBroker) -> Arc<BrokerSession> {
        Arc::new(BrokerSession::new(
            Arc::new(broker.clone()),
            options(),
            "can/tx",
        ))
    }

    async fn wait_for(session: &BrokerSession, want: ConnectionState) {
        let mut rx = session.watch_state();
        rx.wait_for(|s| *s == want).await.unwrap();
    }

    #[test]
    fn test_options_debug_redacts_password() {
        let dbg = format!("{:?}", options());
        assert!(!dbg.contains("secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_subscribes_once() {
        let broker = MockBroker::new();
        broker.fail_connects(2);
        let session = session(&broker);
        session.start();
        wait_for(&session, ConnectionState::Connected).await;
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(broker.subscriptions(), vec!["can/tx".to_string()]);
        session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_reports_failed_state() {
        let broker = MockBroker::new();
        broker.fail_connects(1);
        let session = session(&broker);
        assert!(session.connect().await.is_err());
        assert_eq!(session.state(), ConnectionState::Failed);
        assert!(session.connect().await.is_ok());
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_fails_fast_while_not_connected() {
        let broker = MockBroker::new();
        broker.fail_connects(usize::MAX);
        let session = session(&broker);
        assert!(matches!(
            session.publish("can/rx", b"x".to_vec()),
            Err(BrokerError::NotConnected)
        ));
        session.start();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(
            session.publish("can/rx", b"x".to_vec()),
            Err(BrokerError::NotConnected)
        ));
        assert!(broker.published().is_empty());
        session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_and_resubscribes_after_drop() {
        let broker = MockBroker::new();
        let session = session(&broker);
        session.start();
        wait_for(&session, ConnectionState::Connected).await;
        session.publish("can/rx", b"one".to_vec()).unwrap();

        broker.drop_connection("broker restarted");
        wait_for(&session, ConnectionState::Failed).await;
        assert!(matches!(
            session.publish("can/rx", b"lost".to_vec()),
            Err(BrokerError::NotConnected)
        ));

        wait_for(&session, ConnectionState::Connected).await;
        session.publish("can/rx", b"two".to_vec()).unwrap();
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.subscriptions().len(), 2);
        let payloads: Vec<Vec<u8>> = broker.published().into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
        session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delay_grows_and_is_capped() {
        let broker = MockBroker::new();
        let session = session(&broker);
        session.start();
        wait_for(&session, ConnectionState::Connected).await;

        broker.fail_connects(3);
        broker.drop_connection("gone");
        let dropped_at = tokio::time::Instant::now();
        wait_for(&session, ConnectionState::Failed).await;
        // 1 s after the drop, then 2, 4 and a capped 5 between the failed attempts
        wait_for(&session, ConnectionState::Connected).await;
        let elapsed = dropped_at.elapsed();
        assert!(elapsed >= Duration::from_secs(12), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(13), "{elapsed:?}");
        assert_eq!(broker.connect_attempts(), 5);
        session.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_messages_dispatched_in_arrival_order() {
        let broker = MockBroker::new();
        let session = session(&broker);
        let (tx, rx) = std_mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        session.on_message(move |msg| {
            let _ = tx.lock().map(|tx| tx.send(msg.payload));
        });
        session.start();
        wait_for(&session, ConnectionState::Connected).await;
        for i in 0..10u8 {
            assert!(broker.deliver("can/tx", vec![i]));
        }
        let got: Vec<u8> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap()[0])
            .collect();
        assert_eq!(got, (0..10).collect::<Vec<u8>>());
        session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let broker = MockBroker::new();
        let session = session(&broker);
        session.disconnect().await;
        session.start();
        wait_for(&session, ConnectionState::Connected).await;
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(broker.disconnects(), 1);
        assert!(matches!(
            session.publish("can/rx", vec![]),
            Err(BrokerError::NotConnected)
        ));
    }
}
