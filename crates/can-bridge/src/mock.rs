//! Scriptable in-process broker for tests and offline runs.

use crate::broker::{
    BrokerClient, BrokerConnector, BrokerEvent, BrokerEvents, BrokerLink, BrokerOptions,
    InboundMessage,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

type EventTx = mpsc::UnboundedSender<Result<BrokerEvent, BrokerError>>;

/// Clones share state: keep one to script failures and inspect traffic.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockBrokerState>>,
}

#[derive(Default)]
struct MockBrokerState {
    failing_connects: usize,
    attempts: usize,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    publish_error: Option<String>,
    disconnects: usize,
    events: Option<EventTx>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_connects(&self, n: usize) {
        self.state.lock().failing_connects = n;
    }

    /// Make publishes fail until cleared with `None`.
    pub fn fail_publishes(&self, reason: Option<&str>) {
        self.state.lock().publish_error = reason.map(str::to_string);
    }

    /// Push a message to the live connection. Returns `false` when nobody is connected.
    pub fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let msg = InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        };
        match &self.state.lock().events {
            Some(tx) => tx.send(Ok(BrokerEvent::Message(msg))).is_ok(),
            None => false,
        }
    }

    /// Sever the live connection as a transport failure would.
    pub fn drop_connection(&self, reason: &str) {
        if let Some(tx) = self.state.lock().events.take() {
            let _ = tx.send(Err(BrokerError::ConnectionLost(reason.to_string())));
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().published.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().events.is_some()
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(&self, options: &BrokerOptions) -> Result<BrokerLink, BrokerError> {
        let mut state = self.state.lock();
        state.attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::Connect(format!(
                "{}:{} refused the connection",
                options.host, options.port
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.events = Some(tx);
        Ok(BrokerLink {
            client: Arc::new(MockClient {
                state: Arc::clone(&self.state),
            }),
            events: Box::new(MockEvents { rx }),
        })
    }
}

struct MockClient {
    state: Arc<Mutex<MockBrokerState>>,
}

impl BrokerClient for MockClient {
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.state.lock().subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.publish_error {
            return Err(BrokerError::Publish(reason.clone()));
        }
        state.published.push((topic.to_string(), payload));
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.disconnects += 1;
        // Dropping the sender ends the event stream
        state.events = None;
        Ok(())
    }
}

struct MockEvents {
    rx: mpsc::UnboundedReceiver<Result<BrokerEvent, BrokerError>>,
}

#[async_trait]
impl BrokerEvents for MockEvents {
    async fn poll(&mut self) -> Result<BrokerEvent, BrokerError> {
        match self.rx.recv().await {
            Some(event) => event,
            None => Err(BrokerError::ConnectionLost("connection closed".to_string())),
        }
    }
}
