use crate::broker::{
    BrokerClient, BrokerConnector, BrokerEvent, BrokerEvents, BrokerLink, BrokerOptions,
    InboundMessage,
};
use crate::error::BrokerError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker transport backed by `rumqttc`. Every connect builds a fresh client and event loop,
/// so reconnect policy stays with the session.
#[derive(Debug, Default, Clone)]
pub struct RumqttConnector;

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn connect(&self, options: &BrokerOptions) -> Result<BrokerLink, BrokerError> {
        let mut mqtt_options =
            MqttOptions::new(&options.client_id, &options.host, options.port);
        mqtt_options.set_credentials(&options.username, &options.password);
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let handshake = wait_for_connack(&mut eventloop);
        tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| BrokerError::Connect("timed out waiting for CONNACK".to_string()))??;

        Ok(BrokerLink {
            client: Arc::new(RumqttClient { client }),
            events: Box::new(RumqttEvents { eventloop }),
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(BrokerError::Connect(format!("broker refused: {code:?}"))),
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(BrokerError::Connect(e.to_string())),
        }
    }
}

struct RumqttClient {
    client: AsyncClient,
}

impl BrokerClient for RumqttClient {
    fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        self.client
            .try_disconnect()
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))
    }
}

struct RumqttEvents {
    eventloop: EventLoop,
}

#[async_trait]
impl BrokerEvents for RumqttEvents {
    async fn poll(&mut self) -> Result<BrokerEvent, BrokerError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                Ok(BrokerEvent::Message(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                }))
            }
            Ok(_) => Ok(BrokerEvent::Other),
            Err(e) => Err(BrokerError::ConnectionLost(e.to_string())),
        }
    }
}
