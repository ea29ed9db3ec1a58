//! The `transport` module is responsible for network communication with MQTT
//! brokers.
//!
//! Sessions only ever see the [`Transport`] capability: connect, disconnect,
//! publish, subscribe, unsubscribe and a connected flag. Lifecycle changes
//! and inbound publishes travel the other way as [`TransportEvent`]s over an
//! unbounded channel, so the network loop never waits on a consumer.
//!
//! [`MqttTransport`] implements the capability on top of `rumqttc`; the
//! [`TransportFactory`] seam lets the supervisor be driven by other
//! implementations in tests.

pub mod mqtt;
pub mod tls;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::message::QoS;
use crate::config::BrokerEndpoint;
use crate::utils::Result;

pub use mqtt::{MqttTransport, MqttTransportFactory};

/// A publish received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
}

/// Connection lifecycle and traffic reported by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker accepted the connection.
    Connected { session_present: bool },
    /// An established connection dropped.
    ConnectionLost(String),
    /// The transport is about to retry the connection.
    Reconnecting,
    Message(InboundPublish),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// What a session needs from an MQTT client.
///
/// Each call returns once the transport has accepted the request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: Vec<u8>)
    -> Result<()>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Builds one transport per broker endpoint.
pub trait TransportFactory: Send + Sync {
    fn build(&self, endpoint: &BrokerEndpoint, events: EventSender) -> Result<Arc<dyn Transport>>;
}
