//! In-memory transport used to drive sessions without a broker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{EventSender, InboundPublish, Transport, TransportEvent, TransportFactory};
use crate::broker::message::QoS;
use crate::config::BrokerEndpoint;
use crate::utils::{Result, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub retained: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct MockTransport {
    pub broker: String,
    events: EventSender,
    connected: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub published: Mutex<Vec<Published>>,
    pub subscribed: Mutex<Vec<(String, QoS)>>,
    pub unsubscribed: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new(broker: &str, events: EventSender) -> Self {
        Self {
            broker: broker.to_string(),
            events,
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
        }
    }

    /// Delivers a publish as if it came from the broker.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        let _ = self.events.send(TransportEvent::Message(InboundPublish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: QoS::AtMostOnce,
            retained: false,
        }));
    }

    /// Simulates a dropped connection followed by an automatic reconnect.
    pub fn bounce(&self, session_present: bool) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .events
            .send(TransportEvent::ConnectionLost("simulated".to_string()));
        let _ = self.events.send(TransportEvent::Reconnecting);
        self.connected.store(true, Ordering::SeqCst);
        let _ = self
            .events
            .send(TransportEvent::Connected { session_present });
    }

    pub fn subscribed_filters(&self) -> Vec<String> {
        self.subscribed
            .lock()
            .unwrap()
            .iter()
            .map(|(filter, _)| filter.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("mock refused".to_string()).into());
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Connected {
            session_present: false,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            qos,
            retained,
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("mock subscribe refused".to_string()).into());
        }
        self.subscribed
            .lock()
            .unwrap()
            .push((filter.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        self.unsubscribed.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Records every transport it builds.
#[derive(Debug, Default)]
pub struct MockFactory {
    pub builds: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn transport(&self, broker: &str) -> Arc<MockTransport> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.broker == broker)
            .cloned()
            .unwrap()
    }
}

impl TransportFactory for MockFactory {
    fn build(&self, endpoint: &BrokerEndpoint, events: EventSender) -> Result<Arc<dyn Transport>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(MockTransport::new(&endpoint.name, events));
        transport
            .fail_connect
            .store(self.fail_connect.load(Ordering::SeqCst), Ordering::SeqCst);
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}
