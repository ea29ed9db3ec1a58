use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::broker::message::{InboundMessage, Payload, QoS};
use crate::broker::topic::{topic_matches, validate_filter, validate_topic};
use crate::config::BrokerEndpoint;
use crate::persistence::{NewRecord, STORE_DEADLINE, Store, with_deadline};
use crate::stats::RelayStats;
use crate::transport::{
    EventReceiver, InboundPublish, Transport, TransportEvent, TransportFactory,
};
use crate::utils::{Result, TransportError};

/// Callback invoked for every inbound message matching a subscription.
///
/// Runs on the session's receive path, so it must not block.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

struct Subscription {
    qos: QoS,
    handler: MessageHandler,
}

/// Runtime wrapper around one broker endpoint: its transport, the tracked
/// subscription set and the task that routes inbound messages.
pub struct ClientSession {
    endpoint: BrokerEndpoint,
    transport: Arc<dyn Transport>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    store: Option<Arc<dyn Store>>,
    stats: Arc<RelayStats>,
}

impl ClientSession {
    /// Builds the transport and starts the event pump. Must be called from
    /// within a tokio runtime.
    pub fn start(
        endpoint: BrokerEndpoint,
        factory: &dyn TransportFactory,
        store: Option<Arc<dyn Store>>,
        stats: Arc<RelayStats>,
    ) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = factory.build(&endpoint, events_tx)?;
        let session = Arc::new(Self {
            endpoint,
            transport,
            subscriptions: Mutex::new(HashMap::new()),
            store,
            stats,
        });
        tokio::spawn(pump(Arc::downgrade(&session), events_rx));
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Connects unless already connected.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.stats.increment_connection_attempts();
        if let Err(err) = self.transport.connect().await {
            self.stats.increment_connection_failures();
            return Err(err);
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.transport.disconnect().await
    }

    /// Publishes `payload` and, once the transport has accepted it, appends
    /// an unconfirmed outbox record in the background. An outbox failure is
    /// logged and never fails the publish.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: impl Into<Payload>,
    ) -> Result<()> {
        validate_topic(topic)?;
        let bytes = payload.into().to_bytes()?;

        if !self.is_connected() {
            self.stats.increment_publish_failures();
            return Err(TransportError::NotConnected.into());
        }

        let started = Instant::now();
        if let Err(err) = self
            .transport
            .publish(topic, qos, retained, bytes.clone())
            .await
        {
            self.stats.increment_publish_failures();
            return Err(err);
        }
        self.stats.record_publish_latency(started.elapsed());
        self.stats.increment_published();
        debug!(broker = %self.name(), topic, "published");

        if let Some(store) = &self.store {
            let store = store.clone();
            let record = NewRecord::new(topic, Payload::Binary(bytes))
                .with_qos(qos)
                .with_retained(retained);
            let broker = self.name().to_string();
            let topic = topic.to_string();
            tokio::spawn(async move {
                if let Err(err) = with_deadline(STORE_DEADLINE, store.store(record)).await {
                    error!(%broker, %topic, error = %err, "failed to record published message");
                }
            });
        }
        Ok(())
    }

    /// Subscribes to `filter`; matching messages are handed to `handler`.
    /// Subscribing again to a tracked filter replaces its handler.
    pub async fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> Result<()> {
        validate_filter(filter)?;

        let started = Instant::now();
        self.transport.subscribe(filter, qos).await?;
        self.stats.record_subscribe_latency(started.elapsed());

        let previous = self
            .lock_subscriptions()
            .insert(filter.to_string(), Subscription { qos, handler });
        if previous.is_none() {
            self.stats.increment_subscriptions();
        }
        info!(broker = %self.name(), filter, ?qos, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.transport.unsubscribe(filter).await?;
        if self.lock_subscriptions().remove(filter).is_some() {
            self.stats.decrement_subscriptions();
        }
        info!(broker = %self.name(), filter, "unsubscribed");
        Ok(())
    }

    /// Replays every tracked subscription against the transport, stopping at
    /// the first failure.
    pub async fn resubscribe_all(&self) -> Result<()> {
        let filters: Vec<(String, QoS)> = self
            .lock_subscriptions()
            .iter()
            .map(|(filter, sub)| (filter.clone(), sub.qos))
            .collect();

        for (filter, qos) in &filters {
            self.transport.subscribe(filter, *qos).await?;
        }
        info!(broker = %self.name(), count = filters.len(), "resubscribed");
        Ok(())
    }

    /// Tracked subscription filters, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.lock_subscriptions().keys().cloned().collect();
        filters.sort();
        filters
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, publish: InboundPublish) {
        let handlers: Vec<MessageHandler> = self
            .lock_subscriptions()
            .iter()
            .filter(|(filter, _)| topic_matches(&publish.topic, filter))
            .map(|(_, sub)| sub.handler.clone())
            .collect();
        if handlers.is_empty() {
            debug!(broker = %self.name(), topic = %publish.topic, "no subscription matches");
            return;
        }

        self.stats.increment_received();
        let message = InboundMessage {
            broker: self.name().to_string(),
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retained: publish.retained,
            received_at: Utc::now(),
        };
        for handler in handlers {
            handler(message.clone());
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("broker", &self.endpoint.name)
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}

/// Applies transport events to the session until the transport goes away.
async fn pump(session: Weak<ClientSession>, mut events: EventReceiver) {
    let mut connected_before = false;

    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Connected { session_present } => {
                session.stats.increment_connection_successes();
                if connected_before && !session_present {
                    tokio::spawn(async move {
                        if let Err(err) = session.resubscribe_all().await {
                            warn!(broker = %session.name(), error = %err, "resubscribe failed");
                        }
                    });
                }
                connected_before = true;
            }
            TransportEvent::ConnectionLost(reason) => {
                warn!(broker = %session.name(), %reason, "connection lost");
                session.stats.increment_disconnections();
            }
            TransportEvent::Reconnecting => {
                session.stats.increment_connection_attempts();
            }
            TransportEvent::Message(publish) => session.route(publish),
        }
    }
}
